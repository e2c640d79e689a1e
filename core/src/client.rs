// MonkeyClient: the public entry point
//
// Owns the session, key store and connection for one identity. Several
// clients can coexist in one process; nothing here is global.

use crate::config::ClientConfig;
use crate::connection::ConnectionManager;
use crate::crypto::compress::GZIP;
use crate::crypto::{
    AesCbcCipher, Cipher, Compressor, GzipCompressor, KeyExchange, RsaKeyExchange,
};
use crate::dispatcher::{KeyRefresh, MessageDispatcher};
use crate::events::{ChannelDelegate, EventDelegate, EventEmitter, MonkeyEvent};
use crate::keystore::KeyStore;
use crate::message::codec::value_as_i64;
use crate::message::{FileType, Frame, Message, ProtocolCommand, ProtocolError, ProtocolType};
use crate::outbox::Outbox;
use crate::push::PushSpec;
use crate::session::{Session, SessionManager, SessionState, SharedSession};
use crate::transport::{
    HttpRequest, HttpTransport, ReqwestTransport, SocketConnector, TungsteniteConnector,
};
use crate::{MonkeyError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The external collaborators a client runs on
#[derive(Clone)]
pub struct Capabilities {
    pub http: Arc<dyn HttpTransport>,
    pub connector: Arc<dyn SocketConnector>,
    pub cipher: Arc<dyn Cipher>,
    pub compressor: Arc<dyn Compressor>,
    pub exchange: Arc<dyn KeyExchange>,
}

impl Capabilities {
    /// reqwest, tokio-tungstenite, AES-CBC, gzip and RSA
    pub fn production(config: &ClientConfig) -> Result<Self> {
        let http = ReqwestTransport::new(
            config.http_base_url(),
            config.app_key.clone(),
            config.secret_key.clone(),
            config.http_timeout(),
        )?;

        Ok(Self {
            http: Arc::new(http),
            connector: Arc::new(TungsteniteConnector::new()),
            cipher: Arc::new(AesCbcCipher::new()),
            compressor: Arc::new(GzipCompressor::new()),
            exchange: Arc::new(RsaKeyExchange::new()),
        })
    }
}

/// Outgoing file description for [`MonkeyClient::send_file`]
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub data: Vec<u8>,
    pub filename: String,
    pub mime_type: Option<String>,
    pub file_type: FileType,
    pub params: Value,
    pub push: PushSpec,
    pub encrypt: bool,
}

impl FileUpload {
    pub fn new(data: Vec<u8>, filename: impl Into<String>, file_type: FileType) -> Self {
        Self {
            data,
            filename: filename.into(),
            mime_type: None,
            file_type,
            params: Value::Null,
            push: PushSpec::None,
            encrypt: false,
        }
    }
}

pub struct MonkeyClient {
    config: Arc<ClientConfig>,
    http: Arc<dyn HttpTransport>,
    cipher: Arc<dyn Cipher>,
    compressor: Arc<dyn Compressor>,
    session: SharedSession,
    keys: Arc<KeyStore>,
    events: Arc<EventEmitter>,
    outbox: Arc<Outbox>,
    sessions: Arc<SessionManager>,
    dispatcher: Arc<MessageDispatcher>,
    connection: Arc<ConnectionManager>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl MonkeyClient {
    pub fn new(config: ClientConfig, capabilities: Capabilities) -> Self {
        let config = Arc::new(config);
        let session = Session::shared(config.user_object.clone(), config.expiring);
        let keys = Arc::new(KeyStore::new());
        let events = Arc::new(EventEmitter::new());
        let outbox = Arc::new(Outbox::new());

        let sessions = Arc::new(SessionManager::new(
            config.clone(),
            session.clone(),
            keys.clone(),
            capabilities.http.clone(),
            capabilities.cipher.clone(),
            capabilities.exchange.clone(),
            events.clone(),
        ));
        let dispatcher = Arc::new(MessageDispatcher::new(
            session.clone(),
            keys.clone(),
            sessions.clone(),
            capabilities.cipher.clone(),
            capabilities.compressor.clone(),
            events.clone(),
            outbox.clone(),
        ));
        let connection = Arc::new(ConnectionManager::new(
            config.clone(),
            session.clone(),
            capabilities.connector.clone(),
            dispatcher.clone(),
            events.clone(),
        ));

        Self {
            config,
            http: capabilities.http,
            cipher: capabilities.cipher,
            compressor: capabilities.compressor,
            session,
            keys,
            events,
            outbox,
            sessions,
            dispatcher,
            connection,
            task: parking_lot::Mutex::new(None),
        }
    }

    /// Client backed by the real network adapters
    pub fn with_defaults(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let capabilities = Capabilities::production(&config)?;
        Ok(Self::new(config, capabilities))
    }

    pub fn set_delegate(&self, delegate: Arc<dyn EventDelegate>) {
        self.events.set_delegate(Some(delegate));
    }

    /// Route all events into a channel, replacing any delegate
    pub fn subscribe_events(&self) -> mpsc::UnboundedReceiver<MonkeyEvent> {
        let (delegate, rx) = ChannelDelegate::new();
        self.events.set_delegate(Some(Arc::new(delegate)));
        rx
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.read().session_id().map(str::to_string)
    }

    pub fn state(&self) -> SessionState {
        self.session.read().state()
    }

    pub fn is_online(&self) -> bool {
        self.connection.is_online()
    }

    /// `(last_timestamp, last_message_id)`
    pub fn high_water_marks(&self) -> (i64, i64) {
        let session = self.session.read();
        (session.last_timestamp(), session.last_message_id())
    }

    pub fn key_store(&self) -> &KeyStore {
        &self.keys
    }

    /// Messages sent but not yet acknowledged
    pub fn pending_outbound(&self) -> usize {
        self.outbox.len()
    }

    // ------------------------------------------------------------------
    // Session and socket
    // ------------------------------------------------------------------

    /// Run the handshake, then start the socket in the background. Returns
    /// the session id.
    pub async fn init(&self) -> Result<String> {
        self.config.validate()?;
        if let Some(task) = self.task.lock().as_ref() {
            if !task.is_finished() {
                return Err(MonkeyError::InvalidInput("client already initialized".into()));
            }
        }

        let session_id = self.sessions.start_session().await?;

        self.connection.reset();
        let connection = self.connection.clone();
        let id = session_id.clone();
        let handle = tokio::spawn(async move { connection.run(id).await });
        *self.task.lock() = Some(handle);

        info!(session_id = %session_id, "Client initialized");
        Ok(session_id)
    }

    /// Close the socket and stop reconnecting. Waits for the connection task.
    pub async fn disconnect(&self) {
        self.connection.disconnect();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Connection task ended abnormally");
            }
        }
    }

    /// Tell the server the conversation with `conversation_id` is open
    pub async fn open_conversation(&self, conversation_id: &str) -> Result<()> {
        self.connection.send_frame(&Frame::open(conversation_id)).await
    }

    /// Request the next page of messages past the high-water mark
    pub async fn get_pending_messages(&self) -> Result<()> {
        self.connection.request_pending().await
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Build a text message with a provisional id, optionally encrypted with
    /// this session's key
    pub fn prepare_message(
        &self,
        text: &str,
        recipient_id: &str,
        params: Option<Value>,
        encrypt: bool,
    ) -> Result<Message> {
        let mut message = self.outgoing(ProtocolCommand::Message, ProtocolType::Text, recipient_id)?;
        message.params = params.unwrap_or(Value::Null);
        message.text = Some(text.to_string());

        if encrypt {
            let own = self.sessions.own_key()?;
            message.encrypted_text = Some(self.cipher.encrypt(text.as_bytes(), &own)?);
            message.props.encr = 1;
        } else {
            message.encrypted_text = Some(text.to_string());
        }
        Ok(message)
    }

    pub async fn send_message(
        &self,
        text: &str,
        recipient_id: &str,
        params: Option<Value>,
        push: PushSpec,
    ) -> Result<Message> {
        let message = self.prepare_message(text, recipient_id, params, false)?;
        self.deliver(message, &push).await
    }

    pub async fn send_encrypted_message(
        &self,
        text: &str,
        recipient_id: &str,
        params: Option<Value>,
        push: PushSpec,
    ) -> Result<Message> {
        let message = self.prepare_message(text, recipient_id, params, true)?;
        self.deliver(message, &push).await
    }

    pub async fn send_notification(
        &self,
        recipient_id: &str,
        params: Value,
        push: PushSpec,
    ) -> Result<Message> {
        let mut message = self.outgoing(ProtocolCommand::Message, ProtocolType::Notif, recipient_id)?;
        message.params = params;
        self.deliver(message, &push).await
    }

    /// A notification the server does not store
    pub async fn send_temporal_notification(
        &self,
        recipient_id: &str,
        params: Value,
        push: PushSpec,
    ) -> Result<Message> {
        let mut message =
            self.outgoing(ProtocolCommand::Message, ProtocolType::TempNote, recipient_id)?;
        message.params = params;
        self.deliver(message, &push).await
    }

    /// Publish plain text to a channel
    pub async fn publish(&self, text: &str, channel: &str, params: Option<Value>) -> Result<Message> {
        let mut message = self.outgoing(ProtocolCommand::Publish, ProtocolType::Text, channel)?;
        message.params = params.unwrap_or(Value::Null);
        message.text = Some(text.to_string());
        message.encrypted_text = Some(text.to_string());
        self.deliver(message, &PushSpec::None).await
    }

    /// Send a prepared message over the socket, or over HTTP when offline.
    /// Returns the message, promoted if the server confirmed it inline.
    pub async fn deliver(&self, mut message: Message, push: &PushSpec) -> Result<Message> {
        let args = message.to_args(push);
        self.outbox.track(&message);

        if self.connection.is_online() {
            let frame = Frame::new(message.protocol_command, args);
            self.connection.send_frame(&frame).await?;
            debug!(id = message.id, "Message sent over socket");
            return Ok(message);
        }

        let response = self
            .http
            .request(HttpRequest::post("/message/new", args))
            .await?;
        if let Some(server_id) = response.get("messageId").and_then(value_as_i64) {
            let provisional = message.id;
            self.outbox.confirm(provisional, server_id);
            message.promote(server_id);
        }
        debug!(id = message.id, "Message sent over HTTP");
        Ok(message)
    }

    fn outgoing(
        &self,
        command: ProtocolCommand,
        protocol_type: ProtocolType,
        recipient_id: &str,
    ) -> Result<Message> {
        if recipient_id.trim().is_empty() {
            return Err(MonkeyError::InvalidInput("recipient is required".into()));
        }
        let sender_id = self.sessions.session_id()?;
        let mut message = Message::outgoing(command, protocol_type, sender_id, recipient_id.to_string());
        message.app_id = Some(self.config.app_key.clone());
        Ok(message)
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    /// Upload a file as gzip → base64 → optional AES, announced as a FILE message
    pub async fn send_file(&self, recipient_id: &str, upload: FileUpload) -> Result<Message> {
        let mut message = self.outgoing(ProtocolCommand::Message, ProtocolType::File, recipient_id)?;
        message.params = upload.params;
        message.props.filename = Some(upload.filename.clone());
        message.props.ext = upload
            .filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_lowercase());
        message.props.mime_type = upload.mime_type;
        message.props.file_type = Some(upload.file_type.code());
        message.props.size = Some(upload.data.len() as u64);
        message.props.cmpr = Some(GZIP.to_string());

        let compressed = self.compressor.compress(&upload.data)?;
        let mut payload = BASE64.encode(compressed);
        if upload.encrypt {
            let own = self.sessions.own_key()?;
            payload = self.cipher.encrypt(payload.as_bytes(), &own)?;
            message.props.encr = 1;
        }

        let args = message.to_args(&upload.push);
        let body = json!({ "data": args.to_string(), "file": payload });
        self.outbox.track(&message);

        let response = self
            .http
            .request(HttpRequest::file("/file/new/base64", body))
            .await?;
        if let Some(server_id) = response.get("messageId").and_then(value_as_i64) {
            self.outbox.confirm(message.id, server_id);
            message.promote(server_id);
        }
        if let Some(reference) = response.get("fileId").and_then(Value::as_str) {
            message.encrypted_text = Some(reference.to_string());
        }

        info!(id = message.id, size = upload.data.len(), "File uploaded");
        Ok(message)
    }

    /// Fetch and decode a FILE message's content
    pub async fn download_file(&self, message: &Message) -> Result<Vec<u8>> {
        let reference = message
            .encrypted_text
            .as_deref()
            .or(message.text.as_deref())
            .filter(|reference| !reference.is_empty())
            .ok_or_else(|| MonkeyError::InvalidInput("message carries no file reference".into()))?;

        let mut payload = self.fetch_file(reference).await?;

        if message.is_encrypted() {
            payload = match self.dispatcher.decrypt_from(&message.sender_id, &payload) {
                Ok(plaintext) => plaintext_string(plaintext)?,
                Err(e) => {
                    debug!(id = message.id, error = %e, "File decryption failed, refreshing key");
                    if self.dispatcher.refresh_key(&message.sender_id).await? == KeyRefresh::Unchanged {
                        payload = self.sessions.open_secure(message.id).await?;
                    }
                    let plaintext = self
                        .dispatcher
                        .decrypt_from(&message.sender_id, &payload)
                        .map_err(|_| MonkeyError::Decryption {
                            message_id: message.id,
                            sender_id: message.sender_id.clone(),
                        })?;
                    plaintext_string(plaintext)?
                }
            };
        }

        let raw = BASE64
            .decode(payload.trim())
            .map_err(|e| MonkeyError::InvalidInput(format!("file payload is not base64: {}", e)))?;
        if message.is_compressed() {
            Ok(self.compressor.decompress(&raw)?)
        } else {
            Ok(raw)
        }
    }

    async fn fetch_file(&self, reference: &str) -> Result<String> {
        let response = self
            .http
            .request(HttpRequest::get(format!("/file/open/{}/base64", reference)))
            .await?;
        match response {
            Value::String(payload) => Ok(payload),
            other => other
                .get("file")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| ProtocolError::MissingField("file").into()),
        }
    }

    // ------------------------------------------------------------------
    // Channels and history
    // ------------------------------------------------------------------

    pub async fn subscribe(&self, channel: &str) -> Result<Value> {
        let session_id = self.sessions.session_id()?;
        let response = self
            .http
            .request(HttpRequest::post(
                format!("/channel/subscribe/{}", channel),
                json!({ "monkey_id": session_id }),
            ))
            .await?;

        self.events.emit(MonkeyEvent::Subscribe {
            channel: channel.to_string(),
            response: response.clone(),
        });
        Ok(response)
    }

    pub async fn get_conversations(&self) -> Result<Value> {
        let session_id = self.sessions.session_id()?;
        Ok(self
            .http
            .request(HttpRequest::get(format!("/user/{}/conversations", session_id)))
            .await?)
    }

    /// Up to `qty` messages of a conversation older than `since_id`,
    /// decrypted in order
    pub async fn get_conversation_messages(
        &self,
        conversation_id: &str,
        qty: u32,
        since_id: Option<i64>,
    ) -> Result<Vec<Message>> {
        let session_id = self.sessions.session_id()?;
        let since = since_id.map(|id| id.to_string()).unwrap_or_default();
        let response = self
            .http
            .request(HttpRequest::get(format!(
                "/conversation/messages/{}/{}/{}/{}",
                session_id, conversation_id, qty, since
            )))
            .await?;

        let items = match &response {
            Value::Array(items) => items.as_slice(),
            other => other
                .get("messages")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default(),
        };

        let messages: Vec<Message> = items
            .iter()
            .filter_map(|raw| match Message::from_frame(ProtocolCommand::Message, raw) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed history message");
                    None
                }
            })
            .collect();

        Ok(self.dispatcher.decrypt_batch(messages).await)
    }

    // ------------------------------------------------------------------
    // Groups and info
    // ------------------------------------------------------------------

    pub async fn create_group(&self, members: &[String], info: Value) -> Result<Value> {
        let session_id = self.sessions.session_id()?;
        let mut all: Vec<&str> = members.iter().map(String::as_str).collect();
        if !all.contains(&session_id.as_str()) {
            all.push(&session_id);
        }

        Ok(self
            .http
            .request(HttpRequest::post(
                "/group/create",
                json!({ "monkey_id": session_id, "members": all.join(","), "info": info }),
            ))
            .await?)
    }

    pub async fn add_member_to_group(&self, group_id: &str, member_id: &str) -> Result<Value> {
        let session_id = self.sessions.session_id()?;
        Ok(self
            .http
            .request(HttpRequest::post(
                "/group/addmember",
                json!({ "monkey_id": session_id, "new_member": member_id, "group_id": group_id }),
            ))
            .await?)
    }

    pub async fn remove_member_from_group(&self, group_id: &str, member_id: &str) -> Result<Value> {
        Ok(self
            .http
            .request(HttpRequest::post(
                "/group/delete",
                json!({ "monkey_id": member_id, "group_id": group_id }),
            ))
            .await?)
    }

    /// User or group metadata; group ids start with `G:`
    pub async fn get_info(&self, id: &str) -> Result<Value> {
        let path = if id.starts_with("G:") {
            format!("/group/info/{}", id)
        } else {
            format!("/info/{}", id)
        };
        Ok(self.http.request(HttpRequest::get(path)).await?)
    }
}

impl Drop for MonkeyClient {
    fn drop(&mut self) {
        self.connection.disconnect();
    }
}

fn plaintext_string(plaintext: Vec<u8>) -> Result<String> {
    String::from_utf8(plaintext)
        .map_err(|_| MonkeyError::InvalidInput("decrypted file payload is not text".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::exchange::MockKeyExchange;
    use crate::keystore::KeyMaterial;
    use crate::transport::{MockHttpTransport, SocketPair, TransportError};
    use async_trait::async_trait;

    struct RefusingConnector;

    #[async_trait]
    impl SocketConnector for RefusingConnector {
        async fn connect(&self, _url: &str, _protocol: &str) -> std::result::Result<SocketPair, TransportError> {
            Err(TransportError::Socket("offline".into()))
        }
    }

    fn own_key() -> KeyMaterial {
        KeyMaterial::new(BASE64.encode([5u8; 32]), BASE64.encode([6u8; 16]))
    }

    /// A client with an established session "me" that never gets a socket
    fn client(http: MockHttpTransport) -> MonkeyClient {
        let capabilities = Capabilities {
            http: Arc::new(http),
            connector: Arc::new(RefusingConnector),
            cipher: Arc::new(AesCbcCipher::new()),
            compressor: Arc::new(GzipCompressor::new()),
            exchange: Arc::new(MockKeyExchange::new()),
        };
        let client = MonkeyClient::new(ClientConfig::new("A", "B"), capabilities);
        client.session.write().assign_session_id("me").unwrap();
        client.keys.insert("me", own_key());
        client
    }

    #[tokio::test]
    async fn test_offline_send_uses_http_and_promotes() {
        let mut http = MockHttpTransport::new();
        http.expect_request()
            .withf(|req| {
                let body = req.body.as_ref().unwrap();
                req.path == "/message/new" && body["rid"] == "bob" && body["msg"] == "hi" && body["push"]["text"] == "ping"
            })
            .times(1)
            .returning(|_| Ok(json!({"messageId": "9001"})));

        let client = client(http);
        let sent = client
            .send_message("hi", "bob", None, PushSpec::from("ping"))
            .await
            .unwrap();

        assert_eq!(sent.id, 9001);
        assert!(sent.old_id.unwrap() < 0);
        assert_eq!(client.pending_outbound(), 0);
    }

    #[tokio::test]
    async fn test_offline_send_without_confirmation_stays_provisional() {
        let mut http = MockHttpTransport::new();
        http.expect_request().returning(|_| Ok(Value::Null));

        let client = client(http);
        let sent = client
            .send_notification("bob", json!({"typing": true}), PushSpec::None)
            .await
            .unwrap();

        assert!(sent.id < 0);
        assert_eq!(sent.protocol_type, ProtocolType::Notif);
        assert_eq!(client.pending_outbound(), 1);
    }

    #[test]
    fn test_prepare_encrypted_message() {
        let client = client(MockHttpTransport::new());
        let message = client.prepare_message("secret", "bob", None, true).unwrap();

        assert!(message.is_encrypted());
        assert!(message.id < 0);
        let ciphertext = message.encrypted_text.unwrap();
        assert_ne!(ciphertext, "secret");
        assert_eq!(AesCbcCipher::new().decrypt(&ciphertext, &own_key()).unwrap(), b"secret");
    }

    #[test]
    fn test_prepare_requires_session() {
        let capabilities = Capabilities {
            http: Arc::new(MockHttpTransport::new()),
            connector: Arc::new(RefusingConnector),
            cipher: Arc::new(AesCbcCipher::new()),
            compressor: Arc::new(GzipCompressor::new()),
            exchange: Arc::new(MockKeyExchange::new()),
        };
        let client = MonkeyClient::new(ClientConfig::new("A", "B"), capabilities);

        assert!(matches!(
            client.prepare_message("x", "bob", None, false),
            Err(MonkeyError::NotInitialized)
        ));
        assert!(matches!(
            client.prepare_message("x", " ", None, false),
            Err(MonkeyError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_temporal_notification_and_publish_types() {
        let mut http = MockHttpTransport::new();
        http.expect_request().returning(|_| Ok(Value::Null));

        let client = client(http);
        let note = client
            .send_temporal_notification("bob", json!({"status": "typing"}), PushSpec::None)
            .await
            .unwrap();
        assert_eq!(note.protocol_type, ProtocolType::TempNote);

        let published = client.publish("news", "channel-1", None).await.unwrap();
        assert_eq!(published.protocol_command, ProtocolCommand::Publish);
        assert_eq!(published.recipient_id, "channel-1");
    }

    #[tokio::test]
    async fn test_file_roundtrip_through_upload_and_download() {
        let uploaded = Arc::new(parking_lot::Mutex::new(None::<String>));
        let captured = uploaded.clone();
        let served = uploaded.clone();

        let mut http = MockHttpTransport::new();
        http.expect_request()
            .withf(|req| req.path == "/file/new/base64" && req.is_file)
            .times(1)
            .returning(move |req| {
                let body = req.body.unwrap();
                let data: Value = serde_json::from_str(body["data"].as_str().unwrap()).unwrap();
                assert_eq!(data["props"]["cmpr"], "gzip");
                assert_eq!(data["props"]["ext"], "txt");
                *captured.lock() = Some(body["file"].as_str().unwrap().to_string());
                Ok(json!({"messageId": 77, "fileId": "f-1"}))
            });
        http.expect_request()
            .withf(|req| req.path == "/file/open/f-1/base64")
            .times(1)
            .returning(move |_| Ok(json!(served.lock().clone().unwrap())));

        let client = client(http);
        let mut upload = FileUpload::new(b"file body".to_vec(), "Notes.TXT", FileType::Archive);
        upload.encrypt = true;

        let mut message = client.send_file("bob", upload).await.unwrap();
        assert_eq!(message.id, 77);
        assert_eq!(message.props.size, Some(9));
        assert!(message.is_encrypted());

        // The recipient sees our own key under our session id
        message.sender_id = "me".into();
        let content = client.download_file(&message).await.unwrap();
        assert_eq!(content, b"file body");
    }

    #[tokio::test]
    async fn test_download_refreshes_key_on_failure() {
        let peer_key = KeyMaterial::new(BASE64.encode([8u8; 32]), BASE64.encode([9u8; 16]));
        let cipher = AesCbcCipher::new();
        let gz = GzipCompressor::new().compress(b"photo").unwrap();
        let payload = cipher.encrypt(BASE64.encode(gz).as_bytes(), &peer_key).unwrap();
        let conv_key = cipher.encrypt(peer_key.to_pair().as_bytes(), &own_key()).unwrap();

        let mut http = MockHttpTransport::new();
        http.expect_request()
            .withf(|req| req.path == "/file/open/ref-9/base64")
            .times(1)
            .returning(move |_| Ok(json!({"file": payload.clone()})));
        http.expect_request()
            .withf(|req| req.path == "/user/key/exchange")
            .times(1)
            .returning(move |_| Ok(json!({"convKey": conv_key.clone()})));

        let client = client(http);
        let frame_args = json!({
            "id": 50, "sid": "carol", "rid": "me", "msg": "ref-9", "type": 2,
            "props": {"encr": 1, "cmpr": "gzip"}
        });
        let message = Message::from_frame(ProtocolCommand::Message, &frame_args).unwrap();

        assert_eq!(client.download_file(&message).await.unwrap(), b"photo");
        assert!(client.key_store().contains("carol"));
    }

    /// The peer key `carol` already holds, wrapped the way key exchange returns it
    fn unchanged_key_client(mut http: MockHttpTransport, peer_key: &KeyMaterial) -> MonkeyClient {
        let conv_key = AesCbcCipher::new()
            .encrypt(peer_key.to_pair().as_bytes(), &own_key())
            .unwrap();
        http.expect_request()
            .withf(|req| req.path == "/user/key/exchange")
            .times(1)
            .returning(move |_| Ok(json!({"convKey": conv_key.clone()})));

        let client = client(http);
        client.key_store().insert("carol", peer_key.clone());
        client
    }

    fn file_message(id: i64, reference: &str) -> Message {
        let frame_args = json!({
            "id": id, "sid": "carol", "rid": "me", "msg": reference, "type": 2,
            "props": {"encr": 1}
        });
        Message::from_frame(ProtocolCommand::Message, &frame_args).unwrap()
    }

    #[tokio::test]
    async fn test_download_with_unchanged_key_opens_securely() {
        let peer_key = KeyMaterial::new(BASE64.encode([8u8; 32]), BASE64.encode([9u8; 16]));
        let rewrapped = AesCbcCipher::new()
            .encrypt(BASE64.encode(b"scan").as_bytes(), &peer_key)
            .unwrap();

        let mut http = MockHttpTransport::new();
        http.expect_request()
            .withf(|req| req.path == "/file/open/ref-3/base64")
            .times(1)
            .returning(|_| Ok(json!("garbled")));
        http.expect_request()
            .withf(|req| req.path == "/message/61/open/secure")
            .times(1)
            .returning(move |_| Ok(json!(rewrapped.clone())));

        let client = unchanged_key_client(http, &peer_key);
        assert_eq!(client.download_file(&file_message(61, "ref-3")).await.unwrap(), b"scan");
    }

    #[tokio::test]
    async fn test_download_with_unchanged_key_and_bad_refetch_is_decryption_error() {
        let peer_key = KeyMaterial::new(BASE64.encode([8u8; 32]), BASE64.encode([9u8; 16]));

        let mut http = MockHttpTransport::new();
        http.expect_request()
            .withf(|req| req.path == "/file/open/ref-4/base64")
            .times(1)
            .returning(|_| Ok(json!("garbled")));
        http.expect_request()
            .withf(|req| req.path == "/message/62/open/secure")
            .times(1)
            .returning(|_| Ok(json!({"msg": "still garbled"})));

        let client = unchanged_key_client(http, &peer_key);
        let err = client.download_file(&file_message(62, "ref-4")).await.unwrap_err();
        assert!(matches!(
            err,
            MonkeyError::Decryption { message_id: 62, ref sender_id } if sender_id == "carol"
        ));
    }

    #[tokio::test]
    async fn test_info_routes_groups() {
        let mut http = MockHttpTransport::new();
        http.expect_request()
            .withf(|req| req.path == "/group/info/G:42")
            .times(1)
            .returning(|_| Ok(json!({"name": "team"})));
        http.expect_request()
            .withf(|req| req.path == "/info/bob")
            .times(1)
            .returning(|_| Ok(json!({"name": "Bob"})));

        let client = client(http);
        assert_eq!(client.get_info("G:42").await.unwrap()["name"], "team");
        assert_eq!(client.get_info("bob").await.unwrap()["name"], "Bob");
    }

    #[tokio::test]
    async fn test_group_management_bodies() {
        let mut http = MockHttpTransport::new();
        http.expect_request()
            .withf(|req| req.path == "/group/create" && req.body.as_ref().unwrap()["members"] == "bob,carol,me")
            .times(1)
            .returning(|_| Ok(json!({"group_id": "G:1"})));
        http.expect_request()
            .withf(|req| req.path == "/group/addmember" && req.body.as_ref().unwrap()["new_member"] == "dave")
            .times(1)
            .returning(|_| Ok(Value::Null));
        http.expect_request()
            .withf(|req| {
                let body = req.body.as_ref().unwrap();
                req.path == "/group/delete" && body["monkey_id"] == "dave" && body["group_id"] == "G:1"
            })
            .times(1)
            .returning(|_| Ok(Value::Null));

        let client = client(http);
        let created = client
            .create_group(&["bob".into(), "carol".into()], json!({"name": "team"}))
            .await
            .unwrap();
        assert_eq!(created["group_id"], "G:1");
        client.add_member_to_group("G:1", "dave").await.unwrap();
        client.remove_member_from_group("G:1", "dave").await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_emits_event() {
        let mut http = MockHttpTransport::new();
        http.expect_request()
            .withf(|req| req.path == "/channel/subscribe/news")
            .returning(|_| Ok(json!({"ok": true})));

        let client = client(http);
        let mut events = client.subscribe_events();
        client.subscribe("news").await.unwrap();

        assert_eq!(
            events.try_recv().unwrap(),
            MonkeyEvent::Subscribe {
                channel: "news".into(),
                response: json!({"ok": true})
            }
        );
    }

    #[tokio::test]
    async fn test_conversation_history_is_decrypted_in_order() {
        let peer_key = KeyMaterial::new(BASE64.encode([3u8; 32]), BASE64.encode([4u8; 16]));
        let cipher = AesCbcCipher::new();
        let history = json!([
            {"id": 1, "sid": "bob", "rid": "me", "msg": cipher.encrypt(b"older", &peer_key).unwrap(), "props": {"encr": 1}},
            {"id": 2, "sid": "me", "rid": "bob", "msg": "plain reply"},
            {"id": 3, "sid": "bob", "rid": "me", "msg": cipher.encrypt(b"newer", &peer_key).unwrap(), "props": {"encr": 1}},
        ]);

        let mut http = MockHttpTransport::new();
        http.expect_request()
            .withf(|req| req.path == "/conversation/messages/me/bob/10/")
            .returning(move |_| Ok(history.clone()));

        let client = client(http);
        client.key_store().insert("bob", peer_key);

        let messages = client.get_conversation_messages("bob", 10, None).await.unwrap();
        let texts: Vec<_> = messages.iter().map(|m| m.text.as_deref()).collect();
        assert_eq!(texts, vec![Some("older"), Some("plain reply"), Some("newer")]);
    }

    #[tokio::test]
    async fn test_socket_operations_fail_when_offline() {
        let client = client(MockHttpTransport::new());
        assert!(matches!(
            client.open_conversation("bob").await,
            Err(MonkeyError::Transport(TransportError::NotConnected))
        ));
        assert!(client.get_pending_messages().await.is_err());
    }
}
