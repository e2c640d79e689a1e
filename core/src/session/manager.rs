// Session Manager: HTTP handshake that creates or resumes a session
//
// OFFLINE → HANDSHAKE → CONNECTING. The socket itself belongs to the
// connection manager; this module only prepares the session id and keys.

use super::{SessionState, SharedSession};
use crate::config::ClientConfig;
use crate::crypto::{Cipher, KeyExchange};
use crate::events::{EventEmitter, MonkeyEvent};
use crate::keystore::{KeyMaterial, KeyStore};
use crate::message::codec::{required_str, value_as_i64};
use crate::message::ProtocolError;
use crate::transport::{HttpRequest, HttpTransport};
use crate::{MonkeyError, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct SessionManager {
    config: Arc<ClientConfig>,
    session: SharedSession,
    keys: Arc<KeyStore>,
    http: Arc<dyn HttpTransport>,
    cipher: Arc<dyn Cipher>,
    exchange: Arc<dyn KeyExchange>,
    events: Arc<EventEmitter>,
}

impl SessionManager {
    pub fn new(
        config: Arc<ClientConfig>,
        session: SharedSession,
        keys: Arc<KeyStore>,
        http: Arc<dyn HttpTransport>,
        cipher: Arc<dyn Cipher>,
        exchange: Arc<dyn KeyExchange>,
        events: Arc<EventEmitter>,
    ) -> Self {
        Self {
            config,
            session,
            keys,
            http,
            cipher,
            exchange,
            events,
        }
    }

    /// Run the handshake. On success the session is CONNECTING and the
    /// returned id is ready for the socket; on failure it is back to OFFLINE.
    pub async fn start_session(&self) -> Result<String> {
        self.session.write().set_state(SessionState::Handshake);

        match self.handshake().await {
            Ok(session_id) => {
                self.session.write().set_state(SessionState::Connecting);
                info!(session_id = %session_id, "Session ready");
                Ok(session_id)
            }
            Err(e) => {
                warn!(error = %e, "Handshake failed");
                self.session.write().set_state(SessionState::Offline);
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<String> {
        let known_id = self.config.known_session_id();
        let body = json!({
            "user_info": self.config.user_object,
            "session_id": known_id,
            "expiring": self.config.expiring,
        });

        let response = self
            .http
            .request(HttpRequest::post("/user/session", body))
            .await?;

        let session_id = match response.get("monkeyId").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => known_id.clone().ok_or(ProtocolError::MissingField("monkeyId"))?,
        };
        let public_key = required_str(&response, "publicKey")?.to_string();

        // Nothing is committed to the session until the key step succeeds,
        // so a failed handshake leaves no id behind.
        if known_id.as_deref() == Some(session_id.as_str()) {
            debug!(session_id = %session_id, "Resuming known session");
            self.sync_keys(&session_id).await?;
        } else {
            debug!(session_id = %session_id, "Starting new session");
            self.connect_keys(&session_id, &public_key).await?;
        }

        {
            let mut session = self.session.write();
            session.assign_session_id(&session_id)?;
            session.server_public_key = Some(public_key);
        }
        self.events.emit(MonkeyEvent::Session {
            session_id: session_id.clone(),
        });

        Ok(session_id)
    }

    /// Resume: receive our stored key under a throwaway RSA keypair
    async fn sync_keys(&self, session_id: &str) -> Result<()> {
        let keypair = self.exchange.generate_keypair()?;
        let body = json!({
            "monkey_id": session_id,
            "public_key": keypair.public_key_pem,
        });

        let response = self
            .http
            .request(HttpRequest::post("/user/key/sync", body))
            .await?;

        let wrapped = required_str(&response, "keys")?;
        let plaintext = self.exchange.decrypt_with(&keypair, wrapped)?;
        drop(keypair);

        self.keys.insert(session_id, parse_material(&plaintext)?);

        let timestamp = response
            .get("last_time_synced")
            .and_then(value_as_i64)
            .unwrap_or(0);
        let message_id = response
            .get("last_message_id")
            .and_then(value_as_i64)
            .unwrap_or(0);
        self.session
            .write()
            .set_high_water_marks(timestamp, message_id);

        debug!(timestamp, message_id, "Keys synced");
        Ok(())
    }

    /// New session: generate our key and hand it to the server under its RSA key
    async fn connect_keys(&self, session_id: &str, server_public_key: &str) -> Result<()> {
        let material = self.cipher.generate_key();
        let usk = self
            .exchange
            .encrypt_for(server_public_key, material.to_pair().as_bytes())?;

        self.http
            .request(HttpRequest::post(
                "/user/connect",
                json!({ "monkey_id": session_id, "usk": usk }),
            ))
            .await?;

        self.keys.insert(session_id, material);
        Ok(())
    }

    /// Fetch the current key material for `peer_id`, unwrapped with our own key
    pub async fn exchange_key(&self, peer_id: &str) -> Result<KeyMaterial> {
        let session_id = self.session_id()?;
        let response = self
            .http
            .request(HttpRequest::post(
                "/user/key/exchange",
                json!({ "monkey_id": session_id, "user_to": peer_id }),
            ))
            .await?;

        let wrapped = required_str(&response, "convKey")?;
        let own = self.own_key()?;
        let plaintext = self.cipher.decrypt(wrapped, &own)?;

        debug!(peer = %peer_id, "Key exchanged");
        parse_material(&plaintext)
    }

    /// Ask the server to re-wrap a message's ciphertext
    pub async fn open_secure(&self, message_id: i64) -> Result<String> {
        let response = self
            .http
            .request(HttpRequest::get(format!("/message/{}/open/secure", message_id)))
            .await?;

        match response {
            Value::String(ciphertext) => Ok(ciphertext),
            other => Ok(required_str(&other, "msg")?.to_string()),
        }
    }

    pub fn session_id(&self) -> Result<String> {
        self.session
            .read()
            .session_id()
            .map(str::to_string)
            .ok_or(MonkeyError::NotInitialized)
    }

    /// This session's own outbound key
    pub fn own_key(&self) -> Result<KeyMaterial> {
        let session_id = self.session_id()?;
        self.keys.get(&session_id).ok_or(MonkeyError::NotInitialized)
    }
}

/// Decrypted `"key:iv"` bytes into key material
fn parse_material(plaintext: &[u8]) -> Result<KeyMaterial> {
    std::str::from_utf8(plaintext)
        .ok()
        .and_then(KeyMaterial::parse_pair)
        .ok_or_else(|| ProtocolError::Malformed("expected \"key:iv\" key material".into()).into())
}
