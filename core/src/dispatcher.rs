// Message Dispatcher: routes inbound frames and resolves encrypted content
//
// Decryption failures are treated as a stale or missing peer key first. The
// key is re-fetched; if it turns out unchanged, the ciphertext is re-fetched
// instead. Each message gets at most one recovery.

use crate::crypto::{Cipher, Compressor, CryptoError};
use crate::events::{EventEmitter, MonkeyEvent};
use crate::keystore::{KeyComparison, KeyMaterial, KeyStore};
use crate::message::codec::value_as_i64;
use crate::message::{Frame, Message, ProtocolCommand, ProtocolType, ResponseType, PAGE_SIZE};
use crate::outbox::Outbox;
use crate::session::{SessionManager, SharedSession};
use crate::{MonkeyError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

/// What a key refresh found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRefresh {
    /// New or different material was stored; decrypting again may succeed
    Rotated,
    /// The server returned the key we already had
    Unchanged,
}

pub struct MessageDispatcher {
    session: SharedSession,
    keys: Arc<KeyStore>,
    sessions: Arc<SessionManager>,
    cipher: Arc<dyn Cipher>,
    compressor: Arc<dyn Compressor>,
    events: Arc<EventEmitter>,
    outbox: Arc<Outbox>,
}

impl MessageDispatcher {
    pub fn new(
        session: SharedSession,
        keys: Arc<KeyStore>,
        sessions: Arc<SessionManager>,
        cipher: Arc<dyn Cipher>,
        compressor: Arc<dyn Compressor>,
        events: Arc<EventEmitter>,
        outbox: Arc<Outbox>,
    ) -> Self {
        Self {
            session,
            keys,
            sessions,
            cipher,
            compressor,
            events,
            outbox,
        }
    }

    /// Handle one inbound frame to completion. Returns the follow-up frame
    /// to send when a backlog page reports more remaining messages.
    pub async fn dispatch(&self, frame: Frame) -> Result<Option<Frame>> {
        let command = frame.command();
        match command {
            ProtocolCommand::Message | ProtocolCommand::Publish => {
                let message = Message::from_frame(command, &frame.args)?;
                self.process_content(message).await?;
                Ok(None)
            }
            ProtocolCommand::Ack => {
                let ack = Message::from_frame(command, &frame.args)?;
                self.acknowledge(ack);
                Ok(None)
            }
            ProtocolCommand::Get | ProtocolCommand::Sync => {
                self.process_backlog(command, &frame.args).await
            }
            _ => {
                let notification = Message::from_frame(command, &frame.args)
                    .unwrap_or_else(|_| Message::notification(command, &frame.args));
                self.events.emit(MonkeyEvent::Notification(notification));
                Ok(None)
            }
        }
    }

    /// Decrypt, advance the high-water marks and emit a content message
    pub async fn process_content(&self, message: Message) -> Result<()> {
        let message = self.resolve(message).await?;
        self.session
            .write()
            .advance(message.id, message.datetime_creation);

        let event = if message.protocol_command == ProtocolCommand::Publish {
            MonkeyEvent::ChannelMessage(message)
        } else {
            MonkeyEvent::Message(message)
        };
        self.events.emit(event);
        Ok(())
    }

    fn acknowledge(&self, ack: Message) {
        if let (Some(provisional), true) = (ack.old_id, ack.is_confirmed()) {
            if self.outbox.confirm(provisional, ack.id).is_some() {
                debug!(provisional, confirmed = ack.id, "Outbound message confirmed");
            }
        }
        self.events.emit(MonkeyEvent::Acknowledge(ack));
    }

    async fn process_backlog(&self, command: ProtocolCommand, args: &Value) -> Result<Option<Frame>> {
        let response_type = args
            .get("type")
            .and_then(value_as_i64)
            .map(ResponseType::from_code)
            .unwrap_or(ResponseType::History);

        if response_type != ResponseType::History {
            self.events
                .emit(MonkeyEvent::Notification(Message::notification(command, args)));
            return Ok(None);
        }

        let items = args
            .get("messages")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        debug!(count = items.len(), "Processing backlog page");
        let before = self.cursor(command);

        // Pages arrive newest first
        for raw in items.iter().rev() {
            let message = match Message::from_frame(ProtocolCommand::Message, raw) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "Skipping malformed backlog message");
                    continue;
                }
            };
            if let Err(e) = self.process_content(message).await {
                warn!(error = %e, "Failed to process backlog message");
            }
        }

        let remaining = args
            .get("remaining_messages")
            .and_then(value_as_i64)
            .unwrap_or(0);
        if remaining <= 0 {
            return Ok(None);
        }

        // Asking again from an unmoved cursor would return the same page
        let after = self.cursor(command);
        if after == before {
            warn!(remaining, cursor = after, "Backlog cursor did not advance, stopping");
            return Ok(None);
        }

        debug!(remaining, "Requesting next backlog page");
        Ok(Some(self.next_page(command)))
    }

    fn cursor(&self, command: ProtocolCommand) -> i64 {
        let session = self.session.read();
        match command {
            ProtocolCommand::Get => session.last_message_id(),
            _ => session.last_timestamp(),
        }
    }

    /// Backlog request continuing from the current high-water mark
    pub fn next_page(&self, command: ProtocolCommand) -> Frame {
        let session = self.session.read();
        match command {
            ProtocolCommand::Get => Frame::get_request(session.last_message_id(), PAGE_SIZE, false),
            _ => Frame::sync_request(session.last_timestamp(), PAGE_SIZE, false),
        }
    }

    async fn resolve(&self, mut message: Message) -> Result<Message> {
        if resolve_plain(&mut message) {
            return Ok(message);
        }

        match self.try_decrypt(&message) {
            Ok(text) => {
                message.text = Some(text);
                return Ok(message);
            }
            Err(e) => debug!(
                id = message.id,
                sender = %message.sender_id,
                error = %e,
                "Decryption failed, refreshing key"
            ),
        }

        self.recover(&mut message).await?;

        match self.try_decrypt(&message) {
            Ok(text) => {
                message.text = Some(text);
                Ok(message)
            }
            Err(_) => Err(MonkeyError::Decryption {
                message_id: message.id,
                sender_id: message.sender_id,
            }),
        }
    }

    /// One recovery round for a message that failed to decrypt
    async fn recover(&self, message: &mut Message) -> Result<()> {
        match self.refresh_key(&message.sender_id).await? {
            KeyRefresh::Rotated => Ok(()),
            KeyRefresh::Unchanged => self.recover_ciphertext(message).await,
        }
    }

    /// Fetch the peer's current key and store it, reporting whether it changed
    pub async fn refresh_key(&self, peer_id: &str) -> Result<KeyRefresh> {
        let material = self.sessions.exchange_key(peer_id).await?;
        let refresh = match self.keys.replace(peer_id, material) {
            KeyComparison::Missing | KeyComparison::Changed => KeyRefresh::Rotated,
            KeyComparison::Identical => KeyRefresh::Unchanged,
        };
        debug!(peer = %peer_id, ?refresh, "Key refreshed");
        Ok(refresh)
    }

    /// The key was right, so fetch the ciphertext again. It replaces the
    /// message's ciphertext only if it decrypts.
    async fn recover_ciphertext(&self, message: &mut Message) -> Result<()> {
        let decryption_error = || MonkeyError::Decryption {
            message_id: message.id,
            sender_id: message.sender_id.clone(),
        };

        let ciphertext = self.sessions.open_secure(message.id).await?;
        let key = self.keys.get(&message.sender_id).ok_or_else(decryption_error)?;
        self.decrypt_text(&ciphertext, &key, message.is_compressed())
            .map_err(|_| decryption_error())?;

        message.encrypted_text = Some(ciphertext);
        Ok(())
    }

    /// Resolve a batch in order. A message that fails is refreshed once and
    /// retried from the front of the queue; none are dropped.
    pub async fn decrypt_batch(&self, messages: Vec<Message>) -> Vec<Message> {
        let mut queue: VecDeque<(Message, bool)> =
            messages.into_iter().map(|message| (message, false)).collect();
        let mut resolved = Vec::with_capacity(queue.len());

        while let Some((mut message, recovered)) = queue.pop_front() {
            if resolve_plain(&mut message) {
                resolved.push(message);
                continue;
            }

            match self.try_decrypt(&message) {
                Ok(text) => {
                    message.text = Some(text);
                    resolved.push(message);
                }
                Err(e) if recovered => {
                    warn!(id = message.id, error = %e, "Message still undecryptable after key refresh");
                    resolved.push(message);
                }
                Err(_) => match self.recover(&mut message).await {
                    Ok(()) => queue.push_front((message, true)),
                    Err(e) => {
                        warn!(id = message.id, error = %e, "Key recovery failed");
                        resolved.push(message);
                    }
                },
            }
        }

        resolved
    }

    /// Decrypt a file payload from `peer_id` with the stored key
    pub fn decrypt_from(&self, peer_id: &str, ciphertext: &str) -> std::result::Result<Vec<u8>, CryptoError> {
        let key = self.keys.get(peer_id).ok_or(CryptoError::DecryptionFailed)?;
        let plaintext = self.cipher.decrypt(ciphertext, &key)?;
        if plaintext.is_empty() {
            return Err(CryptoError::EmptyPlaintext);
        }
        Ok(plaintext)
    }

    fn try_decrypt(&self, message: &Message) -> std::result::Result<String, CryptoError> {
        // A missing key is handled like a stale one
        let key = self
            .keys
            .get(&message.sender_id)
            .ok_or(CryptoError::DecryptionFailed)?;
        let ciphertext = message
            .encrypted_text
            .as_deref()
            .ok_or(CryptoError::EmptyPlaintext)?;
        self.decrypt_text(ciphertext, &key, message.is_compressed())
    }

    /// Compressed text is base64(gzip(utf8)) under the encryption
    fn decrypt_text(
        &self,
        ciphertext: &str,
        key: &KeyMaterial,
        compressed: bool,
    ) -> std::result::Result<String, CryptoError> {
        let plaintext = self.cipher.decrypt(ciphertext, key)?;
        if plaintext.is_empty() {
            return Err(CryptoError::EmptyPlaintext);
        }

        let bytes = if compressed {
            let raw = BASE64
                .decode(&plaintext)
                .map_err(|e| CryptoError::InvalidEncoding(format!("compressed text: {}", e)))?;
            self.compressor.decompress(&raw)?
        } else {
            plaintext
        };

        String::from_utf8(bytes).map_err(|_| CryptoError::InvalidEncoding("text is not UTF-8".into()))
    }
}

/// Fill `text` for messages that need no decryption here. File messages
/// carry a reference; their content is decrypted on download.
fn resolve_plain(message: &mut Message) -> bool {
    if message.is_encrypted() && message.protocol_type != ProtocolType::File {
        return false;
    }
    message.text = message.encrypted_text.clone();
    true
}
