// Monkey Core: messaging client SDK
//
// One client = one identity: an HTTP handshake establishes the session and
// its keys, then a WebSocket carries framed messages in both directions.
// Payloads are AES-CBC encrypted per peer; keys are exchanged over HTTP.

pub mod client;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod dispatcher;
pub mod events;
pub mod keystore;
pub mod message;
pub mod outbox;
pub mod push;
pub mod session;
pub mod transport;

use thiserror::Error;

pub use client::{Capabilities, FileUpload, MonkeyClient};
pub use config::{ClientConfig, PendingCursor, ReconnectPolicy};
pub use crypto::CryptoError;
pub use events::{ChannelDelegate, EventDelegate, MonkeyEvent};
pub use keystore::{KeyMaterial, KeyStore};
pub use message::{
    DeliveryStatus, FileType, Frame, Message, ProtocolCommand, ProtocolError, ProtocolType, Props,
};
pub use push::PushSpec;
pub use session::SessionState;
pub use transport::TransportError;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum MonkeyError {
    #[error("Not initialized")]
    NotInitialized,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Cryptography error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Could not decrypt message {message_id} from {sender_id}")]
    Decryption { message_id: i64, sender_id: String },
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, MonkeyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversions() {
        let err: MonkeyError = TransportError::NotConnected.into();
        assert!(matches!(err, MonkeyError::Transport(TransportError::NotConnected)));

        let err: MonkeyError = CryptoError::DecryptionFailed.into();
        assert!(matches!(err, MonkeyError::Crypto(_)));

        let err: MonkeyError = ProtocolError::MissingField("id").into();
        assert!(err.to_string().contains("id"));
    }

    #[test]
    fn test_decryption_error_names_message() {
        let err = MonkeyError::Decryption {
            message_id: 12,
            sender_id: "bob".into(),
        };
        assert_eq!(err.to_string(), "Could not decrypt message 12 from bob");
    }
}
