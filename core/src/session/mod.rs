// Session: the authenticated identity for the lifetime of the client
//
// Populated by the handshake, then mutated only through the high-water marks
// as confirmed messages are processed.

pub mod manager;

pub use manager::SessionManager;

use crate::message::ProtocolError;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;

pub type SharedSession = Arc<RwLock<Session>>;

/// Lifecycle of the client connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Offline,
    /// Session request and key setup in flight
    Handshake,
    /// Keys ready, socket being opened (or reopened)
    Connecting,
    Online,
}

#[derive(Debug, Default)]
pub struct Session {
    session_id: Option<String>,
    pub server_public_key: Option<String>,
    pub user_data: Value,
    pub expiring: bool,
    state: SessionState,
    last_timestamp: i64,
    last_message_id: i64,
}

impl Session {
    pub fn new(user_data: Value, expiring: bool) -> Self {
        Self {
            user_data,
            expiring,
            ..Self::default()
        }
    }

    pub fn shared(user_data: Value, expiring: bool) -> SharedSession {
        Arc::new(RwLock::new(Self::new(user_data, expiring)))
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Record the server-assigned id. Once set it never changes; a different
    /// id reported later is a protocol violation.
    pub fn assign_session_id(&mut self, session_id: &str) -> Result<(), ProtocolError> {
        match &self.session_id {
            Some(current) if current != session_id => Err(ProtocolError::SessionIdChanged {
                current: current.clone(),
                reported: session_id.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.session_id = Some(session_id.to_string());
                Ok(())
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn last_timestamp(&self) -> i64 {
        self.last_timestamp
    }

    pub fn last_message_id(&self) -> i64 {
        self.last_message_id
    }

    /// Advance the high-water marks past a processed message. Provisional
    /// ids (`<= 0`) are ignored and the marks never move backwards.
    pub fn advance(&mut self, message_id: i64, timestamp: i64) {
        if message_id <= 0 {
            return;
        }
        self.last_message_id = self.last_message_id.max(message_id);
        self.last_timestamp = self.last_timestamp.max(timestamp);
    }

    /// Overwrite the marks with values reported by key sync
    pub fn set_high_water_marks(&mut self, timestamp: i64, message_id: i64) {
        self.last_timestamp = timestamp;
        self.last_message_id = message_id;
    }
}
