// Client configuration
//
// Everything the client needs to authenticate and reach the platform. Only
// `app_key` and `secret_key` are required when deserializing.

use crate::{MonkeyError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_DOMAIN: &str = "monkey.criptext.com";

/// Which high-water mark the pending-messages request is keyed on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingCursor {
    /// SYNC by `last_timestamp`
    #[default]
    Timestamp,
    /// GET by `last_message_id`
    MessageId,
}

/// Reconnect schedule after an unexpected socket close
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Consecutive failed attempts before giving up (0 = never give up)
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 2000,
            max_delay_ms: 60_000,
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Exponential backoff with up to 25% jitter, capped at `max_delay_ms`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.max_delay_ms);
        let jitter = if exponential >= 4 {
            rand::thread_rng().gen_range(0..=exponential / 4)
        } else {
            0
        };
        Duration::from_millis(exponential.saturating_add(jitter).min(self.max_delay_ms))
    }

    /// True once `attempt` consecutive failures exhaust the budget
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts != 0 && attempt >= self.max_attempts
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub app_key: String,
    pub secret_key: String,

    /// Opaque user payload sent with the session request
    #[serde(default)]
    pub user_object: Value,

    /// A previously assigned session id to resume
    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default)]
    pub expiring: bool,

    /// Plain `http://` and `ws://` for local servers
    #[serde(default)]
    pub debug: bool,

    #[serde(default = "default_domain")]
    pub domain: String,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    #[serde(default)]
    pub pending_cursor: PendingCursor,

    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

fn default_domain() -> String {
    DEFAULT_DOMAIN.to_string()
}

fn default_http_timeout() -> u64 {
    30
}

impl ClientConfig {
    pub fn new(app_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            secret_key: secret_key.into(),
            user_object: Value::Object(Default::default()),
            session_id: None,
            expiring: false,
            debug: false,
            domain: default_domain(),
            reconnect: ReconnectPolicy::default(),
            pending_cursor: PendingCursor::default(),
            http_timeout_secs: default_http_timeout(),
        }
    }

    /// Session id to resume: the explicit one, else `user_object.monkey_id`
    pub fn known_session_id(&self) -> Option<String> {
        self.session_id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| {
                self.user_object
                    .get("monkey_id")
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
            })
    }

    pub fn http_base_url(&self) -> String {
        let scheme = if self.debug { "http" } else { "https" };
        format!("{}://{}", scheme, self.domain)
    }

    pub fn socket_url(&self, session_id: &str) -> String {
        let scheme = if self.debug { "ws" } else { "wss" };
        format!(
            "{}://{}/websockets?monkey_id={}&p={}:{}",
            scheme, self.domain, session_id, self.app_key, self.secret_key
        )
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Check required fields before any network activity
    pub fn validate(&self) -> Result<()> {
        if self.app_key.trim().is_empty() {
            return Err(MonkeyError::InvalidInput("app_key is required".into()));
        }
        if self.secret_key.trim().is_empty() {
            return Err(MonkeyError::InvalidInput("secret_key is required".into()));
        }
        if self.domain.trim().is_empty() {
            return Err(MonkeyError::InvalidInput("domain is required".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("app_key", &self.app_key)
            .field("secret_key", &"<redacted>")
            .field("session_id", &self.session_id)
            .field("expiring", &self.expiring)
            .field("debug", &self.debug)
            .field("domain", &self.domain)
            .field("reconnect", &self.reconnect)
            .field("pending_cursor", &self.pending_cursor)
            .finish_non_exhaustive()
    }
}
