// Configuration management for the Monkey CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/monkey/config.json
// - Linux: ~/.config/monkey/config.json
// - Windows: %APPDATA%\monkey\config.json

use anyhow::{Context, Result};
use monkey_core::{ClientConfig, PendingCursor};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application credentials issued by the platform
    pub app_key: String,
    pub secret_key: String,

    /// API host, without scheme
    pub domain: String,

    /// Use ws:// and http:// (local servers)
    pub debug: bool,

    /// Session assigned by the last successful `init`
    pub session_id: Option<String>,

    /// Display name sent with the session request
    pub user_name: Option<String>,

    /// Ask the server for a session that expires
    pub expiring: bool,

    /// Reconnect attempts after an unexpected disconnect (0 = unlimited)
    pub max_reconnect_attempts: u32,

    /// Backlog cursor: "timestamp" or "message_id"
    pub pending_cursor: PendingCursor,
}

impl Default for Config {
    fn default() -> Self {
        let defaults = ClientConfig::new("", "");
        Self {
            app_key: String::new(),
            secret_key: String::new(),
            domain: defaults.domain,
            debug: false,
            session_id: None,
            user_name: None,
            expiring: false,
            max_reconnect_attempts: defaults.reconnect.max_attempts,
            pending_cursor: PendingCursor::default(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("monkey");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let config_file = Self::config_file()?;

        if config_file.exists() {
            let contents =
                std::fs::read_to_string(&config_file).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_file = Self::config_file()?;
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_file, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Build the SDK config; fails when credentials are missing
    pub fn client_config(&self) -> Result<ClientConfig> {
        if self.app_key.is_empty() || self.secret_key.is_empty() {
            anyhow::bail!(
                "Credentials not configured. Run: monkey config set app_key <key> && monkey config set secret_key <secret>"
            );
        }

        let mut config = ClientConfig::new(self.app_key.clone(), self.secret_key.clone());
        config.domain = self.domain.clone();
        config.debug = self.debug;
        config.session_id = self.session_id.clone();
        config.expiring = self.expiring;
        config.reconnect.max_attempts = self.max_reconnect_attempts;
        config.pending_cursor = self.pending_cursor;
        if let Some(name) = &self.user_name {
            config.user_object = json!({ "name": name });
        }
        Ok(config)
    }

    /// Set a config value
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "app_key" => self.app_key = value.to_string(),
            "secret_key" => self.secret_key = value.to_string(),
            "domain" => self.domain = value.to_string(),
            "debug" => {
                self.debug = value.parse().context("Invalid boolean value")?;
            }
            "session_id" => self.session_id = non_empty(value),
            "user_name" => self.user_name = non_empty(value),
            "expiring" => {
                self.expiring = value.parse().context("Invalid boolean value")?;
            }
            "max_reconnect_attempts" => {
                self.max_reconnect_attempts = value.parse().context("Invalid number")?;
            }
            "pending_cursor" => {
                self.pending_cursor = match value {
                    "timestamp" => PendingCursor::Timestamp,
                    "message_id" => PendingCursor::MessageId,
                    _ => anyhow::bail!("pending_cursor must be 'timestamp' or 'message_id'"),
                };
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        self.save()?;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values; the secret is masked
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("app_key".to_string(), self.app_key.clone()),
            ("secret_key".to_string(), mask(&self.secret_key)),
            ("domain".to_string(), self.domain.clone()),
            ("debug".to_string(), self.debug.to_string()),
            (
                "session_id".to_string(),
                self.session_id.clone().unwrap_or_else(|| "(none)".to_string()),
            ),
            (
                "user_name".to_string(),
                self.user_name.clone().unwrap_or_else(|| "(none)".to_string()),
            ),
            ("expiring".to_string(), self.expiring.to_string()),
            (
                "max_reconnect_attempts".to_string(),
                self.max_reconnect_attempts.to_string(),
            ),
            (
                "pending_cursor".to_string(),
                match self.pending_cursor {
                    PendingCursor::Timestamp => "timestamp".to_string(),
                    PendingCursor::MessageId => "message_id".to_string(),
                },
            ),
        ]
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn mask(secret: &str) -> String {
    if secret.is_empty() {
        "(unset)".to_string()
    } else {
        "********".to_string()
    }
}
