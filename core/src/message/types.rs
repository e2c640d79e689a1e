// Message types: the envelope exchanged with the server and surfaced to the app

use super::codec::{
    flexible_flag, flexible_opt_i64, flexible_opt_string, flexible_opt_u64, value_as_i64,
    value_as_string,
};
use super::ProtocolError;
use crate::push::PushSpec;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Top-level protocol command carried in every frame's `cmd`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum ProtocolCommand {
    Message,
    Get,
    Transaction,
    Open,
    Set,
    Ack,
    Publish,
    Delete,
    Close,
    Sync,
    Unknown(u16),
}

impl From<u16> for ProtocolCommand {
    fn from(code: u16) -> Self {
        match code {
            200 => Self::Message,
            201 => Self::Get,
            202 => Self::Transaction,
            203 => Self::Open,
            204 => Self::Set,
            205 => Self::Ack,
            206 => Self::Publish,
            207 => Self::Delete,
            208 => Self::Close,
            209 => Self::Sync,
            other => Self::Unknown(other),
        }
    }
}

impl From<ProtocolCommand> for u16 {
    fn from(command: ProtocolCommand) -> Self {
        match command {
            ProtocolCommand::Message => 200,
            ProtocolCommand::Get => 201,
            ProtocolCommand::Transaction => 202,
            ProtocolCommand::Open => 203,
            ProtocolCommand::Set => 204,
            ProtocolCommand::Ack => 205,
            ProtocolCommand::Publish => 206,
            ProtocolCommand::Delete => 207,
            ProtocolCommand::Close => 208,
            ProtocolCommand::Sync => 209,
            ProtocolCommand::Unknown(code) => code,
        }
    }
}

/// What kind of content a message carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum ProtocolType {
    Text,
    File,
    TempNote,
    Notif,
    Alert,
    Unknown(u16),
}

impl From<u16> for ProtocolType {
    fn from(code: u16) -> Self {
        match code {
            1 => Self::Text,
            2 => Self::File,
            3 => Self::TempNote,
            4 => Self::Notif,
            5 => Self::Alert,
            other => Self::Unknown(other),
        }
    }
}

impl From<ProtocolType> for u16 {
    fn from(kind: ProtocolType) -> Self {
        match kind {
            ProtocolType::Text => 1,
            ProtocolType::File => 2,
            ProtocolType::TempNote => 3,
            ProtocolType::Notif => 4,
            ProtocolType::Alert => 5,
            ProtocolType::Unknown(code) => code,
        }
    }
}

/// Delivery status reported inside ACK frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            50 => Some(Self::Sent),
            51 => Some(Self::Delivered),
            52 => Some(Self::Read),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Self::Sent => 50,
            Self::Delivered => 51,
            Self::Read => 52,
        }
    }
}

/// Declared payload of a GET/SYNC response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    History,
    Groups,
    Unknown(i64),
}

impl ResponseType {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::History,
            2 => Self::Groups,
            other => Self::Unknown(other),
        }
    }
}

/// File category advertised in `props.file_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Audio,
    Video,
    Image,
    Archive,
}

impl FileType {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Audio),
            2 => Some(Self::Video),
            3 => Some(Self::Image),
            4 => Some(Self::Archive),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            Self::Audio => 1,
            Self::Video => 2,
            Self::Image => 3,
            Self::Archive => 4,
        }
    }
}

/// Structured property bag attached to every message.
///
/// The server sends `props` either as an object or as a JSON-encoded string,
/// and numeric fields are sometimes strings. Unrecognised keys are preserved
/// in `extra` so they round-trip untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Props {
    /// 1 when `encrypted_text` is AES ciphertext
    #[serde(default, deserialize_with = "flexible_flag")]
    pub encr: u8,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "flexible_opt_string")]
    pub device: Option<String>,
    /// Compression applied before encryption (`"gzip"`)
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "flexible_opt_string")]
    pub cmpr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "flexible_opt_i64")]
    pub file_type: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "flexible_opt_string")]
    pub ext: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "flexible_opt_string")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "flexible_opt_string")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "flexible_opt_u64")]
    pub size: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Props {
    /// Parse props from either an object or a string-encoded object
    pub fn parse(value: &Value) -> Result<Self, ProtocolError> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::String(encoded) if encoded.trim().is_empty() => Ok(Self::default()),
            Value::String(encoded) => serde_json::from_str(encoded)
                .map_err(|e| ProtocolError::Malformed(format!("props: {}", e))),
            Value::Object(_) => serde_json::from_value(value.clone())
                .map_err(|e| ProtocolError::Malformed(format!("props: {}", e))),
            other => Err(ProtocolError::Malformed(format!(
                "props must be an object, got {}",
                other
            ))),
        }
    }

    pub fn file_kind(&self) -> Option<FileType> {
        self.file_type.and_then(FileType::from_code)
    }

    fn extra_i64(&self, key: &str) -> Option<i64> {
        self.extra.get(key).and_then(value_as_i64)
    }
}

/// A protocol message.
///
/// Locally created messages carry a negative provisional `id` until the
/// server acknowledges them; inbound messages keep the id from the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    /// Provisional id this message had before the server confirmed it
    pub old_id: Option<i64>,
    pub protocol_command: ProtocolCommand,
    pub protocol_type: ProtocolType,
    pub sender_id: String,
    pub recipient_id: String,
    /// Server timestamp (unix seconds); local send time for provisional messages
    pub datetime_creation: i64,
    /// Local receive/send time (unix seconds)
    pub datetime_order: i64,
    pub props: Props,
    pub params: Value,
    /// Ciphertext, or the plaintext staged for the wire when not encrypted
    pub encrypted_text: Option<String>,
    /// Resolved plaintext
    pub text: Option<String>,
    pub read_by_user: bool,
    /// Set on ACK envelopes
    pub delivery_status: Option<DeliveryStatus>,
    pub app_id: Option<String>,
}

impl Message {
    /// Create an outbound message with a fresh provisional id
    pub fn outgoing(
        command: ProtocolCommand,
        protocol_type: ProtocolType,
        sender_id: String,
        recipient_id: String,
    ) -> Self {
        let now = now_secs();
        Self {
            id: provisional_id(),
            old_id: None,
            protocol_command: command,
            protocol_type,
            sender_id,
            recipient_id,
            datetime_creation: now,
            datetime_order: now,
            props: Props {
                device: Some("rust".to_string()),
                ..Props::default()
            },
            params: Value::Null,
            encrypted_text: None,
            text: None,
            read_by_user: false,
            delivery_status: None,
            app_id: None,
        }
    }

    /// Build an envelope from an inbound frame's `args`
    pub fn from_frame(command: ProtocolCommand, args: &Value) -> Result<Self, ProtocolError> {
        let object = args
            .as_object()
            .ok_or_else(|| ProtocolError::Malformed("message args must be an object".to_string()))?;
        let field = |name: &str| object.get(name).unwrap_or(&Value::Null);

        let id = match value_as_i64(field("id")) {
            Some(id) => id,
            None if matches!(command, ProtocolCommand::Message | ProtocolCommand::Publish) => {
                return Err(ProtocolError::MissingField("id"));
            }
            None => 0,
        };

        let now = now_secs();
        let mut message = Self {
            id,
            old_id: value_as_i64(field("oldId")),
            protocol_command: command,
            protocol_type: value_as_i64(field("type"))
                .and_then(|code| u16::try_from(code).ok())
                .map(ProtocolType::from)
                .unwrap_or(ProtocolType::Text),
            sender_id: value_as_string(field("sid")).unwrap_or_default(),
            recipient_id: value_as_string(field("rid")).unwrap_or_default(),
            datetime_creation: value_as_i64(field("datetime")).unwrap_or(now),
            datetime_order: now,
            props: Props::parse(field("props"))?,
            params: parse_params(field("params"))?,
            encrypted_text: value_as_string(field("msg")),
            text: None,
            read_by_user: value_as_i64(field("readByUser")).is_some_and(|flag| flag != 0),
            delivery_status: None,
            app_id: value_as_string(field("app_id")),
        };

        if command == ProtocolCommand::Ack {
            message.apply_acknowledgement();
        }
        Ok(message)
    }

    /// Wrap a non-message payload (group list, unknown command) as a NOTIF envelope
    pub fn notification(command: ProtocolCommand, args: &Value) -> Self {
        let now = now_secs();
        Self {
            id: args.get("id").and_then(value_as_i64).unwrap_or(0),
            old_id: None,
            protocol_command: command,
            protocol_type: ProtocolType::Notif,
            sender_id: args.get("sid").and_then(value_as_string).unwrap_or_default(),
            recipient_id: args.get("rid").and_then(value_as_string).unwrap_or_default(),
            datetime_creation: args.get("datetime").and_then(value_as_i64).unwrap_or(now),
            datetime_order: now,
            props: args
                .get("props")
                .and_then(|props| Props::parse(props).ok())
                .unwrap_or_default(),
            params: args.clone(),
            encrypted_text: None,
            text: None,
            read_by_user: false,
            delivery_status: None,
            app_id: args.get("app_id").and_then(value_as_string),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.props.encr == 1
    }

    pub fn is_compressed(&self) -> bool {
        self.props.cmpr.as_deref().is_some_and(|cmpr| !cmpr.is_empty())
    }

    /// True once the server has assigned a real id
    pub fn is_confirmed(&self) -> bool {
        self.id > 0
    }

    /// Replace the provisional id with the server-assigned one
    pub fn promote(&mut self, server_id: i64) {
        if self.id != server_id {
            self.old_id = Some(self.id);
            self.id = server_id;
        }
    }

    /// Serialize into the `args` object of an outbound frame
    pub fn to_args(&self, push: &PushSpec) -> Value {
        let mut args = json!({
            "id": self.id,
            "sid": self.sender_id,
            "rid": self.recipient_id,
            "type": u16::from(self.protocol_type),
            "datetime": self.datetime_creation,
            "props": self.props,
            "params": self.params,
        });
        if let Some(msg) = &self.encrypted_text {
            args["msg"] = Value::String(msg.clone());
        }
        if let Some(push) = push.to_value() {
            args["push"] = push;
        }
        args
    }

    fn apply_acknowledgement(&mut self) {
        if let Some(new_id) = self.props.extra_i64("new_id") {
            self.id = new_id;
        }
        if let Some(old_id) = self.props.extra_i64("old_id") {
            self.old_id = Some(old_id);
        }
        self.delivery_status = self
            .props
            .extra_i64("status")
            .and_then(DeliveryStatus::from_code);
        if let Some(code) = self
            .props
            .extra_i64("message_type")
            .and_then(|code| u16::try_from(code).ok())
        {
            self.protocol_type = ProtocolType::from(code);
        }
    }
}

/// Generate a negative provisional id.
///
/// Derived from the current time in milliseconds with a random suffix so two
/// messages sent within the same millisecond are unlikely to collide.
pub fn provisional_id() -> i64 {
    let millis = now_millis();
    let suffix: i64 = rand::thread_rng().gen_range(0..1000);
    -(millis.saturating_mul(1000).saturating_add(suffix).saturating_add(1))
}

fn parse_params(value: &Value) -> Result<Value, ProtocolError> {
    match value {
        Value::String(encoded) if encoded.trim().is_empty() => Ok(Value::Null),
        Value::String(encoded) => serde_json::from_str(encoded)
            .map_err(|e| ProtocolError::Malformed(format!("params: {}", e))),
        other => Ok(other.clone()),
    }
}

pub(crate) fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
