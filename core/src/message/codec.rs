// Frame codec: JSON `{cmd, args}` frames with a size limit

use super::types::ProtocolCommand;
use super::ProtocolError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

/// Maximum accepted frame size: 4 MB (history pages can be large)
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Messages requested per backlog page
pub const PAGE_SIZE: u32 = 15;

/// A WebSocket frame, identical in both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub cmd: u16,
    #[serde(default)]
    pub args: Value,
}

impl Frame {
    pub fn new(command: ProtocolCommand, args: Value) -> Self {
        Self {
            cmd: command.into(),
            args,
        }
    }

    pub fn command(&self) -> ProtocolCommand {
        ProtocolCommand::from(self.cmd)
    }

    /// Fill in `args.app_id` when the server omitted it
    pub fn with_default_app_id(mut self, app_key: &str) -> Self {
        match &mut self.args {
            Value::Object(args) => {
                args.entry("app_id")
                    .or_insert_with(|| Value::String(app_key.to_string()));
            }
            Value::Null => self.args = json!({ "app_id": app_key }),
            _ => {}
        }
        self
    }

    /// Backlog request keyed by timestamp
    pub fn sync_request(since: i64, qty: u32, include_groups: bool) -> Self {
        Self::new(
            ProtocolCommand::Sync,
            json!({ "since": since, "qty": qty, "groups": include_groups as u8 }),
        )
    }

    /// Backlog request keyed by message id
    pub fn get_request(since_id: i64, qty: u32, include_groups: bool) -> Self {
        Self::new(
            ProtocolCommand::Get,
            json!({ "messages_since": since_id, "qty": qty, "groups": include_groups as u8 }),
        )
    }

    pub fn open(recipient_id: &str) -> Self {
        Self::new(ProtocolCommand::Open, json!({ "rid": recipient_id }))
    }
}

/// Serialize a frame for the socket
pub fn encode_frame(frame: &Frame) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    Ok(text)
}

/// Parse a frame received from the socket
pub fn decode_frame(text: &str) -> Result<Frame, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(format!("frame: {}", e)))
}

// ---------------------------------------------------------------------------
// Lenient field access. The server is inconsistent about numbers vs strings.
// ---------------------------------------------------------------------------

/// Integer from a number, numeric string or bool. Fractional timestamps are
/// truncated.
pub(crate) fn value_as_i64(value: &Value) -> Option<i64> {
    integer_with(value, |f| f.is_finite().then_some(f as i64))
}

/// Like [`value_as_i64`], but a fractional value is not an integer at all.
/// Flags use this so that `1.5` is never read as `1`.
pub(crate) fn value_as_exact_i64(value: &Value) -> Option<i64> {
    integer_with(value, |f| (f.is_finite() && f.fract() == 0.0).then_some(f as i64))
}

fn integer_with(value: &Value, from_float: fn(f64) -> Option<i64>) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(from_float)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(from_float))
        }
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

pub(crate) fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Required string field of a JSON object
pub(crate) fn required_str<'a>(value: &'a Value, field: &'static str) -> Result<&'a str, ProtocolError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingField(field))
}

pub(crate) fn flexible_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(u8::from(value_as_exact_i64(&value) == Some(1)))
}

pub(crate) fn flexible_opt_i64<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<i64>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(value_as_i64(&value))
}

pub(crate) fn flexible_opt_u64<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<u64>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(value_as_i64(&value).and_then(|n| u64::try_from(n).ok()))
}

pub(crate) fn flexible_opt_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
        Value::Bool(true) => Some("true".to_string()),
        _ => None,
    })
}
