// Push notification payloads attached to outbound messages

use serde_json::{json, Value};

/// How the server should notify an offline recipient
#[derive(Debug, Clone, Default, PartialEq)]
pub enum PushSpec {
    /// No push notification
    #[default]
    None,
    /// A plain alert text, expanded into the per-platform default shape
    Standard(String),
    /// A caller-built payload forwarded verbatim
    Custom(Value),
}

impl PushSpec {
    /// JSON for the frame's `push` field, or `None` when nothing is sent
    pub fn to_value(&self) -> Option<Value> {
        match self {
            PushSpec::None => None,
            PushSpec::Standard(text) => Some(json!({
                "text": text,
                "iosData": { "alert": text, "sound": "default" },
                "andData": { "alert": text },
            })),
            PushSpec::Custom(payload) => Some(payload.clone()),
        }
    }
}

impl From<&str> for PushSpec {
    fn from(text: &str) -> Self {
        PushSpec::Standard(text.to_string())
    }
}

impl From<Option<Value>> for PushSpec {
    fn from(payload: Option<Value>) -> Self {
        payload.map_or(PushSpec::None, PushSpec::Custom)
    }
}
