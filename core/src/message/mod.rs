// Message module: the protocol envelope and its JSON wire frames

pub mod codec;
pub mod types;

pub use codec::{decode_frame, encode_frame, Frame, MAX_FRAME_SIZE, PAGE_SIZE};
pub use types::{
    provisional_id, DeliveryStatus, FileType, Message, Props, ProtocolCommand, ProtocolType,
    ResponseType,
};

use thiserror::Error;

/// Malformed or unexpected server payloads
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Frame too large: {0} bytes (max {MAX})", MAX = MAX_FRAME_SIZE)]
    FrameTooLarge(usize),

    #[error("Session id changed from {current} to {reported}")]
    SessionIdChanged { current: String, reported: String },
}
