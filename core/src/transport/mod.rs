// Transport capabilities: the HTTP request primitive and the WebSocket factory
//
// The protocol layers only depend on these traits. Concrete adapters live in
// `http` (reqwest) and `websocket` (tokio-tungstenite).

pub mod http;
pub mod websocket;

pub use http::ReqwestTransport;
pub use websocket::TungsteniteConnector;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Sub-protocol token announced on every socket
pub const SOCKET_PROTOCOL: &str = "criptext-protocol";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response body: {0}")]
    InvalidBody(String),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Socket not connected")]
    NotConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// One call against the REST API. `path` is relative to the API base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub path: String,
    pub body: Option<Value>,
    /// Send the body's top-level fields as multipart form parts
    pub is_file: bool,
}

impl HttpRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.into(),
            body: None,
            is_file: false,
        }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            path: path.into(),
            body: Some(body),
            is_file: false,
        }
    }

    pub fn file(path: impl Into<String>, body: Value) -> Self {
        Self {
            is_file: true,
            ..Self::post(path, body)
        }
    }
}

/// Authenticated request/response against the API
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Perform the request and return the decoded JSON payload, with any
    /// top-level `data` envelope already removed
    async fn request(&self, request: HttpRequest) -> Result<Value, TransportError>;
}

/// What the read half of a socket produced next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Text(String),
    /// The socket is gone. `clean` is true only for a normal (1000) close.
    Closed { clean: bool, code: Option<u16> },
}

#[async_trait]
pub trait SocketSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait SocketStream: Send {
    async fn next_event(&mut self) -> SocketEvent;
}

/// Both halves of an open socket
pub struct SocketPair {
    pub sink: Box<dyn SocketSink>,
    pub stream: Box<dyn SocketStream>,
}

impl std::fmt::Debug for SocketPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketPair").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, url: &str, protocol: &str) -> Result<SocketPair, TransportError>;
}

/// Strip the `{data: ...}` envelope the API wraps most responses in
pub fn unwrap_data(value: Value) -> Value {
    match value {
        Value::Object(mut object) if object.contains_key("data") => {
            object.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}
