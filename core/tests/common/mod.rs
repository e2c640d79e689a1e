//! Shared fakes for the integration tests: a scripted REST API and an
//! in-memory socket server.

#![allow(dead_code)]

use async_trait::async_trait;
use monkey_core::crypto::{AesCbcCipher, GzipCompressor, RsaKeyExchange};
use monkey_core::transport::{
    HttpRequest, HttpTransport, SocketConnector, SocketEvent, SocketPair, SocketSink,
    SocketStream, TransportError,
};
use monkey_core::{Capabilities, ClientConfig, Frame, MonkeyClient, MonkeyEvent};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Small keys keep the RSA tests fast
pub const TEST_RSA_BITS: usize = 1024;

type Handler = Box<dyn Fn(&HttpRequest) -> Result<Value, TransportError> + Send + Sync>;

/// REST API fake: one handler per path, every request recorded
#[derive(Default)]
pub struct FakeApi {
    routes: Mutex<HashMap<String, Handler>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route<F>(&self, path: &str, handler: F)
    where
        F: Fn(&HttpRequest) -> Result<Value, TransportError> + Send + Sync + 'static,
    {
        self.routes.lock().insert(path.to_string(), Box::new(handler));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.path.clone()).collect()
    }

    pub fn request_to(&self, path: &str) -> Option<HttpRequest> {
        self.requests.lock().iter().find(|r| r.path == path).cloned()
    }
}

#[async_trait]
impl HttpTransport for FakeApi {
    async fn request(&self, request: HttpRequest) -> Result<Value, TransportError> {
        self.requests.lock().push(request.clone());
        let routes = self.routes.lock();
        match routes.get(&request.path) {
            Some(handler) => handler(&request),
            None => Err(TransportError::Status {
                status: 404,
                body: format!("no route for {}", request.path),
            }),
        }
    }
}

/// Server side of one fake socket
pub struct ServerEnd {
    to_client: mpsc::UnboundedSender<SocketEvent>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerEnd {
    pub fn push(&self, frame: Value) {
        let _ = self.to_client.send(SocketEvent::Text(frame.to_string()));
    }

    pub fn close(&self, clean: bool) {
        let code = if clean { 1000 } else { 1006 };
        let _ = self.to_client.send(SocketEvent::Closed {
            clean,
            code: Some(code),
        });
    }

    /// Next frame the client sent, decoded
    pub async fn next_frame(&mut self) -> Frame {
        let text = tokio::time::timeout(Duration::from_secs(5), self.from_client.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client socket dropped");
        monkey_core::message::decode_frame(&text).expect("client sent a malformed frame")
    }

    /// True when the client sends nothing within `wait`
    pub async fn stays_quiet(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.from_client.recv()).await.is_err()
    }
}

struct ChannelSink(mpsc::UnboundedSender<String>);

#[async_trait]
impl SocketSink for ChannelSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.0
            .send(text)
            .map_err(|_| TransportError::Socket("server gone".into()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct ChannelStream(mpsc::UnboundedReceiver<SocketEvent>);

#[async_trait]
impl SocketStream for ChannelStream {
    async fn next_event(&mut self) -> SocketEvent {
        self.0.recv().await.unwrap_or(SocketEvent::Closed {
            clean: false,
            code: None,
        })
    }
}

/// Hands each connect attempt a fresh in-memory socket
#[derive(Default)]
pub struct FakeServer {
    urls: Mutex<Vec<String>>,
    accepted: Mutex<Option<mpsc::UnboundedSender<ServerEnd>>>,
}

impl FakeServer {
    /// The server plus a receiver yielding one `ServerEnd` per connection
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let server = Self {
            urls: Mutex::new(Vec::new()),
            accepted: Mutex::new(Some(tx)),
        };
        (Arc::new(server), rx)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }
}

#[async_trait]
impl SocketConnector for FakeServer {
    async fn connect(&self, url: &str, protocol: &str) -> Result<SocketPair, TransportError> {
        assert_eq!(protocol, monkey_core::transport::SOCKET_PROTOCOL);
        self.urls.lock().push(url.to_string());

        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (client_tx, from_client) = mpsc::unbounded_channel();
        let end = ServerEnd {
            to_client,
            from_client,
        };
        let accepted = self.accepted.lock();
        match accepted.as_ref() {
            Some(tx) if tx.send(end).is_ok() => Ok(SocketPair {
                sink: Box::new(ChannelSink(client_tx)),
                stream: Box::new(ChannelStream(client_rx)),
            }),
            _ => Err(TransportError::Socket("server stopped".into())),
        }
    }
}

pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::new("A", "B");
    config.domain = "monkey.test".into();
    config
}

/// Client wired to the fakes with real AES, gzip and RSA
pub fn test_client(config: ClientConfig, api: Arc<FakeApi>, server: Arc<FakeServer>) -> MonkeyClient {
    let capabilities = Capabilities {
        http: api,
        connector: server,
        cipher: Arc::new(AesCbcCipher::new()),
        compressor: Arc::new(GzipCompressor::new()),
        exchange: Arc::new(RsaKeyExchange::with_bits(TEST_RSA_BITS)),
    };
    MonkeyClient::new(config, capabilities)
}

/// Wait for the next event matching `pred`, skipping others
pub async fn next_matching<F>(rx: &mut mpsc::UnboundedReceiver<MonkeyEvent>, pred: F) -> MonkeyEvent
where
    F: Fn(&MonkeyEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
