//! tokio-tungstenite [`SocketConnector`]

use super::{SocketConnector, SocketEvent, SocketPair, SocketSink, SocketStream, TransportError};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens real WebSocket connections
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn connect(&self, url: &str, protocol: &str) -> Result<SocketPair, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Socket(format!("invalid URL: {e}")))?;
        let protocol = HeaderValue::from_str(protocol)
            .map_err(|e| TransportError::Socket(format!("invalid sub-protocol: {e}")))?;
        request.headers_mut().insert("Sec-WebSocket-Protocol", protocol);

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| TransportError::Socket(format!("WebSocket connect failed: {e}")))?;
        let (write, read) = ws_stream.split();

        Ok(SocketPair {
            sink: Box::new(TungsteniteSink { write }),
            stream: Box::new(TungsteniteStream { read }),
        })
    }
}

struct TungsteniteSink {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl SocketSink for TungsteniteSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.write
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Socket(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        self.write
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::Socket(e.to_string()))?;
        self.write
            .close()
            .await
            .map_err(|e| TransportError::Socket(e.to_string()))
    }
}

struct TungsteniteStream {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl SocketStream for TungsteniteStream {
    async fn next_event(&mut self) -> SocketEvent {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => return SocketEvent::Text(text),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return SocketEvent::Text(text),
                    Err(_) => debug!("Ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code));
                    return SocketEvent::Closed {
                        clean: code == Some(1000),
                        code,
                    };
                }
                // Pings are answered by tungstenite on the next write
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket read failed");
                    return SocketEvent::Closed {
                        clean: false,
                        code: None,
                    };
                }
                None => {
                    return SocketEvent::Closed {
                        clean: false,
                        code: None,
                    }
                }
            }
        }
    }
}
