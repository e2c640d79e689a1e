// Connection Manager: owns the single WebSocket and its reconnect loop
//
// Frames are handled one at a time, in arrival order, on the task running
// `run`. An unclean close schedules a reconnect with exponential backoff;
// `disconnect` cancels both the live socket and any pending reconnect.

use crate::config::{ClientConfig, PendingCursor};
use crate::dispatcher::MessageDispatcher;
use crate::events::{EventEmitter, MonkeyEvent};
use crate::message::{decode_frame, encode_frame, Frame, PAGE_SIZE};
use crate::session::{SessionState, SharedSession};
use crate::transport::{
    SocketConnector, SocketEvent, SocketPair, SocketSink, TransportError, SOCKET_PROTOCOL,
};
use crate::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a served socket ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseKind {
    Clean,
    Unexpected,
    Cancelled,
}

pub struct ConnectionManager {
    config: Arc<ClientConfig>,
    session: SharedSession,
    connector: Arc<dyn SocketConnector>,
    dispatcher: Arc<MessageDispatcher>,
    events: Arc<EventEmitter>,
    sink: Mutex<Option<Box<dyn SocketSink>>>,
    cancel: parking_lot::Mutex<CancellationToken>,
}

impl ConnectionManager {
    pub fn new(
        config: Arc<ClientConfig>,
        session: SharedSession,
        connector: Arc<dyn SocketConnector>,
        dispatcher: Arc<MessageDispatcher>,
        events: Arc<EventEmitter>,
    ) -> Self {
        Self {
            config,
            session,
            connector,
            dispatcher,
            events,
            sink: Mutex::new(None),
            cancel: parking_lot::Mutex::new(CancellationToken::new()),
        }
    }

    pub fn socket_url(&self, session_id: &str) -> String {
        self.config.socket_url(session_id)
    }

    pub fn is_online(&self) -> bool {
        self.session.read().state() == SessionState::Online
    }

    /// Arm a fresh cancellation token for the next `run`
    pub fn reset(&self) {
        *self.cancel.lock() = CancellationToken::new();
    }

    /// Stop the socket and suppress any pending reconnect
    pub fn disconnect(&self) {
        self.cancel.lock().cancel();
    }

    /// Connect and serve until a clean close, cancellation, or the reconnect
    /// budget runs out
    pub async fn run(&self, session_id: String) {
        let cancel = self.cancel.lock().clone();
        let policy = &self.config.reconnect;
        let url = self.socket_url(&session_id);
        let mut attempt: u32 = 0;

        loop {
            debug!(attempt, "Opening socket");
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.connector.connect(&url, SOCKET_PROTOCOL) => result,
            };

            match connected {
                Ok(pair) => {
                    attempt = 0;
                    match self.serve(pair, &session_id, &cancel).await {
                        CloseKind::Clean | CloseKind::Cancelled => {
                            info!("Socket closed");
                            self.session.write().set_state(SessionState::Offline);
                            self.events.emit(MonkeyEvent::Disconnect { clean: true });
                            return;
                        }
                        CloseKind::Unexpected => {
                            warn!("Socket closed unexpectedly");
                            self.session.write().set_state(SessionState::Connecting);
                            self.events.emit(MonkeyEvent::Disconnect { clean: false });
                        }
                    }
                }
                Err(e) => warn!(error = %e, attempt, "Socket connect failed"),
            }

            if policy.exhausted(attempt) {
                warn!(attempts = attempt, "Giving up on reconnecting");
                break;
            }
            let delay = policy.delay_for(attempt);
            attempt += 1;
            info!(delay_ms = delay.as_millis() as u64, attempt, "Reconnecting");

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.session.write().set_state(SessionState::Offline);
    }

    async fn serve(&self, pair: SocketPair, session_id: &str, cancel: &CancellationToken) -> CloseKind {
        let SocketPair { sink, mut stream } = pair;
        *self.sink.lock().await = Some(sink);

        self.session.write().set_state(SessionState::Online);
        info!(session_id, "Socket open");
        self.events.emit(MonkeyEvent::Connect {
            session_id: session_id.to_string(),
        });

        if let Err(e) = self.request_pending().await {
            warn!(error = %e, "Failed to request pending messages");
        }

        let kind = loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break CloseKind::Cancelled,
                event = stream.next_event() => event,
            };

            match event {
                SocketEvent::Text(text) => self.handle_text(&text).await,
                SocketEvent::Closed { clean, code } => {
                    debug!(clean, ?code, "Socket close received");
                    break if clean {
                        CloseKind::Clean
                    } else {
                        CloseKind::Unexpected
                    };
                }
            }
        };

        if let Some(mut sink) = self.sink.lock().await.take() {
            if kind == CloseKind::Cancelled {
                if let Err(e) = sink.close().await {
                    debug!(error = %e, "Close handshake failed");
                }
            }
        }
        kind
    }

    async fn handle_text(&self, text: &str) {
        let frame = match decode_frame(text) {
            Ok(frame) => frame.with_default_app_id(&self.config.app_key),
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        match self.dispatcher.dispatch(frame).await {
            Ok(Some(next)) => {
                if let Err(e) = self.send_frame(&next).await {
                    warn!(error = %e, "Failed to request next backlog page");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to process frame"),
        }
    }

    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let text = encode_frame(frame)?;
        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or(TransportError::NotConnected)?;
        sink.send_text(text).await?;
        Ok(())
    }

    /// Ask for messages newer than the current high-water mark
    pub async fn request_pending(&self) -> Result<()> {
        let frame = {
            let session = self.session.read();
            match self.config.pending_cursor {
                PendingCursor::Timestamp => {
                    Frame::sync_request(session.last_timestamp(), PAGE_SIZE, false)
                }
                PendingCursor::MessageId => {
                    Frame::get_request(session.last_message_id(), PAGE_SIZE, false)
                }
            }
        };
        self.send_frame(&frame).await
    }
}
