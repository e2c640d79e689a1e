// Events surfaced to the host application

use crate::message::Message;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum MonkeyEvent {
    /// The server assigned (or confirmed) the session id
    Session { session_id: String },
    /// The socket is open
    Connect { session_id: String },
    /// The socket closed. An unclean close is followed by reconnect attempts.
    Disconnect { clean: bool },
    /// A direct message, decrypted
    Message(Message),
    /// A message published to a channel
    ChannelMessage(Message),
    /// OPEN frames, group lists and anything the client does not model
    Notification(Message),
    /// Delivery status for a sent message
    Acknowledge(Message),
    Subscribe { channel: String, response: Value },
}

/// Callback interface for client events
pub trait EventDelegate: Send + Sync {
    fn on_event(&self, event: MonkeyEvent);
}

impl<F> EventDelegate for F
where
    F: Fn(MonkeyEvent) + Send + Sync,
{
    fn on_event(&self, event: MonkeyEvent) {
        self(event)
    }
}

/// Forwards every event into an unbounded channel
pub struct ChannelDelegate {
    tx: mpsc::UnboundedSender<MonkeyEvent>,
}

impl ChannelDelegate {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MonkeyEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventDelegate for ChannelDelegate {
    fn on_event(&self, event: MonkeyEvent) {
        if self.tx.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }
}

/// Holds the currently registered delegate
#[derive(Default)]
pub struct EventEmitter {
    delegate: RwLock<Option<Arc<dyn EventDelegate>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_delegate(&self, delegate: Option<Arc<dyn EventDelegate>>) {
        *self.delegate.write() = delegate;
    }

    pub fn emit(&self, event: MonkeyEvent) {
        // Clone out so the delegate never runs under our lock
        let delegate = self.delegate.read().clone();
        match delegate {
            Some(delegate) => delegate.on_event(event),
            None => debug!(?event, "No delegate registered, dropping event"),
        }
    }
}
