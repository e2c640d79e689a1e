// Outbox: messages sent but not yet acknowledged by the server
//
// Keyed by provisional id. An ACK (or the HTTP send response) promotes the
// entry to its server id and removes it from the pending set.

use crate::message::Message;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Upper bound on tracked messages; the oldest entries are evicted first
const MAX_PENDING: usize = 10_000;

#[derive(Default)]
pub struct Outbox {
    pending: RwLock<HashMap<i64, Message>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember an outbound message until it is confirmed
    pub fn track(&self, message: &Message) {
        if message.is_confirmed() {
            return;
        }
        let mut pending = self.pending.write();
        if pending.len() >= MAX_PENDING {
            // Provisional ids grow more negative over time
            if let Some(oldest) = pending.keys().copied().max() {
                pending.remove(&oldest);
            }
        }
        pending.insert(message.id, message.clone());
    }

    /// Promote `provisional_id` to `server_id`, returning the confirmed message
    pub fn confirm(&self, provisional_id: i64, server_id: i64) -> Option<Message> {
        let mut message = self.pending.write().remove(&provisional_id)?;
        message.promote(server_id);
        Some(message)
    }

    pub fn len(&self) -> usize {
        self.pending.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.read().is_empty()
    }
}
