//! Broadcast fan-out to connected clients.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::connection::{ConnectionId, ConnectionRegistry};
use crate::protocol::{encode_frame, ChatMessage};

/// Delivers a message to every registered connection except its sender.
#[derive(Debug, Clone)]
pub struct BroadcastRouter {
    registry: Arc<ConnectionRegistry>,
}

impl BroadcastRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Encode `message` once and enqueue it on every connection except
    /// `sender`. `None` targets everyone.
    ///
    /// Returns the number of connections the frame was queued on. Connections
    /// added or removed while this runs may or may not receive it.
    pub fn fan_out(&self, sender: Option<ConnectionId>, message: &ChatMessage) -> usize {
        let frame = match encode_frame(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(name = %message.name, error = %e, "Failed to encode message for broadcast");
                return 0;
            }
        };

        let mut recipients = 0;
        for handler in self.registry.snapshot() {
            if Some(handler.id()) == sender {
                continue;
            }
            if handler.enqueue(frame.clone()) {
                recipients += 1;
            }
        }

        debug!(
            sender = ?sender.map(|id| id.to_string()),
            recipients,
            "Broadcast message"
        );
        recipients
    }
}
