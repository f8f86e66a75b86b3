//! Relay Event Wiring
//!
//! Connects handler events to the broadcast router, the registry, metrics and
//! an optional external observer.

use std::sync::Arc;

use tracing::debug;

use super::router::BroadcastRouter;
use crate::connection::{ConnectionEvents, ConnectionHandler, ConnectionId, ConnectionRegistry};
use crate::error::DecodeError;
use crate::metrics::RelayMetrics;
use crate::protocol::ChatMessage;

/// Hooks for code embedding the relay. Both methods default to no-ops.
pub trait RelayObserver: Send + Sync {
    /// Called after the message has been fanned out
    fn message_received(&self, _sender: ConnectionId, _message: &ChatMessage) {}

    /// Called once when a connection is lost and has been unregistered
    fn connection_closed(&self, _id: ConnectionId) {}
}

pub(crate) struct RelayEvents {
    router: BroadcastRouter,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<RelayMetrics>,
    observer: Option<Arc<dyn RelayObserver>>,
}

impl RelayEvents {
    pub(crate) fn new(
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<RelayMetrics>,
        observer: Option<Arc<dyn RelayObserver>>,
    ) -> Self {
        Self {
            router: BroadcastRouter::new(Arc::clone(&registry)),
            registry,
            metrics,
            observer,
        }
    }
}

impl ConnectionEvents for RelayEvents {
    fn connection_opened(&self, _handler: &ConnectionHandler) {
        self.metrics.connection_opened();
        self.metrics.set_active_connections(self.registry.len());
    }

    fn message_received(&self, sender: &ConnectionHandler, message: ChatMessage) {
        self.metrics.message_received();
        let recipients = self.router.fan_out(Some(sender.id()), &message);
        self.metrics.frames_enqueued(recipients);

        if let Some(observer) = &self.observer {
            observer.message_received(sender.id(), &message);
        }
    }

    fn connection_closed(&self, handler: &ConnectionHandler) {
        let id = handler.id();
        if self.registry.remove(id).is_none() {
            debug!(connection_id = %id, "Closed connection was already unregistered");
        }

        let lifetime = handler.connected_at().elapsed().unwrap_or_default();
        self.metrics.connection_faulted(lifetime);
        self.metrics.set_active_connections(self.registry.len());

        if let Some(observer) = &self.observer {
            observer.connection_closed(id);
        }
    }

    fn connection_unregistered(&self, _handler: &ConnectionHandler) {
        self.metrics.set_active_connections(self.registry.len());
    }

    fn frame_dropped(&self, _handler: &ConnectionHandler, _error: &DecodeError) {
        self.metrics.decode_failure();
    }

    fn frame_received(&self, _handler: &ConnectionHandler, bytes: usize) {
        self.metrics.bytes_received(bytes);
    }

    fn frame_sent(&self, _handler: &ConnectionHandler, bytes: usize) {
        self.metrics.bytes_sent(bytes);
    }
}
