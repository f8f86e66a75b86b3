//! Connection Handling Module
//!
//! Accepting sockets, per-connection I/O loops, outbound queues and the
//! registry of live connections.

pub mod handler;
pub mod listener;
pub mod queue;
pub mod registry;
pub mod types;

pub use handler::{ConnectionEvents, ConnectionHandler, ConnectionTasks};
pub use listener::{Listener, ListenerOptions};
pub use queue::{OutboundQueue, Signal};
pub use registry::ConnectionRegistry;
pub use types::{ConnectionId, ConnectionInfo, ConnectionState, ConnectionStats};
