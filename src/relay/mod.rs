//! Chat Relay Module
//!
//! Broadcast routing and the embeddable relay server.

mod events;
pub mod router;
pub mod server;

pub use events::RelayObserver;
pub use router::BroadcastRouter;
pub use server::RelayServer;
