//! chatrelay Library
//!
//! A broadcast chat relay. Clients connect over TCP and exchange
//! length-prefixed frames carrying a display name and a line of text; every
//! frame a client sends is fanned out to every other connected client.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod management;
pub mod metrics;
pub mod protocol;
pub mod relay;
pub mod shutdown;

pub use config::Config;
pub use error::RelayError;
pub use protocol::ChatMessage;
pub use relay::{RelayObserver, RelayServer};
pub use shutdown::{ShutdownCoordinator, ShutdownSignal};

/// Common result type for the relay
pub type Result<T> = anyhow::Result<T>;
