//! Management API Module
//!
//! Read-only HTTP API exposing relay health, status, live connections and
//! Prometheus metrics.

pub mod api;
pub mod handlers;
pub mod server;
pub mod types;

pub use api::ManagementApi;
pub use handlers::AppState;
pub use server::{BoundManagementServer, ManagementServer};
pub use types::*;
