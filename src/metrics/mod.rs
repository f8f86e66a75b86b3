//! Metrics Module
//!
//! Handles metrics collection and export.

pub mod collector;

pub use collector::{MetricsSnapshot, RelayMetrics};
