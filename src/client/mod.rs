//! Relay Client Module
//!
//! Client-side tooling built on the wire protocol: a framed connection, an
//! interactive chat session, scripted bots and a throughput benchmark.

pub mod bench;
pub mod bot;
pub mod connection;
pub mod interactive;

pub use bench::{BenchOptions, BenchReport};
pub use bot::{BotOptions, BotReport};
pub use connection::{ClientReader, ClientWriter, RelayClient};
