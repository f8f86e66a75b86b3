//! Chat Wire Protocol
//!
//! Length-prefixed frames carrying a sender name and message text.

pub mod codec;
pub mod constants;
pub mod types;

pub use codec::{decode_payload, encode_frame, encode_payload, read_frame, write_frame};
pub use constants::*;
pub use types::{ChatMessage, Frame};
