//! Relay Error Types
//!
//! Connection-level failures are classified so the handler can decide whether
//! a fault is local to one frame or fatal to the whole connection:
//! - `Decode` drops the offending frame and the receive loop keeps going
//! - `ShortRead`, `ShortWrite` and `Socket` tear the connection down
//! - `Accept` is logged by the listener, which keeps accepting

use std::io;

use thiserror::Error;

/// Errors raised while moving frames over a relay connection.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Fewer bytes arrived than the length prefix (or the prefix itself) requires.
    #[error("short read: expected {expected} bytes, received {received}")]
    ShortRead { expected: usize, received: usize },

    /// The socket stopped accepting bytes before the whole frame was written.
    #[error("short write: expected {expected} bytes, wrote {written}")]
    ShortWrite { expected: usize, written: usize },

    /// Frame body could not be decoded into a chat message.
    #[error("decode failure: {0}")]
    Decode(#[from] DecodeError),

    /// Reset, broken pipe, or any other host-level socket error.
    #[error("socket fault: {0}")]
    Socket(#[from] io::Error),

    /// Transient failure accepting a new connection.
    #[error("accept fault: {0}")]
    Accept(#[source] io::Error),
}

impl RelayError {
    /// Whether this error ends the connection it happened on.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RelayError::Decode(_))
    }

    /// A short read of zero bytes at a frame boundary is an orderly close by the peer.
    pub fn is_clean_close(&self) -> bool {
        matches!(self, RelayError::ShortRead { received: 0, .. })
    }
}

/// Reasons a frame payload fails to decode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("payload of {len} bytes is too short to hold a name length")]
    Truncated { len: usize },

    #[error("name length {name_len} overruns payload of {payload_len} bytes")]
    NameOverrun { name_len: usize, payload_len: usize },

    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },
}

/// Reasons a message cannot be encoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("{field} of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge {
        field: &'static str,
        len: usize,
        max: usize,
    },
}
