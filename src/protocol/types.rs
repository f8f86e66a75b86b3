//! Wire Protocol Types

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::protocol::constants::*;

/// A chat message as carried inside a frame payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub name: String,
    pub text: String,
}

impl ChatMessage {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }
}

/// A complete wire frame: `[u16 payload length][payload]`.
///
/// Cloning is cheap, so one encoded frame can be queued on many connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Bytes,
}

impl Frame {
    /// Wrap an already encoded payload with its length prefix
    pub fn from_payload(payload: &[u8]) -> Result<Self, CodecError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(CodecError::PayloadTooLarge {
                field: "payload",
                len: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }

        let mut buf = BytesMut::with_capacity(FRAME_LENGTH_SIZE + payload.len());
        buf.put_u16(payload.len() as u16);
        buf.put_slice(payload);

        Ok(Self { bytes: buf.freeze() })
    }

    /// Full wire bytes including the length prefix
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Payload bytes without the length prefix
    pub fn payload(&self) -> &[u8] {
        &self.bytes[FRAME_LENGTH_SIZE..]
    }

    /// Total number of bytes this frame occupies on the wire
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
