//! Framing Codec
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! +----------------+----------------+------------+------------+
//! | payload length |  name length   |    name    |    text    |
//! +----------------+----------------+------------+------------+
//! |       2        |       2        |  variable  | remainder  |
//! +----------------+----------------+------------+------------+
//! ```
//!
//! The text has no length of its own; it consumes whatever remains of the payload.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ChatMessage, Frame};
use crate::error::{CodecError, DecodeError, RelayError};
use crate::protocol::constants::*;

/// Encode a name and text into a frame payload (no length prefix).
pub fn encode_payload(name: &str, text: &str) -> Result<Bytes, CodecError> {
    if name.len() > MAX_NAME_LEN {
        return Err(CodecError::PayloadTooLarge {
            field: "name",
            len: name.len(),
            max: MAX_NAME_LEN,
        });
    }

    let payload_len = NAME_LENGTH_SIZE + name.len() + text.len();
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(CodecError::PayloadTooLarge {
            field: "payload",
            len: payload_len,
            max: MAX_PAYLOAD_LEN,
        });
    }

    let mut buf = BytesMut::with_capacity(payload_len);
    buf.put_u16(name.len() as u16);
    buf.put_slice(name.as_bytes());
    buf.put_slice(text.as_bytes());
    Ok(buf.freeze())
}

/// Encode a message into a complete wire frame.
pub fn encode_frame(message: &ChatMessage) -> Result<Frame, CodecError> {
    let payload = encode_payload(&message.name, &message.text)?;
    Frame::from_payload(&payload)
}

/// Decode a frame payload into a chat message.
pub fn decode_payload(payload: &[u8]) -> Result<ChatMessage, DecodeError> {
    if payload.len() < NAME_LENGTH_SIZE {
        return Err(DecodeError::Truncated { len: payload.len() });
    }

    let name_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    let available = payload.len() - NAME_LENGTH_SIZE;
    if name_len > available {
        return Err(DecodeError::NameOverrun {
            name_len,
            payload_len: payload.len(),
        });
    }

    let (name, text) = payload[NAME_LENGTH_SIZE..].split_at(name_len);
    let name = std::str::from_utf8(name).map_err(|_| DecodeError::InvalidUtf8 { field: "name" })?;
    let text = std::str::from_utf8(text).map_err(|_| DecodeError::InvalidUtf8 { field: "text" })?;

    Ok(ChatMessage::new(name, text))
}

/// Read one frame and return its payload.
///
/// A stream that ends before the frame is complete yields
/// `RelayError::ShortRead`, counting bytes of the whole frame (prefix
/// included). Only a stream ending exactly on a frame boundary reports
/// `received: 0`.
pub async fn read_frame<R>(reader: &mut R) -> Result<Bytes, RelayError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; FRAME_LENGTH_SIZE];
    let received = read_full(reader, &mut prefix).await?;
    if received != FRAME_LENGTH_SIZE {
        return Err(RelayError::ShortRead {
            expected: FRAME_LENGTH_SIZE,
            received,
        });
    }

    let payload_len = u16::from_be_bytes(prefix) as usize;
    let mut payload = vec![0u8; payload_len];
    let received = read_full(reader, &mut payload).await?;
    if received != payload_len {
        return Err(RelayError::ShortRead {
            expected: FRAME_LENGTH_SIZE + payload_len,
            received: FRAME_LENGTH_SIZE + received,
        });
    }

    Ok(Bytes::from(payload))
}

/// Write a whole frame, failing if the writer stops making progress.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = frame.as_bytes();
    let mut written = 0;
    while written < bytes.len() {
        let n = writer.write(&bytes[written..]).await?;
        if n == 0 {
            return Err(RelayError::ShortWrite {
                expected: bytes.len(),
                written,
            });
        }
        written += n;
    }
    writer.flush().await?;
    Ok(())
}

/// Fill `buf` as far as the stream allows and report how many bytes arrived.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize, RelayError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
