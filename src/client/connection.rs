//! Relay Client Connection

use std::net::SocketAddr;

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::protocol::{decode_payload, encode_frame, read_frame, write_frame, ChatMessage};
use crate::Result;

/// A framed connection to a relay, speaking under one display name.
pub struct RelayClient {
    reader: ClientReader,
    writer: ClientWriter,
}

impl RelayClient {
    pub async fn connect(addr: SocketAddr, name: impl Into<String>) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {}", addr))?;
        stream.set_nodelay(true)?;
        info!("connected to {}", addr);

        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: ClientReader { reader },
            writer: ClientWriter {
                writer,
                name: name.into(),
            },
        })
    }

    pub fn name(&self) -> &str {
        &self.writer.name
    }

    pub async fn send(&mut self, text: &str) -> Result<()> {
        self.writer.send(text).await
    }

    pub async fn recv(&mut self) -> Result<Option<ChatMessage>> {
        self.reader.recv().await
    }

    /// Split into halves that can be driven from separate tasks
    pub fn into_split(self) -> (ClientReader, ClientWriter) {
        (self.reader, self.writer)
    }
}

/// Receiving half of a [`RelayClient`]
pub struct ClientReader {
    reader: OwnedReadHalf,
}

impl ClientReader {
    /// Next message from the relay, or `None` once the relay closed the
    /// connection. Malformed frames are skipped.
    pub async fn recv(&mut self) -> Result<Option<ChatMessage>> {
        loop {
            let payload = match read_frame(&mut self.reader).await {
                Ok(payload) => payload,
                Err(e) if e.is_clean_close() => return Ok(None),
                Err(e) => return Err(e).context("failed to read from relay"),
            };

            match decode_payload(&payload) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => warn!(error = %e, "skipping malformed frame from relay"),
            }
        }
    }
}

/// Sending half of a [`RelayClient`]
pub struct ClientWriter {
    writer: OwnedWriteHalf,
    name: String,
}

impl ClientWriter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn send(&mut self, text: &str) -> Result<()> {
        let frame = encode_frame(&ChatMessage::new(self.name.clone(), text))?;
        write_frame(&mut self.writer, &frame)
            .await
            .context("failed to write to relay")?;
        debug!(len = text.len(), "sent message");
        Ok(())
    }

    /// Half-close the connection so the relay sees a clean end of stream
    pub async fn shutdown(&mut self) {
        if let Err(error) = self.writer.shutdown().await {
            warn!(?error, "failed to shutdown client writer cleanly");
        }
    }
}
