//! Chat Bots
//!
//! Spawns a group of scripted clients that each post a fixed number of lines
//! and count everything the relay delivers to them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{ClientReader, RelayClient};
use crate::Result;

#[derive(Debug, Clone)]
pub struct BotOptions {
    pub server_addr: SocketAddr,
    pub bots: usize,
    pub messages: usize,
    pub interval: Duration,
    pub name_prefix: String,
    /// How long bots keep listening after the last one finished sending
    pub linger: Duration,
}

impl Default for BotOptions {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], crate::protocol::DEFAULT_PORT)),
            bots: 3,
            messages: 10,
            interval: Duration::from_millis(500),
            name_prefix: "bot".to_string(),
            linger: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BotReport {
    pub bots: usize,
    pub sent: u64,
    pub received: u64,
}

/// Run the bots to completion
pub async fn run(options: BotOptions) -> Result<BotReport> {
    let received = Arc::new(AtomicU64::new(0));
    let stop_listening = CancellationToken::new();

    let mut readers = JoinSet::new();
    let mut writers = Vec::with_capacity(options.bots);
    for index in 0..options.bots {
        let name = format!("{}-{}", options.name_prefix, index + 1);
        let (reader, writer) = RelayClient::connect(options.server_addr, name).await?.into_split();
        readers.spawn(count_incoming(
            reader,
            Arc::clone(&received),
            stop_listening.clone(),
        ));
        writers.push(writer);
    }
    info!(bots = options.bots, "Bots connected");

    // Give the relay a moment to register every bot before the first line.
    tokio::time::sleep(options.interval).await;

    let mut senders = JoinSet::new();
    for mut writer in writers {
        let messages = options.messages;
        let interval = options.interval;
        senders.spawn(async move {
            let mut sent = 0u64;
            for seq in 1..=messages {
                let text = format!("message {} from {}", seq, writer.name());
                writer.send(&text).await?;
                sent += 1;
                if seq < messages {
                    tokio::time::sleep(interval).await;
                }
            }
            Ok::<_, anyhow::Error>((writer, sent))
        });
    }

    let mut sent = 0;
    let mut finished_writers = Vec::new();
    while let Some(result) = senders.join_next().await {
        let (writer, count) = result??;
        sent += count;
        finished_writers.push(writer);
    }

    tokio::time::sleep(options.linger).await;
    stop_listening.cancel();
    while let Some(result) = readers.join_next().await {
        if let Err(e) = result {
            warn!(error = %e, "Bot reader task failed");
        }
    }
    for mut writer in finished_writers {
        writer.shutdown().await;
    }

    let report = BotReport {
        bots: options.bots,
        sent,
        received: received.load(Ordering::Relaxed),
    };
    info!(sent = report.sent, received = report.received, "Bots finished");
    Ok(report)
}

async fn count_incoming(mut reader: ClientReader, received: Arc<AtomicU64>, stop: CancellationToken) {
    loop {
        let incoming = tokio::select! {
            _ = stop.cancelled() => break,
            incoming = reader.recv() => incoming,
        };

        match incoming {
            Ok(Some(message)) => {
                debug!(from = %message.name, "bot received message");
                received.fetch_add(1, Ordering::Relaxed);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "bot connection failed");
                break;
            }
        }
    }
}
