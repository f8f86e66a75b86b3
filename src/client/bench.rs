//! Relay Benchmark
//!
//! One sender, many receivers. Measures how long it takes for every receiver
//! to see every benchmark message and checks that each receiver saw them in
//! send order.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info};

use super::connection::{ClientReader, RelayClient};
use crate::Result;

const WARMUP_PREFIX: &str = "warmup";
const BENCH_PREFIX: &str = "bench:";
const WARMUP_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct BenchOptions {
    pub server_addr: SocketAddr,
    pub receivers: usize,
    pub messages: usize,
    /// Length of each message text in bytes
    pub payload_size: usize,
    /// Upper bound on the whole run, warm-up included
    pub timeout: Duration,
}

impl Default for BenchOptions {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], crate::protocol::DEFAULT_PORT)),
            receivers: 4,
            messages: 1000,
            payload_size: 64,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    pub receivers: usize,
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub out_of_order: u64,
    pub payload_size: usize,
    pub elapsed_ms: u128,
    pub messages_per_second: f64,
    pub bytes_per_second: f64,
}

impl BenchReport {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Every receiver got every message, in order
    pub fn is_complete(&self) -> bool {
        self.messages_delivered == self.messages_sent * self.receivers as u64 && self.out_of_order == 0
    }
}

enum ReceiverEvent {
    WarmedUp,
    Done { delivered: u64, out_of_order: u64 },
}

/// Run the benchmark against a live relay
pub async fn run(options: BenchOptions) -> Result<BenchReport> {
    if options.receivers == 0 {
        bail!("benchmark needs at least one receiver");
    }
    if options.messages == 0 {
        bail!("benchmark needs at least one message");
    }

    tokio::time::timeout(options.timeout, run_inner(&options))
        .await
        .context("benchmark timed out")?
}

async fn run_inner(options: &BenchOptions) -> Result<BenchReport> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut receivers = JoinSet::new();
    // Receivers never write, but dropping a write half would end their session.
    let mut idle_writers = Vec::with_capacity(options.receivers);
    for index in 0..options.receivers {
        let client = RelayClient::connect(options.server_addr, format!("bench-rx-{}", index + 1)).await?;
        let (reader, writer) = client.into_split();
        receivers.spawn(receive(reader, options.messages as u64, events_tx.clone()));
        idle_writers.push(writer);
    }
    drop(events_tx);

    let mut sender = RelayClient::connect(options.server_addr, "bench-tx").await?;

    let mut warmed_up = 0;
    while warmed_up < options.receivers {
        sender.send(WARMUP_PREFIX).await?;
        let deadline = tokio::time::sleep(WARMUP_INTERVAL);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events_rx.recv() => match event {
                    Some(ReceiverEvent::WarmedUp) => warmed_up += 1,
                    Some(ReceiverEvent::Done { .. }) | None => bail!("receiver left during warm-up"),
                },
            }
            if warmed_up == options.receivers {
                break;
            }
        }
    }
    info!(receivers = options.receivers, "All receivers warmed up");

    let padding = "x".repeat(options.payload_size.saturating_sub(BENCH_PREFIX.len() + 8));
    let started = Instant::now();
    for seq in 0..options.messages {
        sender.send(&format!("{BENCH_PREFIX}{seq:08}{padding}")).await?;
    }
    debug!(messages = options.messages, "All benchmark messages sent");

    let mut delivered = 0;
    let mut out_of_order = 0;
    let mut finished = 0;
    while finished < options.receivers {
        match events_rx.recv().await {
            Some(ReceiverEvent::Done {
                delivered: d,
                out_of_order: o,
            }) => {
                delivered += d;
                out_of_order += o;
                finished += 1;
            }
            Some(ReceiverEvent::WarmedUp) => {}
            None => break,
        }
    }
    let elapsed = started.elapsed();
    receivers.abort_all();
    for mut writer in idle_writers {
        writer.shutdown().await;
    }

    let messages_sent = options.messages as u64;
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    let report = BenchReport {
        receivers: options.receivers,
        messages_sent,
        messages_delivered: delivered,
        out_of_order,
        payload_size: options.payload_size,
        elapsed_ms: elapsed.as_millis(),
        messages_per_second: delivered as f64 / secs,
        bytes_per_second: (delivered as f64 * options.payload_size as f64) / secs,
    };
    info!(
        delivered = report.messages_delivered,
        elapsed_ms = report.elapsed_ms,
        "Benchmark finished"
    );
    Ok(report)
}

async fn receive(mut reader: ClientReader, expected: u64, events: mpsc::UnboundedSender<ReceiverEvent>) {
    let mut warmed_up = false;
    let mut delivered = 0;
    let mut out_of_order = 0;
    let mut next_seq = 0u64;

    while delivered < expected {
        let message = match reader.recv().await {
            Ok(Some(message)) => message,
            Ok(None) | Err(_) => break,
        };

        if message.text.starts_with(WARMUP_PREFIX) {
            if !warmed_up {
                warmed_up = true;
                let _ = events.send(ReceiverEvent::WarmedUp);
            }
            continue;
        }

        let Some(seq) = parse_seq(&message.text) else {
            continue;
        };
        if seq != next_seq {
            out_of_order += 1;
        }
        next_seq = seq + 1;
        delivered += 1;
    }

    let _ = events.send(ReceiverEvent::Done {
        delivered,
        out_of_order,
    });
}

fn parse_seq(text: &str) -> Option<u64> {
    let digits = text.strip_prefix(BENCH_PREFIX)?.get(..8)?;
    digits.parse().ok()
}
