//! Metrics Collector

use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::Result;

/// Relay counters, exported in Prometheus text format
pub struct RelayMetrics {
    registry: Registry,

    connections_total: IntCounter,
    active_connections: IntGauge,
    messages_received_total: IntCounter,
    frames_enqueued_total: IntCounter,
    decode_failures_total: IntCounter,
    connection_faults_total: IntCounter,
    bytes_received_total: IntCounter,
    bytes_sent_total: IntCounter,
    connection_duration: Histogram,
}

/// Point-in-time counter values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub active_connections: i64,
    pub messages_received: u64,
    pub frames_enqueued: u64,
    pub decode_failures: u64,
    pub connection_faults: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

impl RelayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let connections_total = IntCounter::new(
            "chatrelay_connections_total",
            "Total number of accepted connections",
        )?;
        let active_connections = IntGauge::new(
            "chatrelay_active_connections",
            "Number of currently registered connections",
        )?;
        let messages_received_total = IntCounter::new(
            "chatrelay_messages_received_total",
            "Chat messages decoded from clients",
        )?;
        let frames_enqueued_total = IntCounter::new(
            "chatrelay_frames_enqueued_total",
            "Frames queued for delivery to recipients",
        )?;
        let decode_failures_total = IntCounter::new(
            "chatrelay_decode_failures_total",
            "Malformed frames dropped",
        )?;
        let connection_faults_total = IntCounter::new(
            "chatrelay_connection_faults_total",
            "Connections closed by a receive-path fault or peer disconnect",
        )?;
        let bytes_received_total = IntCounter::new(
            "chatrelay_bytes_received_total",
            "Wire bytes read from clients",
        )?;
        let bytes_sent_total = IntCounter::new(
            "chatrelay_bytes_sent_total",
            "Wire bytes written to clients",
        )?;
        let connection_duration = Histogram::with_opts(
            HistogramOpts::new(
                "chatrelay_connection_duration_seconds",
                "Lifetime of closed connections in seconds",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 3600.0]),
        )?;

        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(messages_received_total.clone()))?;
        registry.register(Box::new(frames_enqueued_total.clone()))?;
        registry.register(Box::new(decode_failures_total.clone()))?;
        registry.register(Box::new(connection_faults_total.clone()))?;
        registry.register(Box::new(bytes_received_total.clone()))?;
        registry.register(Box::new(bytes_sent_total.clone()))?;
        registry.register(Box::new(connection_duration.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            active_connections,
            messages_received_total,
            frames_enqueued_total,
            decode_failures_total,
            connection_faults_total,
            bytes_received_total,
            bytes_sent_total,
            connection_duration,
        })
    }

    pub fn connection_opened(&self) {
        self.connections_total.inc();
    }

    /// Record a connection lost to a fault, with its lifetime
    pub fn connection_faulted(&self, lifetime: Duration) {
        self.connection_faults_total.inc();
        self.connection_duration.observe(lifetime.as_secs_f64());
    }

    pub fn set_active_connections(&self, count: usize) {
        self.active_connections.set(count as i64);
    }

    pub fn message_received(&self) {
        self.messages_received_total.inc();
    }

    pub fn frames_enqueued(&self, count: usize) {
        self.frames_enqueued_total.inc_by(count as u64);
    }

    pub fn decode_failure(&self) {
        self.decode_failures_total.inc();
    }

    pub fn bytes_received(&self, bytes: usize) {
        self.bytes_received_total.inc_by(bytes as u64);
    }

    pub fn bytes_sent(&self, bytes: usize) {
        self.bytes_sent_total.inc_by(bytes as u64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.get(),
            active_connections: self.active_connections.get(),
            messages_received: self.messages_received_total.get(),
            frames_enqueued: self.frames_enqueued_total.get(),
            decode_failures: self.decode_failures_total.get(),
            connection_faults: self.connection_faults_total.get(),
            bytes_received: self.bytes_received_total.get(),
            bytes_sent: self.bytes_sent_total.get(),
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        match encoder.encode_to_string(&metric_families) {
            Ok(output) => output,
            Err(e) => {
                error!(error = %e, "Failed to encode Prometheus metrics");
                String::new()
            }
        }
    }
}

impl std::fmt::Debug for RelayMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_feed_snapshot() {
        let metrics = RelayMetrics::new().unwrap();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.set_active_connections(2);
        metrics.message_received();
        metrics.frames_enqueued(3);
        metrics.decode_failure();
        metrics.bytes_received(9);
        metrics.bytes_sent(27);
        metrics.connection_faulted(Duration::from_millis(250));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_total, 2);
        assert_eq!(snapshot.active_connections, 2);
        assert_eq!(snapshot.messages_received, 1);
        assert_eq!(snapshot.frames_enqueued, 3);
        assert_eq!(snapshot.decode_failures, 1);
        assert_eq!(snapshot.connection_faults, 1);
        assert_eq!(snapshot.bytes_received, 9);
        assert_eq!(snapshot.bytes_sent, 27);
    }

    #[test]
    fn test_prometheus_export_names() {
        let metrics = RelayMetrics::new().unwrap();
        metrics.message_received();

        let output = metrics.export_prometheus();
        assert!(output.contains("chatrelay_messages_received_total 1"));
        assert!(output.contains("chatrelay_active_connections 0"));
        assert!(output.contains("chatrelay_connection_duration_seconds_bucket"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = RelayMetrics::new().unwrap();
        let b = RelayMetrics::new().unwrap();
        a.connection_opened();
        assert_eq!(b.snapshot().connections_total, 0);
    }
}
