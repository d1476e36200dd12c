// src/core/metrics.rs

//! Defines and registers Prometheus metrics for gateway monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, TextEncoder, register_counter, register_counter_vec,
    register_gauge, register_histogram,
};

lazy_static! {
    // --- Gateway-wide Gauges ---
    /// The number of command connections currently open.
    pub static ref CONNECTED_CLIENTS: Gauge =
        register_gauge!("samgate_connected_clients", "Number of currently connected clients.").unwrap();
    /// Sessions committed to the registry, sub-sessions included.
    pub static ref ACTIVE_SESSIONS: Gauge =
        register_gauge!("samgate_active_sessions", "Number of live sessions in the registry.").unwrap();
    /// Open streams, framed or spliced.
    pub static ref OPEN_STREAMS: Gauge =
        register_gauge!("samgate_open_streams", "Number of open streams across all sessions.").unwrap();

    // --- Gateway-wide Counters ---
    pub static ref CONNECTIONS_RECEIVED_TOTAL: Counter =
        register_counter!("samgate_connections_received_total", "Total number of connections received.").unwrap();
    /// Commands processed, labeled by protocol domain.
    pub static ref COMMANDS_PROCESSED_TOTAL: CounterVec =
        register_counter_vec!("samgate_commands_processed_total", "Total number of commands processed.", &["domain"]).unwrap();
    pub static ref DATAGRAMS_SENT_TOTAL: Counter =
        register_counter!("samgate_datagrams_sent_total", "Total number of datagrams handed to the transport.").unwrap();
    pub static ref DATAGRAMS_RECEIVED_TOTAL: Counter =
        register_counter!("samgate_datagrams_received_total", "Total number of datagrams delivered to clients.").unwrap();
    /// Malformed, unroutable or undeliverable messages.
    pub static ref DATAGRAMS_DROPPED_TOTAL: Counter =
        register_counter!("samgate_datagrams_dropped_total", "Total number of datagrams dropped.").unwrap();

    // --- Histograms ---
    /// A histogram of command handling latencies.
    pub static ref COMMAND_LATENCY_SECONDS: Histogram =
        register_histogram!("samgate_command_latency_seconds", "Latency of command processing in seconds.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| format!("# failed to encode metrics: {e}\n"))
}
