//! Instrumentation counters
//!
//! Process-wide counters in the style of Go's expvar: cheap atomics bumped
//! on the hot path and read through [`snapshot`]. Per-connection numbers
//! live in [`ConnectionStats`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Monotonic process-wide counter
#[derive(Debug)]
pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) static PACKETS_SENT: Counter = Counter::new();
pub(crate) static PACKETS_RECEIVED: Counter = Counter::new();
pub(crate) static STATE_PACKETS_SENT: Counter = Counter::new();
pub(crate) static UNSENT_STATE_PACKETS: Counter = Counter::new();
pub(crate) static TIMEOUT_RESENDS: Counter = Counter::new();
pub(crate) static ACK_SKIPPED_RESENDS: Counter = Counter::new();
pub(crate) static DUPLICATE_PACKETS: Counter = Counter::new();
pub(crate) static PACKETS_AHEAD_OF_WINDOW: Counter = Counter::new();
pub(crate) static MALFORMED_PACKETS: Counter = Counter::new();
pub(crate) static UNEXPECTED_PACKET_RESETS: Counter = Counter::new();
pub(crate) static BACKLOG_EVICTIONS: Counter = Counter::new();
pub(crate) static DELIVERIES_PROCESSED: Counter = Counter::new();
pub(crate) static ACKS_RECEIVED: Counter = Counter::new();
pub(crate) static SEND_ERRORS: Counter = Counter::new();

/// Point-in-time copy of the process-wide counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub state_packets_sent: u64,
    /// Pending ST_STATE made redundant by another outgoing packet
    pub unsent_state_packets: u64,
    pub timeout_resends: u64,
    pub ack_skipped_resends: u64,
    pub duplicate_packets: u64,
    pub packets_ahead_of_window: u64,
    pub malformed_packets: u64,
    pub unexpected_packet_resets: u64,
    pub backlog_evictions: u64,
    pub deliveries_processed: u64,
    pub acks_received: u64,
    pub send_errors: u64,
}

pub fn snapshot() -> CounterSnapshot {
    CounterSnapshot {
        packets_sent: PACKETS_SENT.get(),
        packets_received: PACKETS_RECEIVED.get(),
        state_packets_sent: STATE_PACKETS_SENT.get(),
        unsent_state_packets: UNSENT_STATE_PACKETS.get(),
        timeout_resends: TIMEOUT_RESENDS.get(),
        ack_skipped_resends: ACK_SKIPPED_RESENDS.get(),
        duplicate_packets: DUPLICATE_PACKETS.get(),
        packets_ahead_of_window: PACKETS_AHEAD_OF_WINDOW.get(),
        malformed_packets: MALFORMED_PACKETS.get(),
        unexpected_packet_resets: UNEXPECTED_PACKET_RESETS.get(),
        backlog_evictions: BACKLOG_EVICTIONS.get(),
        deliveries_processed: DELIVERIES_PROCESSED.get(),
        acks_received: ACKS_RECEIVED.get(),
        send_errors: SEND_ERRORS.get(),
    }
}

/// Connection statistics
#[derive(Debug, Default, Clone, Serialize)]
pub struct ConnectionStats {
    /// Packets sent, retransmissions included
    pub packets_sent: u64,

    /// Packets received
    pub packets_received: u64,

    /// Bytes sent (payload only)
    pub bytes_sent: u64,

    /// Bytes received (payload only)
    pub bytes_received: u64,

    /// Packets retransmitted
    pub resends: u64,

    /// Mean latency of recent acks
    pub latency: Duration,

    /// Unacknowledged payload bytes in flight
    pub cur_window: u32,

    /// Window last advertised by the peer
    pub peer_window: u32,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&mut self, bytes: u64) {
        self.packets_sent += 1;
        self.bytes_sent += bytes;
    }

    pub fn record_received(&mut self, bytes: u64) {
        self.packets_received += 1;
        self.bytes_received += bytes;
    }

    pub fn record_resend(&mut self) {
        self.resends += 1;
    }
}
