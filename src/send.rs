//! Outstanding send bookkeeping
//!
//! One [`SendRecord`] exists per SYN/DATA/FIN packet from transmission
//! until its first ack. Retransmissions reuse the record and its sequence
//! number.

use std::time::{Duration, Instant};

use crate::packet::PacketType;
use crate::pool::PooledBuffer;
use crate::timer::Timer;

/// What a fired retransmit timer should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeoutAction {
    /// Acked or otherwise moot
    Ignore,
    /// Unacked past the write timeout; the connection is dead
    GiveUp,
    /// Send the payload again
    Resend,
}

/// Skip counts at which a send is retransmitted ahead of its timer
pub(crate) const EARLY_RESEND_SKIPS: [u32; 2] = [3, 60];

#[derive(Debug)]
pub(crate) struct SendRecord {
    seq_nr: u16,
    conn_id: u16,
    packet_type: PacketType,
    payload: Option<PooledBuffer>,
    payload_size: u32,
    started_at: Instant,
    acked: bool,
    /// Selective acks that passed over this packet
    pub(crate) acks_skipped: u32,
    pub(crate) num_resends: u32,
    pub(crate) resend_timer: Timer,
}

impl SendRecord {
    pub(crate) fn new(
        seq_nr: u16,
        conn_id: u16,
        packet_type: PacketType,
        payload: PooledBuffer,
    ) -> Self {
        Self {
            seq_nr,
            conn_id,
            packet_type,
            payload_size: payload.len() as u32,
            payload: Some(payload),
            started_at: Instant::now(),
            acked: false,
            acks_skipped: 0,
            num_resends: 0,
            resend_timer: Timer::default(),
        }
    }

    pub(crate) fn seq_nr(&self) -> u16 {
        self.seq_nr
    }

    pub(crate) fn conn_id(&self) -> u16 {
        self.conn_id
    }

    pub(crate) fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub(crate) fn payload_size(&self) -> u32 {
        self.payload_size
    }

    /// Payload still held for retransmission (empty once acked)
    pub(crate) fn payload(&self) -> &[u8] {
        self.payload
            .as_deref()
            .map(|buf| buf.as_slice())
            .unwrap_or(&[])
    }

    pub(crate) fn is_acked(&self) -> bool {
        self.acked
    }

    /// Mark acked. Returns the latency and whether this was the first ack;
    /// only the first ack yields a latency sample and releases the payload.
    pub(crate) fn ack(&mut self) -> (Duration, bool) {
        let first = !self.acked;
        let latency = if first {
            self.started_at.elapsed()
        } else {
            Duration::ZERO
        };
        self.payload = None;
        self.acked = true;
        self.resend_timer.stop();
        (latency, first)
    }

    /// Decide what a fired retransmit timer does
    pub(crate) fn timeout_action(&self, write_timeout: Duration) -> TimeoutAction {
        if self.acked {
            TimeoutAction::Ignore
        } else if self.started_at.elapsed() >= write_timeout {
            TimeoutAction::GiveUp
        } else {
            TimeoutAction::Resend
        }
    }

    /// Count a selective ack that skipped this send; true when the count
    /// crosses an early-retransmit threshold.
    pub(crate) fn record_skip(&mut self) -> bool {
        self.acks_skipped += 1;
        !self.acked && EARLY_RESEND_SKIPS.contains(&self.acks_skipped)
    }

    /// Backoff multiplier for the next retransmit timer
    pub(crate) fn backoff(&self) -> u32 {
        self.num_resends.max(1)
    }
}
