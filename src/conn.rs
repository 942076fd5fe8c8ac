//! uTP connection
//!
//! [`Conn`] is the per-stream state machine. It lives in its socket's
//! connection arena and is only touched with the socket lock held, whether
//! from the reader task, a timer or a [`UtpStream`] call. Sequence numbers,
//! the unacked send queue and the reorder buffer follow BEP 29: `last_ack`
//! is the newest sequence number with every earlier send acked, and
//! `inbound[0]` always stands for `ack_nr + 1`.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use rand::Rng;

use crate::config::UtpConfig;
use crate::error::{Result, UtpError};
use crate::metrics::{self, ConnectionStats};
use crate::packet::{seq_less, timestamp_us, Header, PacketType, MAX_PAYLOAD_SIZE, MAX_UNACKED_INBOUND};
use crate::pool::send_buffers;
use crate::selective_ack::SelectiveAckBitmask;
use crate::send::{SendRecord, TimeoutAction};
use crate::socket::{ConnHandle, ConnKey, Datagram, Shared, SocketRef};
use crate::timer::{self, Timer, TimerKind, TimerPoll};

/// Latency samples averaged for the resend timeout
const LATENCY_SAMPLES: usize = 10;

/// Callback receiving datagram send failures for one connection
pub type ErrorCallback = Arc<dyn Fn(&io::Error) + Send + Sync>;

/// One reorder-buffer slot
#[derive(Debug, Default)]
struct Recv {
    seen: bool,
    fin: bool,
    data: Vec<u8>,
}

pub(crate) struct Conn {
    handle: ConnHandle,
    socket: SocketRef,
    config: Arc<UtpConfig>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    recv_id: u16,
    send_id: u16,

    /// Next sequence number to assign
    seq_nr: u16,
    /// Newest in-order sequence number received
    ack_nr: u16,
    /// Every send up to here is acked
    last_ack: u16,
    last_time_diff: u32,
    peer_wnd: u32,
    cur_window: u32,

    unacked_sends: VecDeque<SendRecord>,
    inbound: VecDeque<Recv>,
    inbound_wnd: usize,
    read_buf: BytesMut,
    latencies: VecDeque<Duration>,

    syn_acked: bool,
    got_fin: bool,
    wrote_fin: bool,
    closed: bool,
    destroyed: bool,
    /// The public handle was dropped
    detached: bool,
    err: Option<UtpError>,

    pending_send_state: bool,
    send_state_timer: Timer,
    idle_timer: Timer,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    read_deadline_timer: Timer,
    write_deadline_timer: Timer,

    stats: ConnectionStats,
    error_callback: Option<ErrorCallback>,
}

impl Conn {
    fn new(
        handle: ConnHandle,
        socket: SocketRef,
        config: Arc<UtpConfig>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        recv_id: u16,
        send_id: u16,
    ) -> Self {
        Self {
            handle,
            socket,
            config,
            local_addr,
            remote_addr,
            recv_id,
            send_id,
            seq_nr: 1,
            ack_nr: 0,
            last_ack: 0,
            last_time_diff: 0,
            peer_wnd: 0,
            cur_window: 0,
            unacked_sends: VecDeque::new(),
            inbound: VecDeque::new(),
            inbound_wnd: 0,
            read_buf: BytesMut::new(),
            latencies: VecDeque::with_capacity(LATENCY_SAMPLES),
            syn_acked: false,
            got_fin: false,
            wrote_fin: false,
            closed: false,
            destroyed: false,
            detached: false,
            err: None,
            pending_send_state: false,
            send_state_timer: Timer::default(),
            idle_timer: Timer::default(),
            read_deadline: None,
            write_deadline: None,
            read_deadline_timer: Timer::default(),
            write_deadline_timer: Timer::default(),
            stats: ConnectionStats::new(),
            error_callback: None,
        }
    }

    /// Dialing side: we receive on `recv_id` and the SYN carries it
    pub(crate) fn new_outgoing(
        handle: ConnHandle,
        socket: SocketRef,
        config: Arc<UtpConfig>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        recv_id: u16,
    ) -> Self {
        Self::new(
            handle,
            socket,
            config,
            local_addr,
            remote_addr,
            recv_id,
            recv_id.wrapping_add(1),
        )
    }

    /// Accepting side, built from the peer's SYN
    pub(crate) fn new_incoming(
        handle: ConnHandle,
        socket: SocketRef,
        config: Arc<UtpConfig>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        syn: &Header,
    ) -> Self {
        let mut conn = Self::new(
            handle,
            socket,
            config,
            local_addr,
            remote_addr,
            syn.conn_id.wrapping_add(1),
            syn.conn_id,
        );
        conn.ack_nr = syn.seq_nr;
        conn.syn_acked = true;
        conn.peer_wnd = syn.wnd_size;
        conn
    }

    /// Send the SYN of an outgoing connection
    pub(crate) fn send_syn(&mut self) -> Result<()> {
        self.arm(TimerKind::Idle, self.config.packet_read_timeout());
        self.write(PacketType::Syn, &[]).map(|_| ())
    }

    /// Answer the SYN of an incoming connection
    pub(crate) fn start_incoming(&mut self) {
        self.arm(TimerKind::Idle, self.config.packet_read_timeout());
        self.send_state();
    }

    pub(crate) fn handle(&self) -> ConnHandle {
        self.handle
    }

    pub(crate) fn key(&self) -> ConnKey {
        ConnKey {
            remote_addr: self.remote_addr,
            conn_id: self.recv_id,
        }
    }

    pub(crate) fn recv_id(&self) -> u16 {
        self.recv_id
    }

    pub(crate) fn send_id(&self) -> u16 {
        self.send_id
    }

    pub(crate) fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached
    }

    pub(crate) fn error_callback(&self) -> Option<ErrorCallback> {
        self.error_callback.clone()
    }

    pub(crate) fn set_error_callback(&mut self, callback: ErrorCallback) {
        self.error_callback = Some(callback);
    }

    /// The cause stored by the first `destroy`
    fn cause(&self) -> UtpError {
        self.err.clone().unwrap_or(UtpError::Closed)
    }

    pub(crate) fn stats(&self) -> ConnectionStats {
        let mut stats = self.stats.clone();
        stats.latency = self.latency();
        stats.cur_window = self.cur_window;
        stats.peer_window = self.peer_wnd;
        stats
    }

    // Timers

    fn timer_mut(&mut self, kind: TimerKind) -> Option<&mut Timer> {
        match kind {
            TimerKind::Resend(seq_nr) => {
                let index = self.send_index(seq_nr)?;
                self.unacked_sends
                    .get_mut(index)
                    .map(|send| &mut send.resend_timer)
            }
            TimerKind::SendState => Some(&mut self.send_state_timer),
            TimerKind::Idle => Some(&mut self.idle_timer),
            TimerKind::ReadDeadline => Some(&mut self.read_deadline_timer),
            TimerKind::WriteDeadline => Some(&mut self.write_deadline_timer),
        }
    }

    fn arm(&mut self, kind: TimerKind, delay: Duration) {
        self.arm_at(kind, Instant::now() + delay);
    }

    fn arm_at(&mut self, kind: TimerKind, deadline: Instant) {
        if self.destroyed {
            return;
        }
        let Some(generation) = self.timer_mut(kind).and_then(|timer| timer.reset(deadline)) else {
            return;
        };
        timer::spawn(
            self.socket.shared.clone(),
            self.handle,
            kind,
            generation,
            deadline,
        );
    }

    fn stop_timers(&mut self) {
        for send in &mut self.unacked_sends {
            send.resend_timer.stop();
        }
        self.send_state_timer.stop();
        self.idle_timer.stop();
        self.read_deadline_timer.stop();
        self.write_deadline_timer.stop();
    }

    pub(crate) fn poll_timer(&mut self, kind: TimerKind, generation: u64, now: Instant) -> TimerPoll {
        match self.timer_mut(kind) {
            Some(timer) => timer.poll(generation, now),
            None => TimerPoll::Stale,
        }
    }

    /// Run the action of an expired timer
    pub(crate) fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Resend(seq_nr) => self.on_resend_timeout(seq_nr),
            TimerKind::SendState => {
                if self.pending_send_state && !self.destroyed {
                    self.send_state();
                }
            }
            TimerKind::Idle => {
                if !self.destroyed {
                    let timeout = self.config.packet_read_timeout();
                    tracing::debug!(
                        "Nothing from {} (recv_id {}) for {:?}",
                        self.remote_addr,
                        self.recv_id,
                        timeout
                    );
                    self.destroy(UtpError::IdleTimeout(timeout));
                }
            }
            // Blocked callers re-check the deadline once woken
            TimerKind::ReadDeadline | TimerKind::WriteDeadline => {}
        }
    }

    // Latency

    fn push_latency(&mut self, latency: Duration) {
        if self.latencies.len() == LATENCY_SAMPLES {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    /// Mean of the recent ack latencies, rounded up
    fn latency(&self) -> Duration {
        if self.latencies.is_empty() {
            return self.config.initial_latency();
        }
        let total: u128 = self.latencies.iter().map(Duration::as_nanos).sum();
        let mean = total.div_ceil(self.latencies.len() as u128);
        Duration::from_nanos(mean.min(u64::MAX as u128) as u64)
    }

    /// `3L + U[0, L)`
    fn resend_timeout(&self) -> Duration {
        let latency = self.latency();
        let micros = latency.as_micros().min(u64::MAX as u128) as u64;
        let jitter = if micros == 0 {
            0
        } else {
            rand::rng().random_range(0..micros)
        };
        latency * 3 + Duration::from_micros(jitter)
    }

    // Outbound

    /// Advertised receive window
    fn wnd_size(&self) -> u32 {
        if self.inbound.len() > MAX_UNACKED_INBOUND / 2 {
            return 0;
        }
        let used = self.read_buf.len() + self.inbound_wnd;
        self.config.read_buffer_len.saturating_sub(used) as u32
    }

    fn make_header(&self, packet_type: PacketType, conn_id: u16, seq_nr: u16) -> Header {
        let mut header = Header::new(packet_type, conn_id, seq_nr, self.ack_nr)
            .with_timestamps(timestamp_us(), self.last_time_diff)
            .with_window(self.wnd_size());

        // inbound[0] is always missing, so bit 0 stands for inbound[1]
        let mut sack = SelectiveAckBitmask::new();
        for (i, slot) in self.inbound.iter().enumerate().skip(1) {
            if slot.seen {
                sack.set_bit(i - 1);
            }
        }
        if !sack.is_empty() {
            header = header.with_selective_ack(sack);
        }
        header
    }

    fn build_datagram(
        &self,
        packet_type: PacketType,
        conn_id: u16,
        seq_nr: u16,
        payload: &[u8],
    ) -> Result<Datagram> {
        let header = self.make_header(packet_type, conn_id, seq_nr);
        let datagram = Datagram::encode(self.remote_addr, &header, payload, Some(self.handle))?;
        Ok(datagram)
    }

    /// Hand a datagram to the socket writer and account for it
    fn transmit(&mut self, packet_type: PacketType, datagram: Datagram, payload_len: usize) -> Result<()> {
        self.socket.send(datagram)?;

        self.stats.record_sent(payload_len as u64);
        metrics::PACKETS_SENT.incr();
        if packet_type == PacketType::State {
            metrics::STATE_PACKETS_SENT.incr();
        }

        // Every packet carries our ack_nr, so a pending ST_STATE is moot
        if self.pending_send_state {
            self.pending_send_state = false;
            self.send_state_timer.stop();
            if packet_type != PacketType::State {
                metrics::UNSENT_STATE_PACKETS.incr();
            }
        }
        Ok(())
    }

    /// Send a SYN, DATA or FIN and track it until acked
    fn write(&mut self, packet_type: PacketType, payload: &[u8]) -> Result<usize> {
        if self.wrote_fin {
            return Err(UtpError::Closed);
        }
        if self.destroyed {
            return Err(UtpError::Destroyed(Box::new(self.cause())));
        }

        let payload = &payload[..payload.len().min(MAX_PAYLOAD_SIZE)];
        let conn_id = if packet_type == PacketType::Syn {
            self.recv_id
        } else {
            self.send_id
        };
        let seq_nr = self.seq_nr;

        let datagram = self.build_datagram(packet_type, conn_id, seq_nr, payload)?;
        if let Err(err) = self.transmit(packet_type, datagram, payload.len()) {
            self.destroy(err.clone());
            return Err(err);
        }

        self.seq_nr = self.seq_nr.wrapping_add(1);
        self.cur_window += payload.len() as u32;
        self.unacked_sends.push_back(SendRecord::new(
            seq_nr,
            conn_id,
            packet_type,
            send_buffers().copy_from(payload),
        ));
        let timeout = self.resend_timeout();
        self.arm(TimerKind::Resend(seq_nr), timeout);
        Ok(payload.len())
    }

    /// Retransmit `unacked_sends[index]` verbatim
    fn resend(&mut self, index: usize) {
        let Some(send) = self.unacked_sends.get(index) else {
            return;
        };
        if send.is_acked() {
            return;
        }
        let packet_type = send.packet_type();
        let payload_len = send.payload_size() as usize;
        tracing::trace!(
            "Resending {} seq_nr {} to {}",
            packet_type,
            send.seq_nr(),
            self.remote_addr
        );

        let result = self
            .build_datagram(packet_type, send.conn_id(), send.seq_nr(), send.payload())
            .and_then(|datagram| self.transmit(packet_type, datagram, payload_len));
        match result {
            Ok(()) => self.stats.record_resend(),
            Err(err) => self.destroy(err),
        }
    }

    fn send_state(&mut self) {
        let result = self
            .build_datagram(PacketType::State, self.send_id, self.seq_nr, &[])
            .and_then(|datagram| self.transmit(PacketType::State, datagram, 0));
        if let Err(err) = result {
            self.destroy(err);
        }
    }

    /// Schedule a coalesced ST_STATE
    fn pend_send_state(&mut self) {
        if self.pending_send_state {
            return;
        }
        self.pending_send_state = true;
        self.arm(TimerKind::SendState, self.config.pending_state_delay());
    }

    /// A retransmitted SYN matched this connection
    pub(crate) fn on_duplicate_syn(&mut self) {
        if !self.destroyed {
            self.send_state();
        }
    }

    // Acks

    /// Queue index of an unacked send
    fn send_index(&self, seq_nr: u16) -> Option<usize> {
        let index = seq_nr.wrapping_sub(self.last_ack).wrapping_sub(1) as usize;
        (index < self.unacked_sends.len()).then_some(index)
    }

    fn ack(&mut self, nr: u16) {
        if !seq_less(self.last_ack, nr) {
            return;
        }
        let Some(index) = self.send_index(nr) else {
            return;
        };
        let send = &mut self.unacked_sends[index];
        let (latency, first) = send.ack();
        if first {
            let size = send.payload_size();
            self.cur_window = self.cur_window.saturating_sub(size);
            self.push_latency(latency);
            metrics::ACKS_RECEIVED.incr();
        }
        while self.unacked_sends.front().is_some_and(SendRecord::is_acked) {
            self.unacked_sends.pop_front();
            self.last_ack = self.last_ack.wrapping_add(1);
        }
    }

    /// Cumulative ack through `nr`
    fn ack_to(&mut self, nr: u16) {
        if !seq_less(nr, self.seq_nr) {
            return;
        }
        while seq_less(self.last_ack, nr) {
            let before = self.last_ack;
            self.ack(self.last_ack.wrapping_add(1));
            if self.last_ack == before {
                break;
            }
        }
    }

    fn ack_skipped(&mut self, nr: u16) {
        let Some(index) = self.send_index(nr) else {
            return;
        };
        let send = &mut self.unacked_sends[index];
        if !send.record_skip() {
            return;
        }
        let backoff = send.backoff();
        metrics::ACK_SKIPPED_RESENDS.incr();
        self.resend(index);
        if self.destroyed {
            return;
        }
        let timeout = self.resend_timeout() * backoff;
        self.arm(TimerKind::Resend(nr), timeout);
    }

    fn apply_acks(&mut self, header: &Header) {
        self.ack_to(header.ack_nr);
        let Some(sack) = header.selective_ack() else {
            return;
        };
        // Gaps only count as skipped below the newest selectively acked packet
        let Some(last) = sack.last_set_bit() else {
            return;
        };
        self.ack_skipped(header.ack_nr.wrapping_add(1));
        for i in 0..=last {
            let nr = header.ack_nr.wrapping_add(2).wrapping_add(i as u16);
            if sack.bit_is_set(i) {
                self.ack(nr);
            } else {
                self.ack_skipped(nr);
            }
        }
    }

    fn on_resend_timeout(&mut self, seq_nr: u16) {
        if self.destroyed {
            return;
        }
        let Some(index) = self.send_index(seq_nr) else {
            return;
        };
        match self.unacked_sends[index].timeout_action(self.config.write_timeout()) {
            TimeoutAction::Ignore => {}
            TimeoutAction::GiveUp => {
                tracing::debug!(
                    "seq_nr {} to {} unacked after {:?}",
                    seq_nr,
                    self.remote_addr,
                    self.config.write_timeout()
                );
                self.destroy(UtpError::AckTimeout);
            }
            TimeoutAction::Resend => {
                let timeout = self.resend_timeout();
                self.resend(index);
                if self.destroyed {
                    return;
                }
                let send = &mut self.unacked_sends[index];
                send.num_resends += 1;
                let backoff = send.num_resends;
                metrics::TIMEOUT_RESENDS.incr();
                self.arm(TimerKind::Resend(seq_nr), timeout * backoff);
            }
        }
    }

    // Inbound

    /// Handle a packet routed to this connection
    pub(crate) fn receive_packet(&mut self, header: &Header, payload: &[u8]) {
        if self.destroyed {
            return;
        }
        self.arm(TimerKind::Idle, self.config.packet_read_timeout());
        self.stats.record_received(payload.len() as u64);
        self.process_delivery(header, payload);
        self.lazy_destroy();
    }

    fn process_delivery(&mut self, header: &Header, payload: &[u8]) {
        metrics::DELIVERIES_PROCESSED.incr();
        assert!(
            header.packet_type != PacketType::Syn && header.conn_id == self.recv_id,
            "{} with conn_id {} routed to recv_id {}",
            header.packet_type,
            header.conn_id,
            self.recv_id
        );

        self.peer_wnd = header.wnd_size;
        self.apply_acks(header);
        self.last_time_diff = if header.timestamp == 0 {
            0
        } else {
            timestamp_us().wrapping_sub(header.timestamp)
        };

        if header.packet_type == PacketType::Reset {
            self.destroy(UtpError::PeerReset);
            return;
        }

        if !self.syn_acked {
            if header.packet_type == PacketType::State {
                self.syn_acked = true;
                self.ack_nr = header.seq_nr.wrapping_sub(1);
            }
            return;
        }

        if header.packet_type == PacketType::State {
            return;
        }

        // Even a duplicate tells us the peer may have missed our ack
        self.pend_send_state();

        if !seq_less(self.ack_nr, header.seq_nr) {
            metrics::DUPLICATE_PACKETS.incr();
            return;
        }
        let index = header.seq_nr.wrapping_sub(self.ack_nr).wrapping_sub(1) as usize;
        if self.inbound.get(index).is_some_and(|slot| slot.seen) {
            metrics::DUPLICATE_PACKETS.incr();
            return;
        }
        if index >= MAX_UNACKED_INBOUND {
            metrics::PACKETS_AHEAD_OF_WINDOW.incr();
            tracing::trace!(
                "Dropping seq_nr {} from {}: {} ahead of next expected {}",
                header.seq_nr,
                self.remote_addr,
                index,
                self.ack_nr.wrapping_add(1)
            );
            return;
        }

        if index >= self.inbound.len() {
            self.inbound.resize_with(index + 1, Recv::default);
        }
        self.inbound[index] = Recv {
            seen: true,
            fin: header.packet_type == PacketType::Fin,
            data: payload.to_vec(),
        };
        self.inbound_wnd += payload.len();
        self.process_inbound();
    }

    /// Move contiguous packets from the reorder buffer into `read_buf`
    fn process_inbound(&mut self) {
        while !self.got_fin && self.read_buf.len() < self.config.read_buffer_len {
            if !self.inbound.front().is_some_and(|slot| slot.seen) {
                break;
            }
            let Some(slot) = self.inbound.pop_front() else {
                break;
            };
            self.ack_nr = self.ack_nr.wrapping_add(1);
            self.inbound_wnd -= slot.data.len();
            self.read_buf.extend_from_slice(&slot.data);
            if slot.fin {
                self.got_fin = true;
            }
        }
    }

    // Stream operations

    /// None means the caller must wait
    pub(crate) fn try_read(&mut self, buf: &mut [u8]) -> Option<Result<usize>> {
        if buf.is_empty() {
            return Some(Ok(0));
        }
        if !self.read_buf.is_empty() {
            let n = buf.len().min(self.read_buf.len());
            buf[..n].copy_from_slice(&self.read_buf[..n]);
            self.read_buf.advance(n);
            // The window just opened
            self.pend_send_state();
            if self.read_buf.is_empty() {
                self.process_inbound();
            }
            return Some(Ok(n));
        }
        if self.got_fin || self.closed {
            return Some(Ok(0));
        }
        if self.destroyed {
            return Some(Err(self.cause()));
        }
        if self.read_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Some(Err(UtpError::DeadlineExceeded));
        }
        None
    }

    /// Bytes the next DATA packet may carry
    fn write_capacity(&self) -> usize {
        if !self.syn_acked || self.unacked_sends.len() >= self.config.max_unacked_sends {
            return 0;
        }
        (self.peer_wnd.saturating_sub(self.cur_window) as usize).min(MAX_PAYLOAD_SIZE)
    }

    /// Send at most one DATA packet. None means the caller must wait.
    pub(crate) fn try_write(&mut self, buf: &[u8]) -> Option<Result<usize>> {
        if self.wrote_fin || self.closed {
            return Some(Err(UtpError::Closed));
        }
        if self.destroyed {
            return Some(Err(UtpError::Destroyed(Box::new(self.cause()))));
        }
        if self.write_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Some(Err(UtpError::DeadlineExceeded));
        }
        if buf.is_empty() {
            return Some(Ok(0));
        }
        match self.write_capacity().min(buf.len()) {
            0 => None,
            n => Some(self.write(PacketType::Data, &buf[..n])),
        }
    }

    /// Dial progress. None means the SYN is still unacked.
    pub(crate) fn poll_connected(&self) -> Option<Result<()>> {
        if self.destroyed {
            Some(Err(self.cause()))
        } else if self.syn_acked {
            Some(Ok(()))
        } else {
            None
        }
    }

    pub(crate) fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline;
        match deadline {
            Some(deadline) => self.arm_at(TimerKind::ReadDeadline, deadline),
            None => self.read_deadline_timer.stop(),
        }
    }

    pub(crate) fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline;
        match deadline {
            Some(deadline) => self.arm_at(TimerKind::WriteDeadline, deadline),
            None => self.write_deadline_timer.stop(),
        }
    }

    // Teardown

    pub(crate) fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.finish();
        self.lazy_destroy();
    }

    /// Close on behalf of a dropped handle
    pub(crate) fn detach(&mut self) {
        self.detached = true;
        self.close();
    }

    fn finish(&mut self) {
        if self.wrote_fin || self.destroyed {
            return;
        }
        if !self.syn_acked {
            self.destroy(UtpError::Closed);
            return;
        }
        if self.write(PacketType::Fin, &[]).is_ok() {
            self.wrote_fin = true;
        }
    }

    /// Destroy once our FIN is the only thing in flight
    fn lazy_destroy(&mut self) {
        if self.wrote_fin && self.unacked_sends.len() <= 1 && (self.got_fin || self.closed) {
            self.destroy(UtpError::Closed);
        }
    }

    /// Terminal. The first reason sticks.
    pub(crate) fn destroy(&mut self, reason: UtpError) {
        if self.destroyed {
            return;
        }
        tracing::debug!(
            "Destroying uTP connection to {} (recv_id {}): {}",
            self.remote_addr,
            self.recv_id,
            reason
        );
        self.stop_timers();
        self.destroyed = true;
        self.err = Some(reason);
        self.pending_send_state = false;
        self.unacked_sends.clear();
        self.inbound.clear();
        self.inbound_wnd = 0;
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("remote_addr", &self.remote_addr)
            .field("recv_id", &self.recv_id)
            .field("send_id", &self.send_id)
            .field("seq_nr", &self.seq_nr)
            .field("ack_nr", &self.ack_nr)
            .field("last_ack", &self.last_ack)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

/// A reliable byte stream over a [`UtpSocket`](crate::socket::UtpSocket)
///
/// Reads and writes take `&self`, so one task can read while another
/// writes. Dropping the stream closes it gracefully.
pub struct UtpStream {
    shared: Arc<Shared>,
    handle: ConnHandle,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    recv_id: u16,
    send_id: u16,
}

impl UtpStream {
    pub(crate) fn new(shared: Arc<Shared>, conn: &Conn) -> Self {
        Self {
            shared,
            handle: conn.handle,
            local_addr: conn.local_addr(),
            peer_addr: conn.remote_addr(),
            recv_id: conn.recv_id(),
            send_id: conn.send_id(),
        }
    }

    /// Lock, poll, and park on the socket event until `poll` yields
    async fn wait_for<T>(&self, mut poll: impl FnMut(&mut Conn) -> Option<Result<T>>) -> Result<T> {
        loop {
            let notified = {
                let mut state = self.shared.state.lock();
                let conn = state.conn_mut(self.handle)?;
                if let Some(result) = poll(conn) {
                    state.after_conn_event(self.handle);
                    drop(state);
                    if result.is_err() {
                        self.shared.event.notify_waiters();
                    }
                    return result;
                }
                // Registered before the lock is released, so no wakeup is lost
                self.shared.event.notified()
            };
            notified.await;
        }
    }

    /// Apply `f` under the lock and wake every waiter
    fn update(&self, f: impl FnOnce(&mut Conn)) {
        let mut state = self.shared.state.lock();
        if let Ok(conn) = state.conn_mut(self.handle) {
            f(conn);
        }
        state.after_conn_event(self.handle);
        drop(state);
        self.shared.event.notify_waiters();
    }

    pub(crate) async fn wait_connected(&self) -> Result<()> {
        self.wait_for(|conn| conn.poll_connected()).await
    }

    pub(crate) fn abort(&self, reason: UtpError) {
        self.update(|conn| conn.destroy(reason));
    }

    /// Read available bytes. Ok(0) is end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.wait_for(|conn| conn.try_read(buf)).await
    }

    /// Read exactly `buf.len()` bytes
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.read(&mut buf[total..]).await?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "Unexpected EOF").into());
            }
            total += n;
        }
        Ok(())
    }

    /// Write `buf`, blocking on the send window.
    ///
    /// Returns a short count if the connection fails after some bytes were
    /// sent; the next call reports the error.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            let rest = &buf[written..];
            let result = self.wait_for(|conn| conn.try_write(rest)).await;
            match result {
                Ok(n) => written += n,
                Err(err) if written > 0 => {
                    tracing::debug!("Short write to {} after {} bytes: {}", self.peer_addr, written, err);
                    return Ok(written);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(written)
    }

    pub async fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Send FIN. Further writes fail, reads return end of stream once
    /// buffered bytes are consumed.
    pub fn close(&self) {
        self.update(Conn::close);
    }

    /// Set both deadlines
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.update(|conn| {
            conn.set_read_deadline(deadline);
            conn.set_write_deadline(deadline);
        });
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.update(|conn| conn.set_read_deadline(deadline));
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.update(|conn| conn.set_write_deadline(deadline));
    }

    /// Called with the error of any failed datagram send on this stream
    pub fn set_error_callback(&self, callback: impl Fn(&io::Error) + Send + Sync + 'static) {
        let callback: ErrorCallback = Arc::new(callback);
        let mut state = self.shared.state.lock();
        if let Ok(conn) = state.conn_mut(self.handle) {
            conn.set_error_callback(callback);
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        let mut state = self.shared.state.lock();
        state
            .conn_mut(self.handle)
            .map(|conn| conn.stats())
            .unwrap_or_default()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Connection id the peer sends to
    pub fn recv_id(&self) -> u16 {
        self.recv_id
    }

    /// Connection id we send to
    pub fn send_id(&self) -> u16 {
        self.send_id
    }
}

impl fmt::Debug for UtpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UtpStream")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("recv_id", &self.recv_id)
            .field("send_id", &self.send_id)
            .finish()
    }
}

impl Drop for UtpStream {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if let Ok(conn) = state.conn_mut(self.handle) {
            conn.detach();
        }
        state.after_conn_event(self.handle);
        drop(state);
        self.shared.event.notify_waiters();
    }
}
