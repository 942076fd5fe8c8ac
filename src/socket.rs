//! uTP socket
//!
//! One UDP endpoint shared by many connections. A reader task parses every
//! datagram and routes it by `(remote_addr, conn_id)`; a writer task owns
//! all sends so the syscall never runs under the socket lock. Connections
//! live in an arena keyed by [`ConnHandle`]: a destroyed connection leaves
//! the routing table at once but stays in the arena until its
//! [`UtpStream`] is dropped.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::UtpConfig;
use crate::conn::{Conn, UtpStream};
use crate::error::{Result, UtpError};
use crate::metrics;
use crate::packet::{Header, HeaderError, PacketType, MAX_HEADER_SIZE, MAX_RECV_SIZE};
use crate::pool::{send_buffers, PooledBuffer};
use crate::timer::{TimerKind, TimerPoll};

/// Arena index of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnHandle(pub(crate) u64);

/// Routing key: the id the peer addresses us by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnKey {
    pub(crate) remote_addr: SocketAddr,
    pub(crate) conn_id: u16,
}

/// Encoded datagram queued for the writer task
pub(crate) struct Datagram {
    pub(crate) to: SocketAddr,
    pub(crate) data: PooledBuffer,
    /// Connection to blame if the send fails
    pub(crate) conn: Option<ConnHandle>,
}

impl Datagram {
    pub(crate) fn encode(
        to: SocketAddr,
        header: &Header,
        payload: &[u8],
        conn: Option<ConnHandle>,
    ) -> std::result::Result<Self, HeaderError> {
        let mut data = send_buffers().get();
        data.resize(MAX_HEADER_SIZE, 0);
        let len = header.marshal(&mut data)?;
        data.truncate(len);
        data.extend_from_slice(payload);
        Ok(Self { to, data, conn })
    }
}

/// A connection's way back to its socket
#[derive(Clone)]
pub(crate) struct SocketRef {
    outbound: UnboundedSender<Datagram>,
    pub(crate) shared: Weak<Shared>,
}

impl SocketRef {
    pub(crate) fn new(outbound: UnboundedSender<Datagram>, shared: Weak<Shared>) -> Self {
        Self { outbound, shared }
    }

    pub(crate) fn send(&self, datagram: Datagram) -> Result<()> {
        self.outbound
            .send(datagram)
            .map_err(|_| UtpError::SocketDestroyed("writer stopped".to_string()))
    }
}

/// SYN waiting in the accept backlog
#[derive(Debug)]
struct PendingSyn {
    from: SocketAddr,
    header: Header,
}

impl PendingSyn {
    fn same_as(&self, other: &PendingSyn) -> bool {
        self.from == other.from
            && self.header.conn_id == other.header.conn_id
            && self.header.seq_nr == other.header.seq_nr
    }
}

/// Everything guarded by the socket lock
pub(crate) struct SocketState {
    config: Arc<UtpConfig>,
    socket_ref: SocketRef,
    local_addr: SocketAddr,
    conns: HashMap<ConnHandle, Conn>,
    routes: HashMap<ConnKey, ConnHandle>,
    backlog: VecDeque<PendingSyn>,
    unused_reads: VecDeque<(Vec<u8>, SocketAddr)>,
    next_handle: u64,
    closed: bool,
    destroyed: bool,
    token: CancellationToken,
}

impl SocketState {
    fn new(
        config: Arc<UtpConfig>,
        socket_ref: SocketRef,
        local_addr: SocketAddr,
        token: CancellationToken,
    ) -> Self {
        Self {
            config,
            socket_ref,
            local_addr,
            conns: HashMap::new(),
            routes: HashMap::new(),
            backlog: VecDeque::new(),
            unused_reads: VecDeque::new(),
            next_handle: 0,
            closed: false,
            destroyed: false,
            token,
        }
    }

    pub(crate) fn conn_mut(&mut self, handle: ConnHandle) -> Result<&mut Conn> {
        self.conns
            .get_mut(&handle)
            .ok_or_else(|| UtpError::SocketDestroyed("connection released".to_string()))
    }

    fn next_handle(&mut self) -> ConnHandle {
        self.next_handle += 1;
        ConnHandle(self.next_handle)
    }

    fn insert_conn(&mut self, conn: Conn) -> ConnHandle {
        let handle = conn.handle();
        self.routes.insert(conn.key(), handle);
        self.conns.insert(handle, conn);
        handle
    }

    fn conn_id_free(&self, remote_addr: SocketAddr, id: u16) -> bool {
        [id, id.wrapping_add(1), id.wrapping_sub(1)]
            .into_iter()
            .all(|conn_id| {
                !self.routes.contains_key(&ConnKey {
                    remote_addr,
                    conn_id,
                })
            })
    }

    /// Random receive id towards `remote_addr` with both neighbours free.
    ///
    /// Draws without replacement (a lazy Fisher-Yates shuffle over the id
    /// space) so exhaustion is detected instead of looping forever.
    pub(crate) fn new_conn_id(&self, remote_addr: SocketAddr) -> Option<u16> {
        let mut rng = rand::rng();
        let mut swapped: HashMap<u32, u32> = HashMap::new();
        let mut remaining: u32 = 1 << 16;
        while remaining > 0 {
            let i = rng.random_range(0..remaining);
            let last = remaining - 1;
            let id = swapped.get(&i).copied().unwrap_or(i);
            let tail = swapped.get(&last).copied().unwrap_or(last);
            swapped.insert(i, tail);
            remaining = last;

            let id = id as u16;
            if self.conn_id_free(remote_addr, id) {
                return Some(id);
            }
        }
        None
    }

    /// Clean up after anything that may have destroyed or detached `handle`
    pub(crate) fn after_conn_event(&mut self, handle: ConnHandle) {
        if let Some(conn) = self.conns.get(&handle) {
            if conn.is_destroyed() {
                let key = conn.key();
                if self.routes.get(&key) == Some(&handle) {
                    self.routes.remove(&key);
                }
                if conn.is_detached() {
                    self.conns.remove(&handle);
                }
            }
        }
        self.lazy_destroy();
    }

    fn lazy_destroy(&mut self) {
        if self.closed && !self.destroyed && self.routes.is_empty() {
            self.destroy("closed");
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        tracing::debug!("Closing uTP socket {}", self.local_addr);
        self.closed = true;
        while let Some(syn) = self.backlog.pop_front() {
            self.send_reset(syn.from, syn.header.conn_id, syn.header.seq_nr);
        }
        self.lazy_destroy();
    }

    /// Tear down every connection and stop the socket tasks
    fn destroy(&mut self, reason: &str) {
        if self.destroyed {
            return;
        }
        tracing::debug!("Destroying uTP socket {}: {}", self.local_addr, reason);
        self.destroyed = true;
        self.closed = true;
        for conn in self.conns.values_mut() {
            conn.destroy(UtpError::SocketDestroyed(reason.to_string()));
        }
        self.routes.clear();
        self.conns.retain(|_, conn| !conn.is_detached());
        self.backlog.clear();
        self.token.cancel();
    }

    fn send_reset(&self, to: SocketAddr, conn_id: u16, ack_nr: u16) {
        let header = Header::new(PacketType::Reset, conn_id, 0, ack_nr);
        match Datagram::encode(to, &header, &[], None) {
            Ok(datagram) => {
                if self.socket_ref.send(datagram).is_err() {
                    tracing::trace!("Dropping reset to {}: writer stopped", to);
                }
            }
            Err(e) => tracing::warn!("Failed to encode reset for {}: {}", to, e),
        }
    }

    fn push_unused_read(&mut self, data: &[u8], from: SocketAddr) {
        if self.config.unused_read_capacity == 0 {
            return;
        }
        if self.unused_reads.len() >= self.config.unused_read_capacity {
            self.unused_reads.pop_front();
        }
        self.unused_reads.push_back((data.to_vec(), from));
    }

    fn push_backlog(&mut self, syn: PendingSyn) {
        if self.backlog.iter().any(|pending| pending.same_as(&syn)) {
            return;
        }
        while self.backlog.len() >= self.config.backlog {
            let Some(evicted) = self.backlog.pop_front() else {
                break;
            };
            metrics::BACKLOG_EVICTIONS.incr();
            tracing::debug!(
                "Backlog full on {}, resetting SYN from {} (conn_id {})",
                self.local_addr,
                evicted.from,
                evicted.header.conn_id
            );
            self.send_reset(evicted.from, evicted.header.conn_id, evicted.header.seq_nr);
        }
        self.backlog.push_back(syn);
    }

    fn on_unmatched_syn(&mut self, header: &Header, from: SocketAddr) {
        let refused = self
            .config
            .accept_filter
            .as_ref()
            .is_some_and(|filter| !filter.allows(from));
        if self.closed || refused {
            tracing::debug!("Refusing SYN from {} on {}", from, self.local_addr);
            self.send_reset(from, header.conn_id, header.seq_nr);
            return;
        }
        self.push_backlog(PendingSyn {
            from,
            header: header.clone(),
        });
    }

    /// Reset every id an unexpected packet could belong to
    fn reset_unexpected(&mut self, header: &Header, from: SocketAddr) {
        metrics::UNEXPECTED_PACKET_RESETS.incr();
        tracing::trace!(
            "Unexpected {} from {} for conn_id {}",
            header.packet_type,
            from,
            header.conn_id
        );
        for conn_id in [
            header.conn_id,
            header.conn_id.wrapping_sub(1),
            header.conn_id.wrapping_add(1),
        ] {
            self.send_reset(from, conn_id, header.seq_nr);
        }
    }

    /// Route a parsed packet
    fn dispatch(&mut self, header: &Header, payload: &[u8], from: SocketAddr) {
        // A SYN carries the id one below the one we will receive on
        let conn_id = if header.packet_type == PacketType::Syn {
            header.conn_id.wrapping_add(1)
        } else {
            header.conn_id
        };
        let key = ConnKey {
            remote_addr: from,
            conn_id,
        };

        if let Some(&handle) = self.routes.get(&key) {
            if let Some(conn) = self.conns.get_mut(&handle) {
                if header.packet_type != PacketType::Syn {
                    conn.receive_packet(header, payload);
                } else if conn.send_id() == header.conn_id {
                    conn.on_duplicate_syn();
                } else {
                    tracing::debug!(
                        "SYN from {} (conn_id {}) collides with recv_id {}",
                        from,
                        header.conn_id,
                        conn.recv_id()
                    );
                    self.send_reset(from, header.conn_id, header.seq_nr);
                }
                self.after_conn_event(handle);
                return;
            }
        }

        match header.packet_type {
            PacketType::Syn => self.on_unmatched_syn(header, from),
            PacketType::Reset => {
                tracing::trace!("Ignoring reset from {} for conn_id {}", from, header.conn_id)
            }
            _ => self.reset_unexpected(header, from),
        }
    }

    /// Pop the backlog. None means wait.
    fn try_accept(&mut self) -> Option<Result<ConnHandle>> {
        loop {
            if self.closed {
                return Some(Err(UtpError::SocketClosed));
            }
            let syn = self.backlog.pop_front()?;
            let key = ConnKey {
                remote_addr: syn.from,
                conn_id: syn.header.conn_id.wrapping_add(1),
            };

            // Retransmitted SYN for a connection accepted meanwhile
            if let Some(&handle) = self.routes.get(&key) {
                match self.conns.get_mut(&handle) {
                    Some(conn) if conn.send_id() == syn.header.conn_id => conn.on_duplicate_syn(),
                    _ => {
                        tracing::debug!(
                            "Backlogged SYN from {} (conn_id {}) collides with a live connection",
                            syn.from,
                            syn.header.conn_id
                        );
                        self.send_reset(syn.from, syn.header.conn_id, syn.header.seq_nr);
                    }
                }
                continue;
            }

            let handle = self.next_handle();
            let conn = Conn::new_incoming(
                handle,
                self.socket_ref.clone(),
                self.config.clone(),
                self.local_addr,
                syn.from,
                &syn.header,
            );
            tracing::debug!(
                "Accepted uTP connection from {} (recv_id {})",
                syn.from,
                conn.recv_id()
            );
            self.insert_conn(conn);
            if let Some(conn) = self.conns.get_mut(&handle) {
                conn.start_incoming();
            }
            self.after_conn_event(handle);
            return Some(Ok(handle));
        }
    }

    fn try_recv_from(&mut self, buf: &mut [u8]) -> Option<Result<(usize, SocketAddr)>> {
        if let Some((data, from)) = self.unused_reads.pop_front() {
            let n = buf.len().min(data.len());
            buf[..n].copy_from_slice(&data[..n]);
            return Some(Ok((n, from)));
        }
        if self.destroyed {
            return Some(Err(UtpError::SocketDestroyed("closed".to_string())));
        }
        None
    }
}

/// State shared by the socket handle, its streams and its tasks
pub(crate) struct Shared {
    pub(crate) state: Mutex<SocketState>,
    /// Broadcast after every state change under the lock
    pub(crate) event: Notify,
    config: Arc<UtpConfig>,
    local_addr: SocketAddr,
    /// Runtime the socket was bound on; timers run here even when armed
    /// from a thread outside it
    pub(crate) runtime: Handle,
}

impl Shared {
    /// Called by a timer's sleeper. Returns the instant to sleep until if
    /// the timer was pushed back.
    pub(crate) fn fire_timer(&self, handle: ConnHandle, kind: TimerKind, generation: u64) -> Option<Instant> {
        let mut state = self.state.lock();
        let conn = state.conns.get_mut(&handle)?;
        match conn.poll_timer(kind, generation, Instant::now()) {
            TimerPoll::Stale => None,
            TimerPoll::Pending(next) => Some(next),
            TimerPoll::Expired => {
                conn.on_timer(kind);
                state.after_conn_event(handle);
                drop(state);
                self.event.notify_waiters();
                None
            }
        }
    }

    fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        match Header::unmarshal(data) {
            Ok((header, offset)) => {
                metrics::PACKETS_RECEIVED.incr();
                self.state.lock().dispatch(&header, &data[offset..], from);
            }
            Err(e) => {
                metrics::MALFORMED_PACKETS.incr();
                tracing::debug!("Non-uTP datagram from {} ({} bytes): {}", from, data.len(), e);
                self.state.lock().push_unused_read(data, from);
            }
        }
        self.event.notify_waiters();
    }

    pub(crate) fn report_send_error(&self, handle: ConnHandle, err: &io::Error) {
        let callback = self
            .state
            .lock()
            .conns
            .get(&handle)
            .and_then(Conn::error_callback);
        if let Some(callback) = callback {
            callback(err);
        }
    }

    fn teardown(&self, reason: &str) {
        self.state.lock().destroy(reason);
        self.event.notify_waiters();
    }
}

/// Run of receive failures since the last successful read
struct ReadErrors {
    consecutive: u32,
    max: u32,
}

impl ReadErrors {
    fn new(max: u32) -> Self {
        Self { consecutive: 0, max }
    }

    fn success(&mut self) {
        self.consecutive = 0;
    }

    /// Count a failure. True once the socket should be torn down.
    fn failure(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= self.max
    }
}

async fn read_loop(shared: Arc<Shared>, udp: Arc<UdpSocket>, token: CancellationToken) {
    let mut buf = vec![0u8; MAX_RECV_SIZE];
    let mut errors = ReadErrors::new(shared.config.max_consecutive_read_errors);

    loop {
        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = udp.recv_from(&mut buf) => result,
        };
        match result {
            Ok((len, from)) => {
                errors.success();
                shared.handle_datagram(&buf[..len], from);
            }
            Err(e) => {
                let fatal = errors.failure();
                tracing::error!(
                    "uTP socket {} receive error ({} in a row): {}",
                    shared.local_addr,
                    errors.consecutive,
                    e
                );
                if fatal {
                    shared.teardown(&format!("receive failed: {}", e));
                    break;
                }
            }
        }
    }
}

async fn write_loop(
    shared: Weak<Shared>,
    udp: Arc<UdpSocket>,
    mut outbound: UnboundedReceiver<Datagram>,
    token: CancellationToken,
) {
    loop {
        let datagram = tokio::select! {
            biased;
            datagram = outbound.recv() => match datagram {
                Some(datagram) => datagram,
                None => return,
            },
            _ = token.cancelled() => break,
        };
        send_datagram(&shared, &udp, datagram).await;
    }

    // Flush what was queued before shutdown (FINs and resets)
    outbound.close();
    while let Ok(datagram) = outbound.try_recv() {
        send_datagram(&shared, &udp, datagram).await;
    }
}

async fn send_datagram(shared: &Weak<Shared>, udp: &UdpSocket, datagram: Datagram) {
    if let Err(e) = udp.send_to(&datagram.data, datagram.to).await {
        metrics::SEND_ERRORS.incr();
        tracing::warn!("Failed to send uTP datagram to {}: {}", datagram.to, e);
        if let (Some(handle), Some(shared)) = (datagram.conn, shared.upgrade()) {
            shared.report_send_error(handle, &e);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

/// uTP socket: dials, accepts and multiplexes streams over one UDP port
///
/// Dropping the socket closes it; the endpoint stays up until the last
/// stream finishes.
pub struct UtpSocket {
    shared: Arc<Shared>,
}

impl UtpSocket {
    /// Bind with the default configuration
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        Self::bind_with_config(addr, UtpConfig::default()).await
    }

    pub async fn bind_with_config(addr: SocketAddr, config: UtpConfig) -> Result<Self> {
        config.validate()?;
        let udp = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = udp.local_addr()?;
        let config = Arc::new(config);
        let token = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let runtime = Handle::current();

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| Shared {
            state: Mutex::new(SocketState::new(
                config.clone(),
                SocketRef::new(outbound_tx, weak.clone()),
                local_addr,
                token.clone(),
            )),
            event: Notify::new(),
            config,
            local_addr,
            runtime: runtime.clone(),
        });

        runtime.spawn(read_loop(shared.clone(), udp.clone(), token.clone()));
        runtime.spawn(write_loop(
            Arc::downgrade(&shared),
            udp,
            outbound_rx,
            token,
        ));

        tracing::debug!("uTP socket bound on {}", local_addr);
        Ok(Self { shared })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn config(&self) -> &UtpConfig {
        &self.shared.config
    }

    /// Connect, bounded by the configured connect timeout
    pub async fn dial(&self, addr: SocketAddr) -> Result<UtpStream> {
        let deadline = Instant::now() + self.shared.config.connect_timeout();
        self.connect(addr, CancellationToken::new(), Some(deadline)).await
    }

    /// Connect until the SYN is acked, the token fires or the SYN times out
    pub async fn dial_with_cancel(&self, addr: SocketAddr, cancel: CancellationToken) -> Result<UtpStream> {
        self.connect(addr, cancel, None).await
    }

    async fn connect(
        &self,
        addr: SocketAddr,
        cancel: CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<UtpStream> {
        let (stream, sent) = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(UtpError::SocketClosed);
            }
            let recv_id = state
                .new_conn_id(addr)
                .ok_or(UtpError::ConnIdsExhausted(addr))?;
            let handle = state.next_handle();
            let conn = Conn::new_outgoing(
                handle,
                state.socket_ref.clone(),
                state.config.clone(),
                state.local_addr,
                addr,
                recv_id,
            );
            // Registered before the SYN goes out so the reply finds it
            state.insert_conn(conn);
            let conn = state.conn_mut(handle)?;
            let stream = UtpStream::new(self.shared.clone(), conn);
            let sent = conn.send_syn();
            state.after_conn_event(handle);
            (stream, sent)
        };
        sent?;
        tracing::debug!("Dialing {} from {} (recv_id {})", addr, self.local_addr(), stream.recv_id());

        let outcome = tokio::select! {
            result = stream.wait_connected() => result,
            _ = cancel.cancelled() => Err(UtpError::Cancelled),
            _ = sleep_until(deadline) => Err(UtpError::ConnectTimeout),
        };
        match outcome {
            Ok(()) => Ok(stream),
            Err(err) => {
                stream.abort(err.clone());
                Err(err)
            }
        }
    }

    /// Wait for the next incoming connection
    pub async fn accept(&self) -> Result<UtpStream> {
        loop {
            let notified = {
                let mut state = self.shared.state.lock();
                if let Some(result) = state.try_accept() {
                    let stream = result.and_then(|handle| {
                        state
                            .conn_mut(handle)
                            .map(|conn| UtpStream::new(self.shared.clone(), conn))
                    });
                    return stream;
                }
                self.shared.event.notified()
            };
            notified.await;
        }
    }

    /// Receive a datagram that was not uTP
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        loop {
            let notified = {
                let mut state = self.shared.state.lock();
                if let Some(result) = state.try_recv_from(buf) {
                    return result;
                }
                self.shared.event.notified()
            };
            notified.await;
        }
    }

    /// Send a raw datagram through the socket's endpoint
    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize> {
        let state = self.shared.state.lock();
        if state.destroyed {
            return Err(UtpError::SocketDestroyed("closed".to_string()));
        }
        state.socket_ref.send(Datagram {
            to: addr,
            data: send_buffers().copy_from(buf),
            conn: None,
        })?;
        Ok(buf.len())
    }

    /// Stop accepting. Established streams keep running.
    pub fn close(&self) {
        self.shared.state.lock().close();
        self.shared.event.notify_waiters();
    }

    /// Destroy every connection and release the endpoint now
    pub fn shutdown_now(&self) {
        self.shared.teardown("shut down");
    }
}

impl fmt::Debug for UtpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UtpSocket")
            .field("local_addr", &self.shared.local_addr)
            .finish()
    }
}

impl Drop for UtpSocket {
    fn drop(&mut self) {
        self.close();
    }
}
