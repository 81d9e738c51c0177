// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// Socket layer: the arena of connections, the (port, 4-tuple)
// demultiplexer, the blocking-free socket API, and the periodic tick that
// drives timers, inbound dispatch and the output scheduler.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::frame_queue::QueuePair,
    protocols::tcp::{
        ctrlblk::ControlBlock,
        fsm::{
            self,
            Segment,
            SocketState,
            TcpState,
        },
        header::TcpHeader,
        isn_generator::IsnGenerator,
        sender::{
            self,
            RetransmitOutcome,
        },
        SeqNumber,
        INITIAL_WINDOW,
        KEEPALIVE_PERIOD_MS,
    },
    runtime::{
        config::TcpConfig,
        fail::Fail,
        memory::{
            Buffer,
            Frame,
        },
        timer::{
            SharedTimerWheel,
            TimerEvent,
        },
        SocketId,
    },
};
use ::libc::{
    EADDRINUSE,
    EBADF,
    EINVAL,
    EISCONN,
    ENOTCONN,
};
use ::slab::Slab;
use ::std::{
    collections::HashMap,
    net::{
        Ipv4Addr,
        Shutdown,
        SocketAddrV4,
    },
    time::{
        Duration,
        Instant,
    },
};

pub use crate::protocols::tcp::ctrlblk::SocketEvents;

//======================================================================================================================
// Constants
//======================================================================================================================

/// RFC 6335 private port range, used for ephemeral allocation.
const FIRST_EPHEMERAL_PORT: u16 = 49152;

/// Bounds of the shared raw frame queues.
const FRAME_QUEUE_FRAMES: u32 = 512;
const FRAME_QUEUE_BYTES: u32 = 1 << 20;

//======================================================================================================================
// Enumerations
//======================================================================================================================

/// Per-socket options settable through the socket API.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SocketOption {
    /// Disables Nagle coalescing when `true`.
    NoDelay(bool),
    /// Idle interval before keepalive probing starts; zero disables it.
    KeepAliveTime(Duration),
    /// Spacing between keepalive probes.
    KeepAliveInterval(Duration),
    /// Probes sent before the connection is declared dead.
    KeepAliveProbes(u32),
    /// FIN handshake watchdog interval.
    Linger(Duration),
}

/// Selector for [TcpPeer::get_option].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SocketOptionKind {
    NoDelay,
    KeepAliveTime,
    KeepAliveInterval,
    KeepAliveProbes,
    Linger,
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// All sockets bound on one local port, ordered so that connected entries
/// (specific remote) are matched before listening ones (wildcard remote).
#[derive(Default)]
struct PortEntry {
    socks: Vec<SocketId>,
}

impl PortEntry {
    fn insert(&mut self, id: SocketId, connected: bool) {
        if connected {
            self.socks.insert(0, id);
        } else {
            self.socks.push(id);
        }
    }

    fn remove(&mut self, id: SocketId) {
        self.socks.retain(|&other| other != id);
    }

    fn is_empty(&self) -> bool {
        self.socks.is_empty()
    }
}

/// The TCP stack: socket arena, port table, timer wheel, and the injected
/// frame queue pair shared with the network layer.
///
/// Everything here runs on the tick thread; only the frame queues may be
/// touched from another execution context.
pub struct TcpPeer {
    config: TcpConfig,
    local_addr: Ipv4Addr,
    pub(crate) sockets: Slab<ControlBlock>,
    ports: HashMap<u16, PortEntry>,
    pub(crate) timers: SharedTimerWheel,
    queues: QueuePair,
    isn_generator: IsnGenerator,
    epoch: Instant,
    now: Instant,
    /// Tombstoned slots awaiting reclamation at end of tick.
    reap: Vec<SocketId>,
    /// Events of already-reclaimed sockets, still owed to the application.
    dead_events: Vec<(SocketId, SocketEvents)>,
    next_ephemeral: u16,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl TcpPeer {
    /// Creates a stack bound to `local_addr`, exchanging frames through the
    /// injected queue pair.
    pub fn new(local_addr: Ipv4Addr, config: TcpConfig, queues: QueuePair, rng_seed: u64, now: Instant) -> Self {
        Self {
            config,
            local_addr,
            sockets: Slab::new(),
            ports: HashMap::new(),
            timers: SharedTimerWheel::new(),
            queues,
            isn_generator: IsnGenerator::new(rng_seed),
            epoch: now,
            now,
            reap: Vec::new(),
            dead_events: Vec::new(),
            next_ephemeral: FIRST_EPHEMERAL_PORT,
        }
    }

    /// Builds a queue pair sized for this stack.
    pub fn default_queues() -> QueuePair {
        QueuePair::new(FRAME_QUEUE_FRAMES, FRAME_QUEUE_BYTES, 0)
    }

    //==================================================================================================================
    // Socket API
    //==================================================================================================================

    /// Opens a new socket.
    pub fn open(&mut self) -> Result<SocketId, Fail> {
        let cb: ControlBlock = ControlBlock::new(
            &self.config,
            self.queues.outgoing.clone(),
            self.timers.clone(),
            self.epoch,
            self.now,
        );
        Ok(self.insert_socket(cb))
    }

    /// Claims a local (address, port) pair for the socket.
    pub fn bind(&mut self, id: SocketId, mut addr: SocketAddrV4) -> Result<(), Fail> {
        {
            let cb: &ControlBlock = self.cb(id)?;
            if cb.sock_state != SocketState::Unbound {
                return Err(Fail::new(EINVAL, "socket is already bound"));
            }
        }
        if addr.port() == 0 {
            addr.set_port(self.alloc_ephemeral_port()?);
        }

        // Reject a bind that would make delivery ambiguous: same port with
        // an equal address, or a wildcard on either side.
        if let Some(entry) = self.ports.get(&addr.port()) {
            for &other_id in &entry.socks {
                let other: &ControlBlock = match self.sockets.get(usize::from(other_id)) {
                    Some(other) if !other.defunct => other,
                    _ => continue,
                };
                let other_ip: &Ipv4Addr = other.local.ip();
                if *other_ip == Ipv4Addr::UNSPECIFIED || *addr.ip() == Ipv4Addr::UNSPECIFIED || other_ip == addr.ip() {
                    return Err(Fail::new(EADDRINUSE, "address already in use"));
                }
            }
        }

        let cb: &mut ControlBlock = self.cb_mut(id)?;
        cb.local = addr;
        cb.sock_state = SocketState::Bound;
        self.ports.entry(addr.port()).or_default().insert(id, false);
        Ok(())
    }

    /// Flips a bound socket to LISTEN with the given accept backlog.
    pub fn listen(&mut self, id: SocketId, backlog: u32) -> Result<(), Fail> {
        let cb: &mut ControlBlock = self.cb_mut(id)?;
        match (cb.sock_state, cb.state) {
            (SocketState::Bound, TcpState::Closed) => {
                cb.state = TcpState::Listen;
                cb.backlog = backlog.max(1);
                Ok(())
            },
            (SocketState::Unbound, _) => Err(Fail::new(EINVAL, "socket is not bound")),
            _ => Err(Fail::new(EISCONN, "socket is already in use")),
        }
    }

    /// Starts an active open towards `remote`.
    pub fn connect(&mut self, id: SocketId, remote: SocketAddrV4) -> Result<(), Fail> {
        let now: Instant = self.now;
        {
            let cb: &ControlBlock = self.cb(id)?;
            match cb.state {
                TcpState::Closed => (),
                TcpState::SynSent | TcpState::SynRecv => return Err(Fail::new(EINVAL, "connect already in progress")),
                _ => return Err(Fail::new(EISCONN, "socket is already connected")),
            }
        }
        if self.cb(id)?.sock_state == SocketState::Unbound {
            let local_addr: Ipv4Addr = self.local_addr;
            let port: u16 = self.alloc_ephemeral_port()?;
            self.bind(id, SocketAddrV4::new(local_addr, port))?;
        }

        let local_addr: Ipv4Addr = self.local_addr;
        let iss: SeqNumber = {
            let local: SocketAddrV4 = self.cb(id)?.local;
            self.isn_generator.generate(&local, &remote)
        };
        let ssthresh: u32 = self.initial_ssthresh();

        let cb: &mut ControlBlock = self.cb_mut(id)?;
        if *cb.local.ip() == Ipv4Addr::UNSPECIFIED {
            cb.local.set_ip(local_addr);
        }
        cb.remote = remote;
        cb.snd_nxt = iss;
        cb.snd_last = iss;
        cb.snd_last_out = iss;
        cb.cwnd = INITIAL_WINDOW;
        cb.ssthresh = ssthresh;
        cb.state = TcpState::SynSent;
        cb.sock_state = SocketState::Connected;
        cb.send_syn(now);
        let retry_at: Instant = now + self.config.get_handshake_timeout();
        let cb: &mut ControlBlock = self.cb_mut(id)?;
        cb.retrans_timer = Some(cb.timers.set(retry_at, TimerEvent::ConnectRetry(id)));

        // Move the now-connected socket to the front of its port entry.
        if let Some(entry) = self.ports.get_mut(&self.sockets[usize::from(id)].local.port()) {
            entry.remove(id);
            entry.insert(id, true);
        }
        Ok(())
    }

    /// Detaches and returns an established connection spawned by this
    /// listener, if one is ready.
    pub fn accept(&mut self, id: SocketId) -> Result<SocketId, Fail> {
        let (port, backlog_state): (u16, TcpState) = {
            let cb: &ControlBlock = self.cb(id)?;
            (cb.local.port(), cb.state)
        };
        if backlog_state != TcpState::Listen {
            return Err(Fail::new(EINVAL, "socket is not listening"));
        }

        let mut ready: Option<SocketId> = None;
        if let Some(entry) = self.ports.get(&port) {
            for &child_id in &entry.socks {
                if let Some(child) = self.sockets.get(usize::from(child_id)) {
                    if !child.defunct && child.parent == Some(id) && child.state == TcpState::Established {
                        ready = Some(child_id);
                        break;
                    }
                }
            }
        }

        match ready {
            Some(child_id) => {
                self.sockets[usize::from(child_id)].parent = None;
                let listener: &mut ControlBlock = &mut self.sockets[usize::from(id)];
                listener.pending_conn = listener.pending_conn.saturating_sub(1);
                Ok(child_id)
            },
            None => Err(Fail::would_block()),
        }
    }

    /// Queues application data for transmission. Non-blocking: returns the
    /// bytes accepted, or fails when the send stores are full.
    pub fn send(&mut self, id: SocketId, data: &[u8]) -> Result<usize, Fail> {
        let now: Instant = self.now;
        self.cb_mut(id)?.push(data, now)
    }

    /// Copies received in-order data into `buf`. Non-blocking: fails with
    /// the would-block errno when nothing is ready; returns zero only after
    /// the peer closed its side.
    pub fn recv(&mut self, id: SocketId, buf: &mut [u8]) -> Result<usize, Fail> {
        let now: Instant = self.now;
        let cb: &mut ControlBlock = self.cb_mut(id)?;
        let read: usize = cb.read(buf)?;
        // Consuming data re-opens our advertised window; tell the peer when
        // it matters.
        if cb.set_space() {
            cb.send_window_update(now);
        }
        Ok(read)
    }

    /// Shuts down one or both directions of the connection.
    pub fn shutdown(&mut self, id: SocketId, how: Shutdown) -> Result<(), Fail> {
        let now: Instant = self.now;
        let cb: &mut ControlBlock = self.cb_mut(id)?;
        if !matches!(cb.state, TcpState::Established | TcpState::CloseWait) {
            return Err(Fail::new(ENOTCONN, "socket is not connected"));
        }
        match how {
            Shutdown::Read => cb.shut_remote = true,
            Shutdown::Write => cb.shut_local = true,
            Shutdown::Both => {
                cb.shut_remote = true;
                cb.shut_local = true;
            },
        }
        if cb.shut_local && cb.outq.is_empty() && cb.holdq.is_empty() {
            cb.check_closing(now);
        }
        Ok(())
    }

    /// Closes the socket. Connected sockets run the FIN handshake; anything
    /// else is released immediately.
    pub fn close(&mut self, id: SocketId) -> Result<(), Fail> {
        let now: Instant = self.now;
        let state: TcpState = self.cb(id)?.state;
        match state {
            TcpState::Closed | TcpState::Listen | TcpState::SynSent => {
                self.teardown(id, SocketEvents::none());
                Ok(())
            },
            TcpState::SynRecv => {
                self.send_rst_and_teardown(id, now);
                Ok(())
            },
            TcpState::Established | TcpState::CloseWait => {
                let cb: &mut ControlBlock = self.cb_mut(id)?;
                cb.shut_local = true;
                cb.shut_remote = true;
                if cb.outq.is_empty() && cb.holdq.is_empty() {
                    cb.check_closing(now);
                }
                Ok(())
            },
            // Already closing; the handshake or its watchdog finishes the job.
            _ => Ok(()),
        }
    }

    /// Sets a per-socket option.
    pub fn set_option(&mut self, id: SocketId, option: SocketOption) -> Result<(), Fail> {
        let cb: &mut ControlBlock = self.cb_mut(id)?;
        match option {
            SocketOption::NoDelay(no_delay) => cb.nagle = !no_delay,
            SocketOption::KeepAliveTime(time) => cb.ka_time = time,
            SocketOption::KeepAliveInterval(interval) => {
                if interval.is_zero() {
                    return Err(Fail::new(EINVAL, "keepalive interval must be nonzero"));
                }
                cb.ka_intvl = interval;
            },
            SocketOption::KeepAliveProbes(probes) => cb.ka_probes = probes,
            SocketOption::Linger(timeout) => cb.linger_timeout = timeout,
        }
        Ok(())
    }

    /// Reads back a per-socket option.
    pub fn get_option(&self, id: SocketId, kind: SocketOptionKind) -> Result<SocketOption, Fail> {
        let cb: &ControlBlock = self.cb(id)?;
        let option: SocketOption = match kind {
            SocketOptionKind::NoDelay => SocketOption::NoDelay(!cb.nagle),
            SocketOptionKind::KeepAliveTime => SocketOption::KeepAliveTime(cb.ka_time),
            SocketOptionKind::KeepAliveInterval => SocketOption::KeepAliveInterval(cb.ka_intvl),
            SocketOptionKind::KeepAliveProbes => SocketOption::KeepAliveProbes(cb.ka_probes),
            SocketOptionKind::Linger => SocketOption::Linger(cb.linger_timeout),
        };
        Ok(option)
    }

    //==================================================================================================================
    // Tick Loop
    //==================================================================================================================

    /// The periodic tick: fires due timers, delivers inbound frames, runs
    /// the output scheduler, and reclaims tombstoned sockets. Everything the
    /// stack does happens inside this call or inside the socket API.
    pub fn poll(&mut self, now: Instant) {
        self.now = now;

        while let Some(event) = self.timers.pop_expired(now) {
            self.handle_timer(event, now);
        }

        while let Some(frame) = self.queues.incoming.dequeue() {
            self.deliver(frame, now);
        }

        let ids: Vec<usize> = self
            .sockets
            .iter()
            .filter(|(_, cb)| {
                !cb.defunct
                    && matches!(
                        cb.state,
                        TcpState::Established | TcpState::CloseWait | TcpState::FinWait1 | TcpState::LastAck
                    )
            })
            .map(|(key, _)| key)
            .collect();
        for key in ids {
            if let Some(cb) = self.sockets.get_mut(key) {
                if !cb.defunct {
                    cb.transmit_pending(now);
                }
            }
        }

        self.reap_defunct();
    }

    /// Drains the coalesced per-socket event masks accumulated since the
    /// last call. Each socket appears at most once per tick.
    pub fn poll_events(&mut self) -> Vec<(SocketId, SocketEvents)> {
        let mut events: Vec<(SocketId, SocketEvents)> = std::mem::take(&mut self.dead_events);
        for (key, cb) in self.sockets.iter_mut() {
            if !cb.ev_pending.is_empty() {
                events.push((SocketId::from(key), cb.ev_pending.take()));
            }
        }
        events
    }

    //==================================================================================================================
    // Inbound Delivery
    //==================================================================================================================

    /// Parses one inbound frame and routes it: port entry lookup, then the
    /// most specific 4-tuple match, preferring a connected socket over a
    /// listening one.
    fn deliver(&mut self, frame: Frame, now: Instant) {
        let src_addr: Ipv4Addr = frame.src_addr;
        let dst_addr: Ipv4Addr = frame.dst_addr;
        let (header, payload): (TcpHeader, Buffer) = match TcpHeader::parse(&src_addr, &dst_addr, frame.body) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("deliver(): dropping malformed segment ({:?})", e);
                return;
            },
        };
        let segment: Segment = Segment {
            header,
            payload,
            src_addr,
            dst_addr,
        };

        let mut listener: Option<SocketId> = None;
        let mut connected: Option<SocketId> = None;
        if let Some(entry) = self.ports.get(&segment.header.dst_port) {
            for &sid in &entry.socks {
                let cb: &ControlBlock = match self.sockets.get(usize::from(sid)) {
                    Some(cb) if !cb.defunct => cb,
                    _ => continue,
                };
                let local_ip: &Ipv4Addr = cb.local.ip();
                let local_matches: bool = *local_ip == Ipv4Addr::UNSPECIFIED || *local_ip == dst_addr;
                if cb.remote.port() == segment.header.src_port && *cb.remote.ip() == src_addr && local_matches {
                    connected = Some(sid);
                    break;
                }
                if cb.remote.port() == 0 && cb.state == TcpState::Listen && local_matches && listener.is_none() {
                    listener = Some(sid);
                }
            }
        }

        match connected.or(listener) {
            Some(sid) => fsm::dispatch(self, sid, segment, now),
            None => {
                debug!("deliver(): no socket for port {}, resetting", segment.header.dst_port);
                self.reply_rst_for(&segment, now);
            },
        }
    }

    /// Spawns a half-open connection for a SYN arriving on a listener.
    pub(crate) fn handle_listen_syn(&mut self, listener_id: SocketId, segment: &Segment, now: Instant) {
        let (backlog, pending, nagle): (u32, u32, bool) = {
            let listener: &ControlBlock = &self.sockets[usize::from(listener_id)];
            (listener.backlog, listener.pending_conn, listener.nagle)
        };
        if pending >= backlog {
            debug!("handle_listen_syn(): backlog full, dropping SYN");
            return;
        }

        let child_local: SocketAddrV4 = SocketAddrV4::new(segment.dst_addr, segment.header.dst_port);
        let child_remote: SocketAddrV4 = SocketAddrV4::new(segment.src_addr, segment.header.src_port);
        let iss: SeqNumber = self.isn_generator.generate(&child_local, &child_remote);
        let ssthresh: u32 = self.initial_ssthresh();

        let mut cb: ControlBlock = ControlBlock::new(
            &self.config,
            self.queues.outgoing.clone(),
            self.timers.clone(),
            self.epoch,
            now,
        );
        cb.local = child_local;
        cb.remote = child_remote;
        cb.sock_state = SocketState::Connected;
        cb.state = TcpState::SynRecv;
        cb.parent = Some(listener_id);
        cb.nagle = nagle;
        cb.rcv_nxt = segment.header.seq_num + SeqNumber::from(1);
        cb.snd_nxt = iss;
        cb.snd_last = iss;
        cb.snd_last_out = iss;
        cb.cwnd = INITIAL_WINDOW;
        cb.ssthresh = ssthresh;
        cb.recv_wnd = segment.header.window_size;
        cb.apply_options(&segment.header, true);

        let child_id: SocketId = self.insert_socket(cb);
        self.ports
            .entry(child_local.port())
            .or_default()
            .insert(child_id, true);
        self.sockets[usize::from(listener_id)].pending_conn += 1;
        self.sockets[usize::from(child_id)].send_synack(now);
        debug!(
            "handle_listen_syn(): half-open {} -> {} as socket {}",
            child_remote, child_local, child_id
        );
    }

    /// Marks a connection fully established and starts its keepalive clock.
    pub(crate) fn enter_established(&mut self, id: SocketId, now: Instant) {
        let cb: &mut ControlBlock = &mut self.sockets[usize::from(id)];
        cb.state = TcpState::Established;
        cb.sock_state = SocketState::Connected;
        cb.ack_timestamp = now;
        let at: Instant = now + Duration::from_millis(KEEPALIVE_PERIOD_MS);
        cb.ka_timer = Some(cb.timers.set(at, TimerEvent::Keepalive(id)));
    }

    /// Sends a reset reply for a segment that matched no usable connection
    /// state.
    pub(crate) fn reply_rst_for(&mut self, segment: &Segment, now: Instant) {
        sender::reply_rst(
            &segment.header,
            segment.payload.len(),
            segment.dst_addr,
            segment.src_addr,
            &self.queues.outgoing,
            now,
        );
    }

    /// Resets the peer and releases the connection.
    pub(crate) fn send_rst_and_teardown(&mut self, id: SocketId, now: Instant) {
        let cb: &mut ControlBlock = &mut self.sockets[usize::from(id)];
        let seq: SeqNumber = cb.snd_nxt;
        cb.send_rst_seq(seq, now);
        cb.state = TcpState::Closed;
        self.teardown(id, SocketEvents::CLOSED);
    }

    /// Handles a validated inbound reset: an established connection flips to
    /// CLOSED and waits for the application to release it; anything
    /// mid-handshake is torn down at once with an error.
    pub(crate) fn force_closed(&mut self, id: SocketId, _now: Instant) {
        let established: bool = {
            let cb: &ControlBlock = &self.sockets[usize::from(id)];
            cb.state == TcpState::Established
        };
        let cb: &mut ControlBlock = &mut self.sockets[usize::from(id)];
        cb.state = TcpState::Closed;
        cb.sock_state = SocketState::Closed;
        if established {
            info!("force_closed(): connection reset by peer");
            cb.cancel_timers();
            cb.ev_pending |= SocketEvents::CLOSED;
            self.unlink_port(id);
        } else {
            self.teardown(id, SocketEvents::ERROR);
        }
    }

    /// Two-phase delete: the socket leaves the port table and all timers at
    /// once (no further frame or timer can reach it), while the arena slot
    /// survives as a tombstone until the end of the tick.
    pub(crate) fn teardown(&mut self, id: SocketId, events: SocketEvents) {
        let parent: Option<SocketId> = {
            let cb: &mut ControlBlock = match self.sockets.get_mut(usize::from(id)) {
                Some(cb) if !cb.defunct => cb,
                _ => return,
            };
            cb.cancel_timers();
            cb.defunct = true;
            cb.state = TcpState::Closed;
            cb.sock_state = SocketState::Closed;
            let owed: SocketEvents = cb.ev_pending.take() | events;
            if !owed.is_empty() {
                self.dead_events.push((id, owed));
            }
            self.sockets[usize::from(id)].parent
        };
        self.unlink_port(id);
        if let Some(parent_id) = parent {
            if let Some(parent_cb) = self.sockets.get_mut(usize::from(parent_id)) {
                parent_cb.pending_conn = parent_cb.pending_conn.saturating_sub(1);
            }
        }
        // Orphan any half-open children, so a reused arena slot can never be
        // mistaken for their listener.
        for (_, cb) in self.sockets.iter_mut() {
            if cb.parent == Some(id) {
                cb.parent = None;
            }
        }
        self.reap.push(id);
    }

    //==================================================================================================================
    // Timers
    //==================================================================================================================

    fn handle_timer(&mut self, event: TimerEvent, now: Instant) {
        match event {
            TimerEvent::Retransmit(id) => {
                let Some(cb) = self.live_mut(id) else { return };
                cb.retrans_timer = None;
                let Some(due) = cb.retrans_due else { return };
                if due > now {
                    // The deadline was postponed by an ACK that arrived
                    // after scheduling; re-arm instead of acting.
                    cb.arm_retransmit(Some(due), now);
                    return;
                }
                cb.retrans_due = None;
                if cb.retransmit_timeout(now) == RetransmitOutcome::Abandon {
                    self.teardown(id, SocketEvents::CLOSED);
                }
            },
            TimerEvent::Keepalive(id) => self.keepalive_tick(id, now),
            TimerEvent::ConnectRetry(id) => {
                let retries: usize = self.config.get_handshake_retries();
                let timeout: Duration = self.config.get_handshake_timeout();
                let Some(cb) = self.live_mut(id) else { return };
                if cb.state != TcpState::SynSent {
                    return;
                }
                cb.retrans_timer = None;
                if cb.backoff as usize > retries {
                    info!("handle_timer(): connect timed out");
                    self.teardown(id, SocketEvents::ERROR);
                    return;
                }
                cb.backoff += 1;
                debug!("handle_timer(): SYN retry {}", cb.backoff);
                cb.send_syn(now);
                let at: Instant = now + timeout * (1u32 << cb.backoff.min(16));
                let cb: &mut ControlBlock = &mut self.sockets[usize::from(id)];
                cb.retrans_timer = Some(cb.timers.set(at, TimerEvent::ConnectRetry(id)));
            },
            TimerEvent::FinLinger(id) => {
                let Some(cb) = self.live_mut(id) else { return };
                cb.linger_timer = None;
                let stalled: bool = !matches!(cb.state, TcpState::TimeWait | TcpState::Closing);
                if stalled {
                    // The close handshake stalled; give up loudly.
                    let seq: SeqNumber = cb.snd_nxt;
                    cb.send_rst_seq(seq, now);
                }
                cb.state = TcpState::Closed;
                // A clean TIME-WAIT expiry was already reported when the
                // handshake finished; only a stalled close is news.
                let events: SocketEvents = if stalled {
                    SocketEvents::CLOSED
                } else {
                    SocketEvents::none()
                };
                self.teardown(id, events);
            },
        }
    }

    /// Periodic keepalive inspection: probe an idle established connection,
    /// and flag an error once the probe budget is spent.
    fn keepalive_tick(&mut self, id: SocketId, now: Instant) {
        let Some(cb) = self.live_mut(id) else { return };
        if cb.state == TcpState::Established && !cb.ka_time.is_zero() {
            let idle: Duration = now.duration_since(cb.ack_timestamp);
            if idle > cb.ka_time {
                if cb.ka_retries == 0 {
                    cb.send_probe(now);
                    cb.ka_retries = 1;
                } else if cb.ka_retries > cb.ka_probes {
                    warn!("keepalive_tick(): peer unresponsive, flagging error");
                    cb.ev_pending |= SocketEvents::ERROR;
                    cb.ka_time = Duration::ZERO;
                } else if cb.ka_time + cb.ka_intvl * cb.ka_retries < idle {
                    cb.send_probe(now);
                    cb.ka_retries += 1;
                }
            } else {
                cb.ka_retries = 0;
            }
        }
        let cb: &mut ControlBlock = &mut self.sockets[usize::from(id)];
        if !cb.defunct && cb.state != TcpState::Closed {
            let at: Instant = now + Duration::from_millis(KEEPALIVE_PERIOD_MS);
            cb.ka_timer = Some(cb.timers.set(at, TimerEvent::Keepalive(id)));
        }
    }

    //==================================================================================================================
    // Internals
    //==================================================================================================================

    fn cb(&self, id: SocketId) -> Result<&ControlBlock, Fail> {
        match self.sockets.get(usize::from(id)) {
            Some(cb) if !cb.defunct => Ok(cb),
            _ => Err(Fail::new(EBADF, "no such socket")),
        }
    }

    fn cb_mut(&mut self, id: SocketId) -> Result<&mut ControlBlock, Fail> {
        match self.sockets.get_mut(usize::from(id)) {
            Some(cb) if !cb.defunct => Ok(cb),
            _ => Err(Fail::new(EBADF, "no such socket")),
        }
    }

    fn live_mut(&mut self, id: SocketId) -> Option<&mut ControlBlock> {
        match self.sockets.get_mut(usize::from(id)) {
            Some(cb) if !cb.defunct => Some(cb),
            _ => None,
        }
    }

    fn insert_socket(&mut self, cb: ControlBlock) -> SocketId {
        let entry = self.sockets.vacant_entry();
        let id: SocketId = SocketId::from(entry.key());
        let slot: &mut ControlBlock = entry.insert(cb);
        slot.id = id;
        id
    }

    fn unlink_port(&mut self, id: SocketId) {
        let port: u16 = match self.sockets.get(usize::from(id)) {
            Some(cb) => cb.local.port(),
            None => return,
        };
        if let Some(entry) = self.ports.get_mut(&port) {
            entry.remove(id);
            if entry.is_empty() {
                self.ports.remove(&port);
            }
        }
    }

    fn reap_defunct(&mut self) {
        for id in std::mem::take(&mut self.reap) {
            if self.sockets.contains(usize::from(id)) {
                self.sockets.remove(usize::from(id));
            }
        }
    }

    fn alloc_ephemeral_port(&mut self) -> Result<u16, Fail> {
        let span: u32 = (u16::MAX - FIRST_EPHEMERAL_PORT) as u32 + 1;
        for _ in 0..span {
            let candidate: u16 = self.next_ephemeral;
            self.next_ephemeral = if self.next_ephemeral == u16::MAX {
                FIRST_EPHEMERAL_PORT
            } else {
                self.next_ephemeral + 1
            };
            if !self.ports.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(Fail::new(EADDRINUSE, "ephemeral port range exhausted"))
    }

    /// Initial slow-start threshold, in segments, derived from the send
    /// store budget.
    fn initial_ssthresh(&self) -> u32 {
        let segments: u32 = self.config.get_send_queue_size() / self.config.get_advertised_mss() as u32;
        (segments - (segments >> 3)).max(2)
    }

    /// Not part of the supported surface; used by tests to look inside a
    /// connection.
    #[cfg(test)]
    pub(crate) fn inspect(&self, id: SocketId) -> Result<&ControlBlock, Fail> {
        match self.sockets.get(usize::from(id)) {
            Some(cb) => Ok(cb),
            None => Err(Fail::new(EBADF, "no such socket")),
        }
    }
}
