// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::{
        frame_queue::SharedFrameQueue,
        segment_store::{
            SegmentStore,
            StoredSegment,
        },
    },
    protocols::tcp::{
        fsm::{
            SocketState,
            TcpState,
        },
        header::{
            SackRange,
            TcpHeader,
            TcpOption,
        },
        rto::RtoEstimator,
        sender::OutboundSegment,
        SeqNumber,
        INITIAL_WINDOW,
        MAX_SACK_BLOCKS,
    },
    runtime::{
        config::TcpConfig,
        fail::Fail,
        memory::Buffer,
        timer::{
            SharedTimerWheel,
            TimerHandle,
        },
        SocketId,
    },
};
use ::arrayvec::ArrayVec;
use ::std::{
    net::{
        Ipv4Addr,
        SocketAddrV4,
    },
    ops::{
        BitOr,
        BitOrAssign,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Byte accounting overhead per reassembly record, covering the bookkeeping
/// the input store spends beside the payload itself.
const INPUT_SEGMENT_OVERHEAD: u32 = 32;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Pending application notifications, coalesced and delivered once per tick.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SocketEvents(u8);

impl SocketEvents {
    pub const READABLE: SocketEvents = SocketEvents(1);
    pub const WRITABLE: SocketEvents = SocketEvents(1 << 1);
    pub const CONNECTED: SocketEvents = SocketEvents(1 << 2);
    pub const CLOSED: SocketEvents = SocketEvents(1 << 3);
    pub const PEER_FIN: SocketEvents = SocketEvents(1 << 4);
    pub const ERROR: SocketEvents = SocketEvents(1 << 5);

    pub fn none() -> Self {
        SocketEvents(0)
    }

    pub fn contains(&self, other: SocketEvents) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Clears and returns the pending set.
    pub fn take(&mut self) -> SocketEvents {
        let taken: SocketEvents = *self;
        self.0 = 0;
        taken
    }
}

impl BitOr for SocketEvents {
    type Output = SocketEvents;

    fn bitor(self, other: SocketEvents) -> SocketEvents {
        SocketEvents(self.0 | other.0)
    }
}

impl BitOrAssign for SocketEvents {
    fn bitor_assign(&mut self, other: SocketEvents) {
        self.0 |= other.0;
    }
}

/// Minimal reassembly record: just the sequence span and the bytes, not the
/// full frame. Inbound frames are discarded once their payload is copied
/// here.
#[derive(Debug)]
pub struct InputSegment {
    pub seq: SeqNumber,
    pub payload: Buffer,
}

impl StoredSegment for InputSegment {
    fn seq(&self) -> SeqNumber {
        self.seq
    }

    fn len(&self) -> u32 {
        self.payload.len() as u32
    }
}

/// Transmission control block: the full per-connection state.
///
/// Owned exclusively by the peer's socket arena and mutated only on the tick
/// thread, by the state-machine handlers and the output scheduler.
pub struct ControlBlock {
    /// Own slot in the socket arena.
    pub id: SocketId,
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
    pub sock_state: SocketState,
    pub state: TcpState,
    /// Listening socket this connection was cloned from, until accepted.
    pub parent: Option<SocketId>,

    // Segment stores.
    /// Reassembled inbound payload, keyed by sequence number.
    pub inq: SegmentStore<InputSegment>,
    /// Outbound segments awaiting acknowledgment.
    pub outq: SegmentStore<OutboundSegment>,
    /// Small writes held back for Nagle coalescing.
    pub holdq: SegmentStore<OutboundSegment>,

    // Send sequence space.
    pub snd_nxt: SeqNumber,
    /// Sequence number of the last byte handed to the output store.
    pub snd_last: SeqNumber,
    pub snd_old_ack: SeqNumber,
    /// Recovery retransmission cursor.
    pub snd_retry: SeqNumber,
    /// Highest sequence number ever handed to the wire.
    pub snd_last_out: SeqNumber,

    // Congestion control and retransmission. Window quantities are counted
    // in segments.
    pub in_flight: u32,
    pub cwnd: u32,
    pub cwnd_counter: u32,
    pub ssthresh: u32,
    pub mode: TransmitMode,
    pub backoff: u32,
    pub rto: RtoEstimator,
    /// Deadline the armed retransmission timer is accountable for. A fired
    /// timer that finds this in the future was postponed and re-arms.
    pub retrans_due: Option<Instant>,
    pub retrans_timer: Option<TimerHandle>,

    // Peer-advertised window.
    pub recv_wnd: u16,
    pub recv_wnd_scale: u8,

    // Receive sequence space.
    /// Next byte we expect from the peer.
    pub rcv_nxt: SeqNumber,
    /// Last byte we have acknowledged to the peer.
    pub rcv_ackd: SeqNumber,
    /// Last byte delivered to the application.
    pub rcv_processed: SeqNumber,

    // Our advertised window, stored pre-scaled.
    pub wnd: u16,
    pub wnd_scale: u8,
    pub local_zero_window: bool,

    // Negotiated options. The `*_enabled` flags are what we offer; the
    // `*_ok` flags are what the handshake actually negotiated.
    pub mss: u16,
    pub sack_enabled: bool,
    pub sack_ok: bool,
    pub ts_enabled: bool,
    pub ts_ok: bool,
    pub mss_ok: bool,
    /// Peer timestamp to echo back.
    pub ts_nxt: u32,
    /// SACK ranges pending advertisement, consumed on the next ACK.
    pub sacks: ArrayVec<SackRange, MAX_SACK_BLOCKS>,

    // Keepalive.
    /// Idle interval before probing starts; zero disables keepalive.
    pub ka_time: Duration,
    pub ka_intvl: Duration,
    pub ka_probes: u32,
    pub ka_retries: u32,
    pub ka_timer: Option<TimerHandle>,
    /// Last time the peer acknowledged anything.
    pub ack_timestamp: Instant,

    // FIN handshake watchdog.
    pub linger_timeout: Duration,
    pub linger_timer: Option<TimerHandle>,

    // Socket-level state.
    pub nagle: bool,
    pub shut_local: bool,
    pub shut_remote: bool,
    /// A FIN arrived ahead of missing data and is waiting to be consumed.
    pub remote_fin_pending: bool,
    pub backlog: u32,
    pub pending_conn: u32,
    pub ev_pending: SocketEvents,
    /// Tombstone: the arena slot is dead and is reclaimed at end of tick.
    pub defunct: bool,

    // Plumbing shared with the peer.
    pub outgoing: SharedFrameQueue,
    pub timers: SharedTimerWheel,
    /// Zero point of the millisecond clock used by the timestamp option.
    pub epoch: Instant,
}

/// Transmission mode of the send side, stepped by duplicate ACKs and
/// timeouts.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum TransmitMode {
    Lookahead,
    FirstDupAck,
    SecondDupAck,
    Recover,
    Blackout,
    Unreachable,
    WindowFull,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl ControlBlock {
    /// Creates a closed control block bound to nothing.
    pub fn new(
        config: &TcpConfig,
        outgoing: SharedFrameQueue,
        timers: SharedTimerWheel,
        epoch: Instant,
        now: Instant,
    ) -> Self {
        let mss: u16 = config.get_advertised_mss() as u16;
        let mut cb: ControlBlock = Self {
            id: SocketId::from(0),
            local: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            remote: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            sock_state: SocketState::Unbound,
            state: TcpState::Closed,
            parent: None,
            inq: SegmentStore::new(config.get_receive_queue_size(), INPUT_SEGMENT_OVERHEAD),
            outq: SegmentStore::new(config.get_send_queue_size(), 0),
            holdq: SegmentStore::new(2 * mss as u32, 0),
            snd_nxt: SeqNumber::from(0),
            snd_last: SeqNumber::from(0),
            snd_old_ack: SeqNumber::from(0),
            snd_retry: SeqNumber::from(0),
            snd_last_out: SeqNumber::from(0),
            in_flight: 0,
            cwnd: INITIAL_WINDOW,
            cwnd_counter: 0,
            ssthresh: u32::MAX >> 1,
            mode: TransmitMode::Lookahead,
            backoff: 0,
            rto: RtoEstimator::new(),
            retrans_due: None,
            retrans_timer: None,
            recv_wnd: 0,
            recv_wnd_scale: 0,
            rcv_nxt: SeqNumber::from(0),
            rcv_ackd: SeqNumber::from(0),
            rcv_processed: SeqNumber::from(0),
            wnd: 0,
            wnd_scale: config.get_window_scale(),
            local_zero_window: false,
            mss,
            sack_enabled: config.get_sack_enabled(),
            sack_ok: false,
            ts_enabled: config.get_timestamps_enabled(),
            ts_ok: false,
            mss_ok: false,
            ts_nxt: 0,
            sacks: ArrayVec::new(),
            ka_time: Duration::ZERO,
            ka_intvl: Duration::from_secs(75),
            ka_probes: 9,
            ka_retries: 0,
            ka_timer: None,
            ack_timestamp: now,
            linger_timeout: config.get_linger_timeout(),
            linger_timer: None,
            nagle: config.get_nagle_enabled(),
            shut_local: false,
            shut_remote: false,
            remote_fin_pending: false,
            backlog: 0,
            pending_conn: 0,
            ev_pending: SocketEvents::none(),
            defunct: false,
            outgoing,
            timers,
            epoch,
        };
        cb.set_space();
        cb
    }

    /// Milliseconds since the stack epoch, as carried by the timestamp
    /// option.
    pub fn now_ms(&self, now: Instant) -> u32 {
        now.duration_since(self.epoch).as_millis() as u32
    }

    /// Our advertised receive window, in bytes.
    pub fn advertised_window_bytes(&self) -> u32 {
        (self.wnd as u32) << self.wnd_scale
    }

    /// The peer's advertised receive window, in bytes.
    pub fn peer_window_bytes(&self) -> u32 {
        (self.recv_wnd as u32) << self.recv_wnd_scale
    }

    /// `true` while nothing is in flight and the output store is drained.
    pub fn is_idle(&self) -> bool {
        self.in_flight == 0 && self.outq.size() == 0
    }

    /// Recomputes the advertised window from input-store headroom.
    ///
    /// Returns `true` when a window update should be pushed to the peer: the
    /// window re-opened from zero, or it grew by more than a quarter of the
    /// new value.
    pub fn set_space(&mut self) -> bool {
        let mut space: u32 = self.inq.headroom();
        let mut shift: u32 = 0;
        while space > 0xffff {
            space >>= 1;
            shift += 1;
        }

        let mut send_update: bool = false;
        if space != self.wnd as u32 || shift != self.wnd_scale as u32 {
            let grew_significantly: bool =
                space > self.wnd as u32 && (space - self.wnd as u32) > (space >> 2);
            self.wnd = space as u16;
            self.wnd_scale = shift as u8;

            if self.wnd == 0 {
                self.local_zero_window = true;
            } else if self.local_zero_window {
                self.local_zero_window = false;
                send_update = true;
            } else if grew_significantly {
                send_update = true;
            }
        }
        send_update
    }

    /// Applies the options of an inbound segment to the negotiated state.
    /// Returns the peer's timestamp echo, when present, for RTT sampling.
    ///
    /// MSS adopts the minimum of ours and the peer's. SACK-permitted is only
    /// honored during the handshake (`on_syn`).
    pub fn apply_options(&mut self, header: &TcpHeader, on_syn: bool) -> Option<u32> {
        let mut echo: Option<u32> = None;
        for option in &header.options {
            match option {
                TcpOption::MaximumSegmentSize(peer_mss) => {
                    self.mss_ok = true;
                    if self.mss > *peer_mss {
                        self.mss = *peer_mss;
                    }
                },
                TcpOption::WindowScale(scale) => {
                    // The scale factor is refreshed on every segment that
                    // carries it, matching our own encoder.
                    self.recv_wnd_scale = *scale;
                },
                TcpOption::SackPermitted => {
                    if on_syn && header.syn && self.sack_enabled {
                        self.sack_ok = true;
                    }
                },
                TcpOption::Timestamp {
                    sender_timestamp,
                    echo_timestamp,
                } => {
                    if self.ts_enabled {
                        self.ts_ok = true;
                        self.ts_nxt = *sender_timestamp;
                        if *echo_timestamp != 0 {
                            echo = Some(*echo_timestamp);
                        }
                    }
                },
                TcpOption::SackBlocks(blocks) => {
                    for block in blocks {
                        self.process_sack(block.begin, block.end);
                    }
                },
                TcpOption::NoOperation | TcpOption::EndOfOptionsList => (),
            }
        }
        echo
    }

    /// Marks every output-store segment wholly covered by `[begin, end)` as
    /// selectively acknowledged, so retransmission skips it. Segments
    /// already gone (acknowledged normally) are simply not found.
    fn process_sack(&mut self, begin: SeqNumber, end: SeqNumber) {
        let mut marked: u32 = 0;
        for segment in self.outq.iter_mut() {
            let seg_seq: SeqNumber = segment.seq;
            if seg_seq >= end {
                break;
            }
            if seg_seq >= begin && seg_seq + SeqNumber::from(segment.payload.len() as u32) <= end {
                if !segment.sacked {
                    trace!("process_sack(): marking segment {} as sacked", seg_seq);
                    segment.sacked = true;
                    marked += 1;
                }
            }
        }

        if self.mode > TransmitMode::Lookahead {
            self.in_flight = self.in_flight.saturating_sub(marked);
        }
    }

    /// Builds up to three maximal contiguous SACK ranges from the
    /// out-of-order data sitting beyond `rcv_nxt`. Ranges already pending
    /// are left for the next ACK to carry.
    pub fn sack_prepare(&mut self) {
        if !self.sacks.is_empty() {
            return;
        }
        let mut left: Option<SeqNumber> = None;
        let mut right: SeqNumber = SeqNumber::from(0);
        let mut blocks: ArrayVec<SackRange, MAX_SACK_BLOCKS> = ArrayVec::new();

        for segment in self.inq.iter() {
            if segment.seq < self.rcv_nxt {
                continue;
            }
            let seg_end: SeqNumber = segment.seq + SeqNumber::from(segment.payload.len() as u32);
            match left {
                None => {
                    left = Some(segment.seq);
                    right = seg_end;
                },
                Some(begin) => {
                    if segment.seq == right {
                        right = seg_end;
                    } else {
                        blocks.push(SackRange { begin, end: right });
                        if blocks.is_full() {
                            left = None;
                            break;
                        }
                        left = Some(segment.seq);
                        right = seg_end;
                    }
                },
            }
        }
        if let Some(begin) = left {
            if !blocks.is_full() {
                blocks.push(SackRange { begin, end: right });
            }
        }
        self.sacks = blocks;
    }

    /// Accepts inbound payload into the reassembly store.
    ///
    /// Only a segment starting exactly at `rcv_nxt` advances the in-order
    /// cursor; data beyond it is stored for reassembly when SACK is on.
    /// Stale retransmissions and store overflow drop the data; the caller's
    /// ACK tells the peer where we really are.
    pub fn data_in(&mut self, seq: SeqNumber, payload: Buffer) -> Result<(), Fail> {
        if payload.is_empty() {
            return Ok(());
        }

        if seq <= self.rcv_nxt {
            if seq == self.rcv_nxt {
                let len: u32 = payload.len() as u32;
                self.inq.insert(InputSegment { seq, payload })?;
                self.rcv_nxt = seq + SeqNumber::from(len);
                // Scroll past any previously received out-of-order data that
                // is now contiguous.
                while let Some(next) = self.inq.find(self.rcv_nxt) {
                    self.rcv_nxt = self.rcv_nxt + SeqNumber::from(next.payload.len() as u32);
                }
                self.ev_pending |= SocketEvents::READABLE;
                self.set_space();
            } else {
                debug!(
                    "data_in(): uninteresting retransmission (exp: {}, got: {})",
                    self.rcv_nxt, seq
                );
            }
        } else {
            debug!(
                "data_in(): out-of-order segment, possible loss (exp: {}, got: {})",
                self.rcv_nxt, seq
            );
            if self.sack_ok {
                self.inq.insert(InputSegment { seq, payload })?;
                self.sack_prepare();
            }
        }
        Ok(())
    }

    /// Copies reassembled in-order data into `buf`, advancing
    /// `rcv_processed` and releasing fully consumed records. Returns the
    /// bytes read; zero only at a clean EOF after the peer's FIN.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Fail> {
        let mut total: usize = 0;
        while total < buf.len() {
            let (head_seq, head_len): (SeqNumber, usize) = match self.inq.first() {
                Some(head) => (head.seq, head.payload.len()),
                None => break,
            };
            if self.rcv_processed < head_seq {
                // Reassembly hole; nothing in-order beyond this point.
                break;
            }
            let offset: usize = self.rcv_processed.offset_from(head_seq) as usize;
            if offset >= head_len {
                self.inq.remove(head_seq);
                continue;
            }
            let have: usize = head_len - offset;
            let want: usize = buf.len() - total;
            let count: usize = have.min(want);
            if let Some(head) = self.inq.find(head_seq) {
                buf[total..total + count].copy_from_slice(&head.payload[offset..offset + count]);
            }
            self.rcv_processed = self.rcv_processed + SeqNumber::from(count as u32);
            total += count;
            if count == have {
                self.inq.remove(head_seq);
            }
        }

        // A FIN that arrived ahead of undelivered data surfaces once the
        // application has caught up with the stream.
        if self.remote_fin_pending && self.rcv_processed == self.rcv_nxt - SeqNumber::from(1) {
            self.remote_fin_pending = false;
            self.shut_remote = true;
            if self.state == TcpState::Established {
                self.state = TcpState::CloseWait;
            }
            self.ev_pending |= SocketEvents::PEER_FIN;
        }

        if total == 0 {
            if self.shut_remote {
                return Ok(0);
            }
            return Err(Fail::would_block());
        }
        Ok(total)
    }

    /// Cancels every timer this connection may have armed. Required before
    /// tombstoning so no stale event can reference the reclaimed slot.
    pub fn cancel_timers(&mut self) {
        if let Some(handle) = self.retrans_timer.take() {
            self.timers.cancel(handle);
        }
        if let Some(handle) = self.ka_timer.take() {
            self.timers.cancel(handle);
        }
        if let Some(handle) = self.linger_timer.take() {
            self.timers.cancel(handle);
        }
        self.retrans_due = None;
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        ControlBlock,
        SocketEvents,
    };
    use crate::{
        collections::frame_queue::SharedFrameQueue,
        protocols::tcp::SeqNumber,
        runtime::{
            config::TcpConfig,
            memory::Buffer,
            timer::SharedTimerWheel,
        },
    };
    use ::anyhow::Result;
    use ::std::time::Instant;

    fn cook_ctrlblk() -> ControlBlock {
        let now: Instant = Instant::now();
        ControlBlock::new(
            &TcpConfig::default(),
            SharedFrameQueue::new(64, 1 << 20, 0),
            SharedTimerWheel::new(),
            now,
            now,
        )
    }

    #[test]
    fn in_order_data_advances_cursor() -> Result<()> {
        let mut cb: ControlBlock = cook_ctrlblk();
        cb.rcv_nxt = SeqNumber::from(1000);
        cb.rcv_processed = SeqNumber::from(1000);

        cb.data_in(SeqNumber::from(1000), Buffer::from_slice(&[1; 100]))?;
        crate::ensure_eq!(cb.rcv_nxt, SeqNumber::from(1100));
        crate::ensure_eq!(cb.ev_pending.contains(SocketEvents::READABLE), true);

        let mut out: [u8; 64] = [0; 64];
        crate::ensure_eq!(cb.read(&mut out)?, 64);
        crate::ensure_eq!(cb.read(&mut out)?, 36);
        crate::ensure_eq!(cb.read(&mut out).is_err(), true);
        crate::ensure_eq!(cb.inq.is_empty(), true);

        Ok(())
    }

    #[test]
    fn out_of_order_data_reassembles() -> Result<()> {
        let mut cb: ControlBlock = cook_ctrlblk();
        cb.rcv_nxt = SeqNumber::from(0);
        cb.sack_ok = true;

        // A hole at [0, 100); data for [100, 200) parks in the store.
        cb.data_in(SeqNumber::from(100), Buffer::from_slice(&[2; 100]))?;
        crate::ensure_eq!(cb.rcv_nxt, SeqNumber::from(0));
        crate::ensure_eq!(cb.sacks.len(), 1);
        crate::ensure_eq!(cb.sacks[0].begin, SeqNumber::from(100));
        crate::ensure_eq!(cb.sacks[0].end, SeqNumber::from(200));

        // Filling the hole scrolls the cursor past both segments.
        cb.data_in(SeqNumber::from(0), Buffer::from_slice(&[1; 100]))?;
        crate::ensure_eq!(cb.rcv_nxt, SeqNumber::from(200));

        Ok(())
    }

    #[test]
    fn sack_prepare_builds_maximal_blocks() -> Result<()> {
        let mut cb: ControlBlock = cook_ctrlblk();
        cb.rcv_nxt = SeqNumber::from(0);
        cb.sack_ok = true;

        cb.data_in(SeqNumber::from(100), Buffer::from_slice(&[0; 50]))?;
        cb.sacks.clear();
        cb.data_in(SeqNumber::from(150), Buffer::from_slice(&[0; 50]))?;
        cb.sacks.clear();
        cb.data_in(SeqNumber::from(300), Buffer::from_slice(&[0; 10]))?;

        crate::ensure_eq!(cb.sacks.len(), 2);
        crate::ensure_eq!(cb.sacks[0].begin, SeqNumber::from(100));
        crate::ensure_eq!(cb.sacks[0].end, SeqNumber::from(200));
        crate::ensure_eq!(cb.sacks[1].begin, SeqNumber::from(300));
        crate::ensure_eq!(cb.sacks[1].end, SeqNumber::from(310));

        Ok(())
    }

    #[test]
    fn window_update_on_reopen_from_zero() -> Result<()> {
        let mut cb: ControlBlock = cook_ctrlblk();

        // Fill the input store so the advertised window collapses.
        let budget: u32 = cb.inq.max_size();
        let chunk: usize = (budget - 64) as usize;
        cb.rcv_nxt = SeqNumber::from(0);
        cb.data_in(SeqNumber::from(0), Buffer::from_slice(&vec![0; chunk]))?;
        cb.set_space();
        crate::ensure_eq!(cb.advertised_window_bytes() < 64, true);

        // Reading the data back re-opens the window.
        let mut out: Vec<u8> = vec![0; chunk];
        let mut read: usize = 0;
        while read < chunk {
            read += cb.read(&mut out[read..])?;
        }
        let update: bool = cb.set_space();
        crate::ensure_eq!(update, true);
        crate::ensure_eq!(cb.advertised_window_bytes() > 0, true);

        Ok(())
    }
}
