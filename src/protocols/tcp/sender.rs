// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// Send-side engine: segment emission, the write path with Nagle coalescing,
// the output scheduler that walks the output store under the congestion and
// peer windows, zero-window probing, and retransmission.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::{
        frame_queue::SharedFrameQueue,
        segment_store::StoredSegment,
    },
    protocols::tcp::{
        ctrlblk::{
            ControlBlock,
            SocketEvents,
            TransmitMode,
        },
        fsm::TcpState,
        header::{
            flags,
            SackRange,
            TcpHeader,
            TcpOption,
            MAX_TCP_OPTIONS,
        },
        SeqNumber,
        INITIAL_WINDOW,
        MAX_WIRE_SACK_BLOCKS,
    },
    runtime::{
        fail::Fail,
        memory::{
            Buffer,
            Frame,
        },
        timer::TimerEvent,
    },
};
use ::arrayvec::ArrayVec;
use ::libc::{
    EAGAIN,
    EINVAL,
    EPIPE,
};
use ::std::{
    net::Ipv4Addr,
    time::Instant,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// One outbound segment parked in the output (or hold) store until
/// acknowledged. The wire frame is rebuilt at every transmission so window,
/// acknowledgment and option fields are always current.
#[derive(Debug)]
pub struct OutboundSegment {
    pub seq: SeqNumber,
    pub payload: Buffer,
    /// When this segment last went to the wire; `None` before the first
    /// transmission.
    pub timestamp: Option<Instant>,
    /// Selectively acknowledged by the peer; retransmission skips it.
    pub sacked: bool,
}

impl OutboundSegment {
    pub fn new(seq: SeqNumber, payload: Buffer) -> Self {
        Self {
            seq,
            payload,
            timestamp: None,
            sacked: false,
        }
    }
}

impl StoredSegment for OutboundSegment {
    fn seq(&self) -> SeqNumber {
        self.seq
    }

    fn len(&self) -> u32 {
        self.payload.len() as u32
    }

    fn timestamp(&self) -> Option<Instant> {
        self.timestamp
    }
}

/// How [ControlBlock::retransmit_timeout] resolved.
#[derive(Debug, Eq, PartialEq)]
pub enum RetransmitOutcome {
    /// Handled; the timer has been re-armed as needed.
    Done,
    /// The retry ceiling was exceeded: tear the connection down.
    Abandon,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl ControlBlock {
    /// Builds the option list for an outgoing segment. SYN segments carry
    /// the full handshake set; everything else always refreshes the window
    /// scale and echoes timestamps when negotiated. Pending SACK ranges ride
    /// only on ACK-class segments without payload, and are consumed by the
    /// segment that carries them.
    fn options_for(&mut self, flag_bits: u8, attach_sacks: bool, now: Instant) -> ArrayVec<TcpOption, MAX_TCP_OPTIONS> {
        let mut options: ArrayVec<TcpOption, MAX_TCP_OPTIONS> = ArrayVec::new();
        let on_syn: bool = (flag_bits & flags::SYN) != 0;

        if on_syn {
            options.push(TcpOption::MaximumSegmentSize(self.mss));
            if self.sack_enabled {
                options.push(TcpOption::SackPermitted);
            }
        }

        options.push(TcpOption::WindowScale(self.wnd_scale));

        if (on_syn && self.ts_enabled) || self.ts_ok {
            options.push(TcpOption::Timestamp {
                sender_timestamp: self.now_ms(now),
                echo_timestamp: self.ts_nxt,
            });
        }

        if attach_sacks && (flag_bits & flags::ACK) != 0 && self.sack_ok && !self.sacks.is_empty() {
            let mut blocks: ArrayVec<SackRange, MAX_WIRE_SACK_BLOCKS> = ArrayVec::new();
            for block in self.sacks.drain(..) {
                blocks.push(block);
            }
            options.push(TcpOption::SackBlocks(blocks));
        }

        options
    }

    /// Serializes a finished header plus payload and hands the frame to the
    /// outbound queue. Queue-cap failures silently drop the frame; the
    /// peer's retransmission covers for us.
    fn emit_header(&mut self, header: TcpHeader, payload: &[u8], now: Instant) {
        let header_size: usize = header.compute_size();
        let mut body: Buffer = Buffer::new(header_size + payload.len());
        body[header_size..].copy_from_slice(payload);
        {
            let (hdr_bytes, data_bytes) = body.split_at_mut(header_size);
            header.serialize(hdr_bytes, self.local.ip(), self.remote.ip(), data_bytes);
        }

        let mut frame: Frame = Frame::new(*self.local.ip(), *self.remote.ip(), body);
        frame.timestamp = Some(now);
        frame.socket = Some(self.id);

        trace!(
            "emit(): {} -> {} seq={} flags={:#04x} len={}",
            self.local,
            self.remote,
            header.seq_num,
            header.flag_bits(),
            payload.len()
        );
        if let Err(e) = self.outgoing.enqueue(frame) {
            // Dropping a reply is always recoverable.
            warn!("emit(): outbound queue rejected frame ({:?})", e);
        }
    }

    /// Builds and sends one segment from the current connection state.
    fn emit(&mut self, flag_bits: u8, seq: SeqNumber, payload: &[u8], now: Instant) {
        let mut header: TcpHeader = TcpHeader::new(self.local.port(), self.remote.port());
        header.seq_num = seq;
        header.syn = (flag_bits & flags::SYN) != 0;
        header.fin = (flag_bits & flags::FIN) != 0;
        header.rst = (flag_bits & flags::RST) != 0;
        header.psh = (flag_bits & flags::PSH) != 0 || !payload.is_empty();
        header.ack = (flag_bits & flags::ACK) != 0 || !payload.is_empty();
        if header.ack {
            header.ack_num = self.rcv_nxt;
            self.rcv_ackd = self.rcv_nxt;
        }
        header.window_size = self.wnd;
        header.options = self.options_for(header.flag_bits(), payload.is_empty(), now);
        self.emit_header(header, payload, now);
    }

    /// Sends a bare acknowledgment reflecting our current receive state.
    pub fn send_ack(&mut self, now: Instant) {
        self.set_space();
        self.emit(flags::ACK, self.snd_nxt, &[], now);
    }

    /// Sends a window update; on this stack that is a plain ACK carrying the
    /// fresh window.
    pub fn send_window_update(&mut self, now: Instant) {
        self.send_ack(now);
    }

    /// Sends a one-byte-in-the-past probe, used both for keepalive and for
    /// zero-window probing.
    pub fn send_probe(&mut self, now: Instant) {
        self.set_space();
        self.emit(flags::PSH | flags::ACK, self.snd_nxt - SeqNumber::from(1), &[], now);
    }

    /// Sends the connect SYN. The sequence cursor stays on the SYN itself so
    /// the SYN-ACK validation (`ack == snd_nxt + 1`) can use it.
    pub fn send_syn(&mut self, now: Instant) {
        self.set_space();
        self.emit(flags::SYN, self.snd_nxt, &[], now);
    }

    /// Sends a SYN-ACK and consumes one sequence number for our SYN.
    pub fn send_synack(&mut self, now: Instant) {
        self.set_space();
        self.snd_last = self.snd_nxt;
        self.emit(flags::SYN | flags::ACK, self.snd_nxt, &[], now);
        self.snd_nxt = self.snd_nxt + SeqNumber::from(1);
    }

    /// Sends a FIN, consuming one sequence number, and starts the FIN
    /// handshake watchdog.
    pub fn send_fin(&mut self, now: Instant) {
        self.set_space();
        self.emit(flags::FIN | flags::ACK, self.snd_nxt, &[], now);
        self.snd_nxt = self.snd_nxt + SeqNumber::from(1);
        self.start_linger(now);
    }

    /// Sends a reset carrying the given sequence number.
    pub fn send_rst_seq(&mut self, seq: SeqNumber, now: Instant) {
        self.emit(flags::RST, seq, &[], now);
    }

    /// Reset reply for a segment received while not synchronized: the reset
    /// is sequenced off the offender's ACK field and acknowledges the
    /// offending segment.
    pub fn send_nosync_rst(&mut self, offender: &TcpHeader, offender_len: usize, now: Instant) {
        self.set_space();
        let mut header: TcpHeader = TcpHeader::new(self.local.port(), self.remote.port());
        header.rst = true;
        header.ack = true;
        header.seq_num = if offender.ack {
            offender.ack_num
        } else {
            SeqNumber::from(0)
        };
        header.ack_num = offender.seq_num + SeqNumber::from(offender_len as u32);
        header.window_size = self.wnd;
        header.options = self.options_for(flags::RST, false, now);
        self.rcv_ackd = self.rcv_nxt;
        self.emit_header(header, &[], now);
    }

    /// (Re)arms the FIN handshake watchdog.
    pub fn start_linger(&mut self, now: Instant) {
        if let Some(handle) = self.linger_timer.take() {
            self.timers.cancel(handle);
        }
        self.linger_timer = Some(self.timers.set(now + self.linger_timeout, TimerEvent::FinLinger(self.id)));
    }

    /// Accepts application data for transmission. Data is chunked at the
    /// MSS; with Nagle enabled, sub-MSS chunks are held back and coalesced
    /// unless the connection is idle. Returns the number of bytes accepted,
    /// failing only when nothing could be queued.
    pub fn push(&mut self, data: &[u8], now: Instant) -> Result<usize, Fail> {
        if self.shut_local {
            return Err(Fail::new(EPIPE, "socket is shut down for writing"));
        }
        match self.state {
            TcpState::Established | TcpState::CloseWait => (),
            _ => return Err(Fail::new(EINVAL, "socket is not connected")),
        }
        if data.is_empty() {
            return Ok(0);
        }

        let mut accepted: usize = 0;
        for chunk in data.chunks(self.mss as usize) {
            let seq: SeqNumber = self.snd_last + SeqNumber::from(1);
            let segment: OutboundSegment = OutboundSegment::new(seq, Buffer::from_slice(chunk));
            let queued: bool = if self.nagle {
                self.push_nagle(segment)
            } else {
                self.outq.insert(segment).is_ok()
            };
            if !queued {
                break;
            }
            self.snd_last = self.snd_last + SeqNumber::from(chunk.len() as u32);
            accepted += chunk.len();
        }

        if accepted == 0 {
            return Err(Fail::new(EAGAIN, "send queues are full"));
        }
        self.transmit_pending(now);
        Ok(accepted)
    }

    /// Nagle placement for one chunk: straight to the output store while the
    /// connection is idle and nothing is held, otherwise into the hold store
    /// with coalescing once a full MSS has accumulated.
    fn push_nagle(&mut self, segment: OutboundSegment) -> bool {
        if self.is_idle() && self.holdq.is_empty() {
            return self.outq.insert(segment).is_ok();
        }

        let total: u32 = segment.payload.len() as u32 + self.holdq.size();
        if total >= self.mss as u32 && self.outq.headroom() >= self.mss as u32 {
            if self.holdq.insert(segment).is_err() {
                return false;
            }
            if let Some(coalesced) = self.hold_segment_make() {
                if self.outq.insert(coalesced).is_err() {
                    warn!("push_nagle(): output store rejected coalesced segment");
                }
            }
            true
        } else {
            self.holdq.insert(segment).is_ok()
        }
    }

    /// Makes one MSS-sized (at most) segment out of the head of the hold
    /// store, consuming the coalesced pieces.
    pub fn hold_segment_make(&mut self) -> Option<OutboundSegment> {
        let first_seq: SeqNumber = self.holdq.first()?.seq;

        let mut bytes: Vec<u8> = Vec::with_capacity(self.mss as usize);
        while let Some(head) = self.holdq.first() {
            if bytes.len() as u32 + head.payload.len() as u32 > self.mss as u32 {
                break;
            }
            let head_seq: SeqNumber = head.seq;
            let head_segment: OutboundSegment = self.holdq.remove(head_seq)?;
            bytes.extend_from_slice(&head_segment.payload[..]);
        }
        if bytes.is_empty() {
            return None;
        }
        debug!("hold_segment_make(): coalesced {} bytes at {}", bytes.len(), first_seq);
        Some(OutboundSegment::new(first_seq, Buffer::from(bytes)))
    }

    /// Drains the hold store into the output store while full segments fit.
    pub fn flush_hold_queue(&mut self) {
        while !self.holdq.is_empty() && self.outq.headroom() >= self.mss as u32 {
            if self.holdq.size() < self.mss as u32 && !self.is_idle() {
                break;
            }
            match self.hold_segment_make() {
                Some(segment) => {
                    if self.outq.insert(segment).is_err() {
                        break;
                    }
                },
                None => break,
            }
        }
    }

    /// The output scheduler: walks the output store from `snd_nxt`, sending
    /// while the congestion window has room, respecting the peer's
    /// advertised window (entering window-full mode when it is exhausted,
    /// splitting a segment when it only partially fits).
    pub fn transmit_pending(&mut self, now: Instant) {
        loop {
            if self.cwnd < self.in_flight {
                break;
            }
            let Some(una) = self.outq.first().map(|segment| segment.seq) else {
                break;
            };
            if self.outq.find(self.snd_nxt).is_none() {
                break;
            }

            let seq_diff: u32 = self.snd_nxt.offset_from(una);
            let peer_window: u32 = self.peer_window_bytes();

            if seq_diff >= peer_window {
                if self.mode != TransmitMode::WindowFull {
                    debug!("transmit_pending(): peer window full (rwnd {})", peer_window);
                    self.snd_nxt = una;
                    self.snd_retry = una;
                    self.mode = TransmitMode::WindowFull;
                    self.arm_retransmit(Some(now + self.rto.backed_off(self.backoff)), now);
                }
                break;
            }

            let seg_len: u32 = match self.outq.find(self.snd_nxt) {
                Some(segment) => segment.payload.len() as u32,
                None => break,
            };
            if seq_diff + seg_len > peer_window {
                // Only the front of this segment fits.
                self.split_segment(self.snd_nxt, peer_window - seq_diff);
            }

            let (seg_seq, payload): (SeqNumber, Buffer) = match self.outq.find_mut(self.snd_nxt) {
                Some(segment) => {
                    segment.timestamp = Some(now);
                    (segment.seq, segment.payload.clone())
                },
                None => break,
            };
            self.arm_retransmit(Some(now + self.rto.backed_off(0)), now);
            self.emit(flags::ACK, seg_seq, &payload[..], now);
            self.in_flight += 1;
            self.snd_nxt = self.snd_nxt + SeqNumber::from(payload.len() as u32);
            self.snd_last_out = seg_seq;
        }

        // Once the queue drains, a locally requested close can finally put
        // its FIN on the wire.
        if self.outq.is_empty() && self.shut_local {
            self.check_closing(now);
        }
        if self.outq.size() < self.outq.max_size() {
            self.ev_pending |= SocketEvents::WRITABLE;
        }
    }

    /// Sends the FIN for a locally initiated close once the output store
    /// has drained, advancing the close-side state.
    pub fn check_closing(&mut self, now: Instant) {
        match self.state {
            TcpState::Established => {
                self.send_fin(now);
                self.state = TcpState::FinWait1;
            },
            TcpState::CloseWait => {
                self.send_fin(now);
                self.state = TcpState::LastAck;
            },
            _ => (),
        }
    }

    /// Splits the stored segment at `seq` so that its first part carries
    /// `size` bytes.
    fn split_segment(&mut self, seq: SeqNumber, size: u32) {
        let Some(segment) = self.outq.remove(seq) else {
            return;
        };
        let total: usize = segment.payload.len();
        if size == 0 || (size as usize) >= total {
            // Nothing to split; put it back.
            let _ = self.outq.insert(segment);
            return;
        }

        let mut front_payload: Buffer = segment.payload.clone();
        let mut back_payload: Buffer = segment.payload;
        front_payload.trim(total - size as usize).expect("front split in range");
        back_payload.adjust(size as usize).expect("back split in range");

        let front: OutboundSegment = OutboundSegment::new(seq, front_payload);
        let mut back: OutboundSegment = OutboundSegment::new(seq + SeqNumber::from(size), back_payload);
        back.sacked = segment.sacked;

        // Re-inserting what we just removed cannot exceed the byte budget.
        let _ = self.outq.insert(front);
        let _ = self.outq.insert(back);
    }

    /// Arms (or re-schedules) the single retransmission timer.
    ///
    /// With an explicit deadline, that deadline is adopted; otherwise the
    /// earliest transmitted-but-unacknowledged segment defines it. The
    /// physical timer is only armed when none is outstanding; a fire that
    /// discovers a later due time simply re-arms.
    pub fn arm_retransmit(&mut self, deadline: Option<Instant>, now: Instant) {
        let due: Option<Instant> = match deadline {
            Some(deadline) => Some(deadline),
            None => {
                let mut earliest: Option<Instant> = None;
                for segment in self.outq.iter() {
                    if let Some(sent_at) = segment.timestamp {
                        if earliest.map(|e| sent_at < e).unwrap_or(true) {
                            earliest = Some(sent_at);
                        }
                    }
                }
                earliest.map(|sent_at| sent_at + self.rto.backed_off(self.backoff))
            },
        };

        let Some(mut due) = due else {
            return;
        };
        if due <= now {
            due = now + std::time::Duration::from_millis(1);
        }
        self.retrans_due = Some(due);
        if self.retrans_timer.is_none() {
            self.retrans_timer = Some(self.timers.set(due, TimerEvent::Retransmit(self.id)));
        }
    }

    /// Handles a retransmission timer fire whose deadline really passed:
    /// first timeout enters blackout (window collapse), window-full mode
    /// sends a zero-window probe instead, and every pass backs the timer
    /// off exponentially. Reports whether the retry ceiling was hit.
    pub fn retransmit_timeout(&mut self, now: Instant) -> RetransmitOutcome {
        let sendable: bool = matches!(self.state, TcpState::Established | TcpState::CloseWait);

        if sendable && self.backoff < super::MAX_RETRANS {
            if self.outq.first().is_none() {
                if self.outq.size() < self.outq.max_size() {
                    self.ev_pending |= SocketEvents::WRITABLE;
                }
                return RetransmitOutcome::Done;
            }

            if self.mode == TransmitMode::WindowFull {
                debug!("retransmit_timeout(): zero-window probe (backoff {})", self.backoff);
                self.send_probe(now);
                self.backoff += 1;
                self.arm_retransmit(Some(now + self.rto.backed_off(self.backoff)), now);
                return RetransmitOutcome::Done;
            }

            if self.mode != TransmitMode::Blackout {
                // First timeout: collapse the window and restart from the
                // oldest unacknowledged byte.
                self.mode = TransmitMode::Blackout;
                self.cwnd = INITIAL_WINDOW;
                self.in_flight = 0;
            }

            let first_seq: SeqNumber = match self.outq.first() {
                Some(first) => first.seq,
                None => return RetransmitOutcome::Done,
            };
            let (seq, payload): (SeqNumber, Buffer) = match self.outq.find_mut(first_seq) {
                Some(segment) => {
                    segment.timestamp = Some(now);
                    (segment.seq, segment.payload.clone())
                },
                None => return RetransmitOutcome::Done,
            };
            debug!("retransmit_timeout(): resending {} (backoff {})", seq, self.backoff);
            self.emit(flags::ACK, seq, &payload[..], now);
            self.snd_last_out = seq;
            self.backoff += 1;
            self.arm_retransmit(Some(now + self.rto.backed_off(self.backoff)), now);
            RetransmitOutcome::Done
        } else if self.backoff >= super::MAX_RETRANS
            && matches!(
                self.state,
                TcpState::Established
                    | TcpState::FinWait1
                    | TcpState::FinWait2
                    | TcpState::TimeWait
                    | TcpState::CloseWait
                    | TcpState::LastAck
                    | TcpState::Closing
            )
        {
            debug!("retransmit_timeout(): retry ceiling exceeded, abandoning connection");
            self.outq.clear();
            RetransmitOutcome::Abandon
        } else {
            trace!("retransmit_timeout(): retransmission not allowed in {:?}", self.state);
            RetransmitOutcome::Done
        }
    }

    /// Retransmits the single segment at `seq` (duplicate-ACK driven).
    pub fn retransmit_one(&mut self, seq: SeqNumber, now: Instant) {
        let (seg_seq, payload): (SeqNumber, Buffer) = match self.outq.find_mut(seq) {
            Some(segment) => {
                segment.timestamp = Some(now);
                (segment.seq, segment.payload.clone())
            },
            None => return,
        };
        debug!("retransmit_one(): resending {} on duplicate ack", seg_seq);
        self.emit(flags::ACK, seg_seq, &payload[..], now);
        self.in_flight += 1;
        self.snd_last_out = seg_seq;
        self.arm_retransmit(Some(now + self.rto.backed_off(0)), now);
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Builds the reset reply for a segment that matched no socket (or an
/// unsynchronized listener): ports reversed, sequenced off the offender's
/// ACK field when present, otherwise acknowledging the offending bytes.
pub fn reply_rst(
    offender: &TcpHeader,
    offender_len: usize,
    src_addr: Ipv4Addr,
    dst_addr: Ipv4Addr,
    outgoing: &SharedFrameQueue,
    now: Instant,
) {
    if offender.rst {
        return;
    }

    let mut header: TcpHeader = TcpHeader::new(offender.dst_port, offender.src_port);
    header.rst = true;
    header.window_size = 0;
    if offender.ack {
        header.seq_num = offender.ack_num;
    } else {
        header.seq_num = SeqNumber::from(0);
        header.ack = true;
        header.ack_num = offender.seq_num + SeqNumber::from(offender_len as u32);
    }

    let header_size: usize = header.compute_size();
    let mut body: Buffer = Buffer::new(header_size);
    header.serialize(&mut body[..], &src_addr, &dst_addr, &[]);

    let mut frame: Frame = Frame::new(src_addr, dst_addr, body);
    frame.timestamp = Some(now);
    debug!("reply_rst(): resetting {} -> {}", offender.src_port, offender.dst_port);
    if let Err(e) = outgoing.enqueue(frame) {
        warn!("reply_rst(): outbound queue rejected frame ({:?})", e);
    }
}
