// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// Transport state machine: segment classification, the per-state table of
// legal flag combinations, and the {state, class} -> handler dispatch.
//
// Anything illegal for the current state elicits an immediate reset reply
// and no state change. Handlers mutate the control block and, where a
// transition kills the connection, tear it down through the peer.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    protocols::tcp::{
        ctrlblk::{
            ControlBlock,
            SocketEvents,
        },
        header::{
            flags,
            TcpHeader,
        },
        peer::TcpPeer,
        SeqNumber,
    },
    runtime::{
        memory::Buffer,
        SocketId,
    },
};
use ::std::{
    net::Ipv4Addr,
    time::Instant,
};

//======================================================================================================================
// Constants
//======================================================================================================================

const SYN: u8 = flags::SYN;
const SYNACK: u8 = flags::SYN | flags::ACK;
const ACK: u8 = flags::ACK;
const PSH: u8 = flags::PSH;
const PSHACK: u8 = flags::PSH | flags::ACK;
const FIN: u8 = flags::FIN;
const FINACK: u8 = flags::FIN | flags::ACK;
const FINPSHACK: u8 = flags::FIN | flags::PSH | flags::ACK;
const RST: u8 = flags::RST;
const RSTACK: u8 = flags::RST | flags::ACK;

//======================================================================================================================
// Enumerations
//======================================================================================================================

/// TCP connection state, RFC 793 names.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynRecv,
    Established,
    CloseWait,
    LastAck,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
}

/// Generic socket lifecycle, tracked beside the TCP state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SocketState {
    Unbound,
    Bound,
    Connected,
    Closed,
}

/// Classification of an inbound flag set.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SegmentClass {
    Syn,
    SynAck,
    /// ACK, PSH or PSH+ACK: acknowledgment and/or data.
    AckClass,
    Fin,
    FinAck,
    Rst,
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// One inbound segment after header parsing, ready for dispatch.
pub struct Segment {
    pub header: TcpHeader,
    pub payload: Buffer,
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Maps a flag set to its segment class.
pub fn classify(bits: u8) -> Option<SegmentClass> {
    match bits {
        SYN => Some(SegmentClass::Syn),
        SYNACK => Some(SegmentClass::SynAck),
        ACK | PSH | PSHACK => Some(SegmentClass::AckClass),
        FIN => Some(SegmentClass::Fin),
        FINACK | FINPSHACK => Some(SegmentClass::FinAck),
        bits if (bits & RST) != 0 => Some(SegmentClass::Rst),
        _ => None,
    }
}

/// The companion validity table: which exact flag combinations are legal in
/// each state. Everything else is answered with a reset.
pub fn allowed(state: TcpState, bits: u8) -> bool {
    if bits == 0 {
        return false;
    }
    let valid: &[u8] = match state {
        TcpState::Closed => &[],
        TcpState::Listen => &[SYN],
        TcpState::SynSent => &[SYNACK, RST, RSTACK],
        TcpState::SynRecv => &[SYN, ACK, PSH, PSHACK, FINACK, FINPSHACK, RST],
        TcpState::Established => &[SYN, SYNACK, ACK, PSH, PSHACK, FIN, FINACK, FINPSHACK, RST, RSTACK],
        TcpState::CloseWait
        | TcpState::LastAck
        | TcpState::FinWait1
        | TcpState::FinWait2
        | TcpState::Closing
        | TcpState::TimeWait => &[SYNACK, ACK, PSH, PSHACK, FIN, FINACK, FINPSHACK, RST],
    };
    valid.contains(&bits)
}

/// Routes one classified inbound segment through the state machine.
pub fn dispatch(peer: &mut TcpPeer, id: SocketId, segment: Segment, now: Instant) {
    let state: TcpState = match peer.sockets.get(usize::from(id)) {
        Some(cb) if !cb.defunct => cb.state,
        _ => return,
    };
    let bits: u8 = segment.header.flag_bits();

    if !allowed(state, bits) {
        debug!("dispatch(): illegal flags {:#04x} in {:?}, resetting", bits, state);
        peer.reply_rst_for(&segment, now);
        return;
    }

    match classify(bits) {
        Some(SegmentClass::Syn) => on_syn(peer, id, &segment, now),
        Some(SegmentClass::SynAck) => on_synack(peer, id, &segment, now),
        Some(SegmentClass::AckClass) => {
            if (bits & ACK) != 0 {
                on_ack(peer, id, &segment, now);
            }
            if !segment.payload.is_empty() {
                on_data(peer, id, segment, now);
            }
        },
        Some(SegmentClass::Fin) => {
            on_fin(peer, id, &segment, now);
        },
        Some(SegmentClass::FinAck) => {
            if !segment.payload.is_empty() {
                // Data rides along; reassemble it before consuming the FIN.
                let header: TcpHeader = segment.header.clone();
                let src_addr: Ipv4Addr = segment.src_addr;
                let dst_addr: Ipv4Addr = segment.dst_addr;
                on_data(peer, id, segment, now);
                let empty: Segment = Segment {
                    header,
                    payload: Buffer::empty(),
                    src_addr,
                    dst_addr,
                };
                on_finack(peer, id, &empty, now);
            } else {
                on_finack(peer, id, &segment, now);
            }
        },
        Some(SegmentClass::Rst) => on_rst(peer, id, &segment, now),
        None => {
            debug!("dispatch(): unclassifiable flags {:#04x}, resetting", bits);
            peer.reply_rst_for(&segment, now);
        },
    }
}

//======================================================================================================================
// Transition Handlers
//======================================================================================================================

fn on_syn(peer: &mut TcpPeer, id: SocketId, segment: &Segment, now: Instant) {
    let state: TcpState = match peer.sockets.get(usize::from(id)) {
        Some(cb) if !cb.defunct => cb.state,
        _ => return,
    };
    match state {
        TcpState::Listen => peer.handle_listen_syn(id, segment, now),
        TcpState::SynRecv => {
            // A retransmitted SYN for the connection we are already
            // half-open on: replay the SYN-ACK with its original sequence.
            let cb: &mut ControlBlock = &mut peer.sockets[usize::from(id)];
            if cb.rcv_nxt == segment.header.seq_num + SeqNumber::from(1) {
                cb.snd_nxt = cb.snd_nxt - SeqNumber::from(1);
                cb.send_synack(now);
            } else {
                peer.send_rst_and_teardown(id, now);
            }
        },
        TcpState::Established => {
            // Half-open resynchronization attempt: re-assert our state.
            peer.sockets[usize::from(id)].send_ack(now);
        },
        _ => (),
    }
}

fn on_synack(peer: &mut TcpPeer, id: SocketId, segment: &Segment, now: Instant) {
    let state: TcpState = match peer.sockets.get(usize::from(id)) {
        Some(cb) if !cb.defunct => cb.state,
        _ => return,
    };
    match state {
        TcpState::SynSent => {
            let header: &TcpHeader = &segment.header;
            let cb: &mut ControlBlock = &mut peer.sockets[usize::from(id)];
            if header.ack_num == cb.snd_nxt + SeqNumber::from(1) {
                // Our SYN is acknowledged. Stop the connect retry clock and
                // synchronize the receive side.
                if let Some(handle) = cb.retrans_timer.take() {
                    cb.timers.cancel(handle);
                }
                cb.retrans_due = None;

                cb.rcv_nxt = header.seq_num;
                cb.rcv_processed = cb.rcv_nxt + SeqNumber::from(1);
                let echo: Option<u32> = cb.apply_options(header, true);
                cb.process_ack(header, 0, echo, now);

                peer.enter_established(id, now);

                let cb: &mut ControlBlock = &mut peer.sockets[usize::from(id)];
                cb.ev_pending |= SocketEvents::CONNECTED | SocketEvents::WRITABLE;
                cb.rcv_nxt = cb.rcv_nxt + SeqNumber::from(1);
                cb.snd_nxt = cb.snd_nxt + SeqNumber::from(1);
                cb.send_ack(now);
            } else if !header.rst {
                debug!("on_synack(): bad ack number, resetting");
                cb.send_nosync_rst(header, segment.payload.len(), now);
            }
        },
        TcpState::Established
        | TcpState::CloseWait
        | TcpState::LastAck
        | TcpState::FinWait1
        | TcpState::FinWait2
        | TcpState::Closing => process_ack_for(peer, id, segment, now),
        _ => (),
    }
}

fn on_ack(peer: &mut TcpPeer, id: SocketId, segment: &Segment, now: Instant) {
    let state: TcpState = match peer.sockets.get(usize::from(id)) {
        Some(cb) if !cb.defunct => cb.state,
        _ => return,
    };
    let header: &TcpHeader = &segment.header;
    match state {
        TcpState::SynRecv => {
            // The handshake's final ACK.
            let cb: &mut ControlBlock = &mut peer.sockets[usize::from(id)];
            if cb.snd_nxt == header.ack_num {
                cb.rcv_processed = cb.rcv_nxt;
                let echo: Option<u32> = cb.apply_options(header, false);
                cb.process_ack(header, segment.payload.len(), echo, now);
                peer.enter_established(id, now);

                let parent: Option<SocketId> = peer.sockets[usize::from(id)].parent;
                match parent {
                    // The listener learns a child is ready to accept.
                    Some(parent_id) => {
                        if let Some(parent_cb) = peer.sockets.get_mut(usize::from(parent_id)) {
                            parent_cb.ev_pending |= SocketEvents::CONNECTED;
                        }
                    },
                    // A simultaneous open completes on the socket itself.
                    None => peer.sockets[usize::from(id)].ev_pending |= SocketEvents::CONNECTED,
                }
                peer.sockets[usize::from(id)].ev_pending |= SocketEvents::WRITABLE;
            } else if !header.rst {
                let cb: &mut ControlBlock = &mut peer.sockets[usize::from(id)];
                cb.send_nosync_rst(header, segment.payload.len(), now);
            }
        },
        TcpState::Established | TcpState::CloseWait | TcpState::FinWait2 => {
            process_ack_for(peer, id, segment, now);
        },
        TcpState::FinWait1 => {
            process_ack_for(peer, id, segment, now);
            let cb: &mut ControlBlock = &mut peer.sockets[usize::from(id)];
            if header.ack_num == cb.snd_nxt {
                // Our FIN is acknowledged.
                cb.state = TcpState::FinWait2;
            }
        },
        TcpState::Closing => {
            process_ack_for(peer, id, segment, now);
            let cb: &mut ControlBlock = &mut peer.sockets[usize::from(id)];
            if header.ack_num == cb.snd_nxt {
                cb.state = TcpState::TimeWait;
                cb.ev_pending |= SocketEvents::CLOSED;
                cb.start_linger(now);
            }
        },
        TcpState::LastAck => {
            let cb: &mut ControlBlock = &mut peer.sockets[usize::from(id)];
            if header.ack_num == cb.snd_nxt {
                cb.state = TcpState::Closed;
                cb.sock_state = SocketState::Closed;
                peer.teardown(id, SocketEvents::CLOSED);
            }
        },
        _ => (),
    }
}

fn on_data(peer: &mut TcpPeer, id: SocketId, segment: Segment, now: Instant) {
    let state: TcpState = match peer.sockets.get(usize::from(id)) {
        Some(cb) if !cb.defunct => cb.state,
        _ => return,
    };
    match state {
        TcpState::SynRecv | TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 => {
            let rst: bool = segment.header.rst;
            let seq: SeqNumber = segment.header.seq_num;
            let cb: &mut ControlBlock = &mut peer.sockets[usize::from(id)];
            if let Err(e) = cb.data_in(seq, segment.payload) {
                debug!("on_data(): dropped payload ({:?})", e);
            }
            // ACK up to rcv_nxt in either case, unless mid-handshake or the
            // segment raised a reset.
            if !matches!(cb.state, TcpState::CloseWait | TcpState::SynSent | TcpState::SynRecv) && !rst {
                cb.send_ack(now);
            }
        },
        TcpState::CloseWait | TcpState::LastAck | TcpState::Closing | TcpState::TimeWait => {
            // The peer has no business sending data this late.
            let ack_num: SeqNumber = segment.header.ack_num;
            peer.sockets[usize::from(id)].send_rst_seq(ack_num, now);
        },
        _ => (),
    }
}

fn on_fin(peer: &mut TcpPeer, id: SocketId, segment: &Segment, now: Instant) {
    let state: TcpState = match peer.sockets.get(usize::from(id)) {
        Some(cb) if !cb.defunct => cb.state,
        _ => return,
    };
    match state {
        TcpState::Established | TcpState::CloseWait => close_wait(peer, id, segment, now),
        TcpState::FinWait1 => {
            // Simultaneous close: both FINs crossed.
            let cb: &mut ControlBlock = &mut peer.sockets[usize::from(id)];
            cb.state = TcpState::Closing;
            cb.rcv_processed = cb.rcv_nxt + SeqNumber::from(1);
            cb.rcv_nxt = cb.rcv_nxt + SeqNumber::from(1);
            cb.send_ack(now);
        },
        TcpState::FinWait2 => {
            let cb: &mut ControlBlock = &mut peer.sockets[usize::from(id)];
            cb.rcv_nxt = segment.header.seq_num + SeqNumber::from(1);
            cb.state = TcpState::TimeWait;
            cb.shut_remote = true;
            cb.ev_pending |= SocketEvents::PEER_FIN;
            cb.send_ack(now);
            cb.start_linger(now);
        },
        TcpState::LastAck | TcpState::Closing | TcpState::TimeWait => {
            let ack_num: SeqNumber = segment.header.ack_num;
            peer.sockets[usize::from(id)].send_rst_seq(ack_num, now);
        },
        _ => (),
    }
}

fn on_finack(peer: &mut TcpPeer, id: SocketId, segment: &Segment, now: Instant) {
    let state: TcpState = match peer.sockets.get(usize::from(id)) {
        Some(cb) if !cb.defunct => cb.state,
        _ => return,
    };
    match state {
        TcpState::SynRecv => {
            // The half-open peer is bailing out before we ever established.
            let cb: &mut ControlBlock = &mut peer.sockets[usize::from(id)];
            if segment.header.seq_num == cb.rcv_nxt {
                cb.rcv_nxt = cb.rcv_nxt + SeqNumber::from(1);
                cb.state = TcpState::CloseWait;
                cb.shut_remote = true;
                cb.shut_local = true;
                cb.ev_pending |= SocketEvents::PEER_FIN;
                // Nothing is queued this early; answer with our own FIN.
                cb.check_closing(now);
            }
        },
        TcpState::Established | TcpState::CloseWait => close_wait(peer, id, segment, now),
        TcpState::FinWait1 | TcpState::FinWait2 => {
            let cb: &mut ControlBlock = &mut peer.sockets[usize::from(id)];
            let echo: Option<u32> = cb.apply_options(&segment.header, false);
            cb.process_ack(&segment.header, 0, echo, now);
            cb.rcv_nxt = cb.rcv_nxt + SeqNumber::from(1);
            cb.send_ack(now);
            cb.state = TcpState::TimeWait;
            cb.shut_remote = true;
            cb.ev_pending |= SocketEvents::CLOSED;
            cb.start_linger(now);
        },
        TcpState::LastAck | TcpState::Closing => {
            let ack_num: SeqNumber = segment.header.ack_num;
            peer.sockets[usize::from(id)].send_rst_seq(ack_num, now);
        },
        _ => (),
    }
}

fn on_rst(peer: &mut TcpPeer, id: SocketId, segment: &Segment, now: Instant) {
    let state: TcpState = match peer.sockets.get(usize::from(id)) {
        Some(cb) if !cb.defunct => cb.state,
        _ => return,
    };
    let header: &TcpHeader = &segment.header;
    match state {
        TcpState::SynSent => {
            // Acceptable only if it acknowledges our SYN.
            let snd_nxt: SeqNumber = peer.sockets[usize::from(id)].snd_nxt;
            if snd_nxt + SeqNumber::from(1) == header.ack_num {
                peer.force_closed(id, now);
            } else {
                trace!("on_rst(): ignoring reset with bad ack");
            }
        },
        TcpState::Listen => (),
        _ => {
            // A reset is valid if its sequence number is in the window.
            let cb: &ControlBlock = &peer.sockets[usize::from(id)];
            let window_end: SeqNumber = cb.rcv_ackd + SeqNumber::from(cb.advertised_window_bytes());
            if header.seq_num >= cb.rcv_ackd && header.seq_num <= window_end {
                peer.force_closed(id, now);
            } else {
                trace!("on_rst(): ignoring out-of-window reset");
            }
        },
    }
}

/// The standard acknowledgment path shared by the synchronized states.
fn process_ack_for(peer: &mut TcpPeer, id: SocketId, segment: &Segment, now: Instant) {
    let cb: &mut ControlBlock = &mut peer.sockets[usize::from(id)];
    let echo: Option<u32> = cb.apply_options(&segment.header, false);
    cb.process_ack(&segment.header, segment.payload.len(), echo, now);
}

/// FIN processing for ESTABLISHED and CLOSE-WAIT: acknowledge what rode
/// along, consume the FIN if it is the next expected byte and all data has
/// been delivered to the application, and confirm with an ACK.
fn close_wait(peer: &mut TcpPeer, id: SocketId, segment: &Segment, now: Instant) {
    let header: &TcpHeader = &segment.header;
    let cb: &mut ControlBlock = &mut peer.sockets[usize::from(id)];

    if header.ack {
        let echo: Option<u32> = cb.apply_options(header, false);
        cb.process_ack(header, 0, echo, now);
    }

    if header.seq_num == cb.rcv_nxt {
        cb.rcv_nxt = cb.rcv_nxt + SeqNumber::from(1);
        if header.seq_num == cb.rcv_processed {
            if cb.state == TcpState::Established {
                cb.state = TcpState::CloseWait;
            }
            cb.shut_remote = true;
            cb.ev_pending |= SocketEvents::PEER_FIN;
        } else {
            // The FIN outran undelivered data; surface it once the
            // application catches up.
            cb.remote_fin_pending = true;
        }
    }

    if matches!(cb.state, TcpState::CloseWait | TcpState::Established) {
        cb.send_ack(now);
    }
}
