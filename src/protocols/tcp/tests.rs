// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// Engine-to-engine tests: two peers wired back to back through their frame
// queues, driven by an explicit clock.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::frame_queue::{
        QueuePair,
        SharedFrameQueue,
    },
    protocols::tcp::{
        ctrlblk::{
            SocketEvents,
            TransmitMode,
        },
        fsm::TcpState,
        header::{
            SackRange,
            TcpHeader,
            TcpOption,
        },
        peer::{
            SocketOption,
            TcpPeer,
        },
        SeqNumber,
        MAX_RETRANS,
    },
    runtime::{
        config::TcpConfig,
        memory::{
            Buffer,
            Frame,
        },
        SocketId,
    },
};
use ::anyhow::Result;
use ::std::{
    net::{
        Ipv4Addr,
        SocketAddrV4,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Test Rig
//======================================================================================================================

const ADDR_A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const ADDR_B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const LISTEN_PORT: u16 = 80;

struct TestRig {
    a: TcpPeer,
    b: TcpPeer,
    /// Frames traveling from A to B.
    ab: SharedFrameQueue,
    /// Frames traveling from B to A.
    ba: SharedFrameQueue,
    now: Instant,
}

impl TestRig {
    fn new() -> Self {
        Self::with_config(TcpConfig::default())
    }

    fn with_config(config: TcpConfig) -> Self {
        let ab: SharedFrameQueue = SharedFrameQueue::new(512, 1 << 20, 0);
        let ba: SharedFrameQueue = SharedFrameQueue::new(512, 1 << 20, 0);
        let now: Instant = Instant::now();
        let a: TcpPeer = TcpPeer::new(
            ADDR_A,
            config.clone(),
            QueuePair {
                incoming: ba.clone(),
                outgoing: ab.clone(),
            },
            7,
            now,
        );
        let b: TcpPeer = TcpPeer::new(
            ADDR_B,
            config,
            QueuePair {
                incoming: ab.clone(),
                outgoing: ba.clone(),
            },
            11,
            now,
        );
        Self { a, b, ab, ba, now }
    }

    fn advance(&mut self, millis: u64) {
        self.now += Duration::from_millis(millis);
    }

    /// Opens, binds and connects a client on A against a listener on B, and
    /// runs the three-way handshake to completion.
    fn establish(&mut self) -> Result<(SocketId, SocketId, SocketId)> {
        let listener: SocketId = self.b.open()?;
        self.b.bind(listener, SocketAddrV4::new(ADDR_B, LISTEN_PORT))?;
        self.b.listen(listener, 4)?;

        let client: SocketId = self.a.open()?;
        self.a.connect(client, SocketAddrV4::new(ADDR_B, LISTEN_PORT))?;

        self.b.poll(self.now); // SYN in, SYN-ACK out.
        self.a.poll(self.now); // SYN-ACK in, ACK out, client established.
        self.b.poll(self.now); // ACK in, child established.

        let child: SocketId = self.b.accept(listener)?;
        Ok((client, child, listener))
    }

    fn drain(queue: &SharedFrameQueue) -> Vec<Frame> {
        let mut frames: Vec<Frame> = Vec::new();
        while let Some(frame) = queue.dequeue() {
            frames.push(frame);
        }
        frames
    }

    /// Parses a captured A->B or B->A frame back into header and payload.
    fn parse(frame: &Frame) -> Result<(TcpHeader, Buffer)> {
        match TcpHeader::parse(&frame.src_addr, &frame.dst_addr, frame.body.clone()) {
            Ok(parsed) => Ok(parsed),
            Err(e) => anyhow::bail!("failed to parse frame: {:?}", e),
        }
    }

    /// Forges a checksummed segment from B towards the client on A.
    fn forge_to_a(&mut self, client: SocketId, build: impl FnOnce(&mut TcpHeader)) -> Result<()> {
        let client_port: u16 = self.a.inspect(client)?.local.port();
        let mut header: TcpHeader = TcpHeader::new(LISTEN_PORT, client_port);
        build(&mut header);
        let size: usize = header.compute_size();
        let mut body: Buffer = Buffer::new(size);
        header.serialize(&mut body[..], &ADDR_B, &ADDR_A, &[]);
        self.ba
            .enqueue(Frame::new(ADDR_B, ADDR_A, body))
            .map_err(|e| anyhow::anyhow!("enqueue failed: {:?}", e))
    }
}

fn events_for(events: &[(SocketId, SocketEvents)], id: SocketId) -> SocketEvents {
    events
        .iter()
        .filter(|(sid, _)| *sid == id)
        .fold(SocketEvents::none(), |acc, (_, ev)| acc | *ev)
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

/// A SYN to a listener with backlog room clones a half-open connection and
/// answers with exactly one SYN-ACK.
#[test]
fn listen_syn_spawns_half_open_connection() -> Result<()> {
    let mut rig: TestRig = TestRig::new();

    let listener: SocketId = rig.b.open()?;
    rig.b.bind(listener, SocketAddrV4::new(ADDR_B, LISTEN_PORT))?;
    rig.b.listen(listener, 1)?;

    let client: SocketId = rig.a.open()?;
    rig.a.connect(client, SocketAddrV4::new(ADDR_B, LISTEN_PORT))?;
    crate::ensure_eq!(rig.ab.frames(), 1);

    rig.b.poll(rig.now);
    crate::ensure_eq!(rig.ba.frames(), 1);

    let frames: Vec<Frame> = TestRig::drain(&rig.ba);
    let (header, payload) = TestRig::parse(&frames[0])?;
    crate::ensure_eq!(header.syn, true);
    crate::ensure_eq!(header.ack, true);
    crate::ensure_eq!(payload.len(), 0);

    // The cloned connection sits in SYN-RECV next to the listener.
    let child: SocketId = SocketId::from(1);
    crate::ensure_eq!(rig.b.inspect(child)?.state, TcpState::SynRecv);
    crate::ensure_eq!(rig.b.inspect(listener)?.state, TcpState::Listen);
    crate::ensure_eq!(rig.b.inspect(listener)?.pending_conn, 1);

    Ok(())
}

/// A SYN beyond the backlog is dropped without a reply.
#[test]
fn listen_backlog_limits_pending_connections() -> Result<()> {
    let mut rig: TestRig = TestRig::new();

    let listener: SocketId = rig.b.open()?;
    rig.b.bind(listener, SocketAddrV4::new(ADDR_B, LISTEN_PORT))?;
    rig.b.listen(listener, 1)?;

    let first: SocketId = rig.a.open()?;
    rig.a.connect(first, SocketAddrV4::new(ADDR_B, LISTEN_PORT))?;
    let second: SocketId = rig.a.open()?;
    rig.a.connect(second, SocketAddrV4::new(ADDR_B, LISTEN_PORT))?;

    rig.b.poll(rig.now);
    // One SYN-ACK for the first SYN; the second SYN died on the backlog.
    crate::ensure_eq!(rig.ba.frames(), 1);
    crate::ensure_eq!(rig.b.inspect(listener)?.pending_conn, 1);

    Ok(())
}

/// Full three-way handshake: both sides establish, the application is told.
#[test]
fn handshake_establishes_both_sides() -> Result<()> {
    let mut rig: TestRig = TestRig::new();
    let (client, child, listener) = rig.establish()?;

    crate::ensure_eq!(rig.a.inspect(client)?.state, TcpState::Established);
    crate::ensure_eq!(rig.b.inspect(child)?.state, TcpState::Established);

    let a_events = rig.a.poll_events();
    crate::ensure_eq!(events_for(&a_events, client).contains(SocketEvents::CONNECTED), true);
    let b_events = rig.b.poll_events();
    crate::ensure_eq!(events_for(&b_events, listener).contains(SocketEvents::CONNECTED), true);

    // MSS, SACK and timestamps all negotiated through the SYN exchange.
    crate::ensure_eq!(rig.a.inspect(client)?.sack_ok, true);
    crate::ensure_eq!(rig.b.inspect(child)?.sack_ok, true);
    crate::ensure_eq!(rig.a.inspect(client)?.ts_ok, true);
    crate::ensure_eq!(rig.a.inspect(client)?.mss_ok, true);

    Ok(())
}

/// Data flows both ways and is acknowledged.
#[test]
fn send_and_recv_roundtrip() -> Result<()> {
    let mut rig: TestRig = TestRig::new();
    let (client, child, _) = rig.establish()?;

    crate::ensure_eq!(rig.a.send(client, b"hello from a")?, 12);
    rig.b.poll(rig.now);

    let mut buf: [u8; 64] = [0; 64];
    crate::ensure_eq!(rig.b.recv(child, &mut buf)?, 12);
    crate::ensure_eq!(&buf[..12], b"hello from a");

    crate::ensure_eq!(rig.b.send(child, b"hello from b")?, 12);
    rig.a.poll(rig.now);
    crate::ensure_eq!(rig.a.recv(client, &mut buf)?, 12);
    crate::ensure_eq!(&buf[..12], b"hello from b");

    // Both sides have seen each other's ACKs and carry no flight.
    rig.b.poll(rig.now);
    crate::ensure_eq!(rig.a.inspect(client)?.in_flight, 0);

    // Nothing more to read.
    crate::ensure_eq!(rig.a.recv(client, &mut buf).is_err(), true);

    Ok(())
}

/// A fresh acknowledgment of everything in flight drops `in_flight` back to
/// zero and returns the sender to look-ahead mode.
#[test]
fn fresh_ack_returns_to_lookahead() -> Result<()> {
    let mut rig: TestRig = TestRig::new();
    let (client, _child, _) = rig.establish()?;

    let data: Vec<u8> = vec![0xAA; 2920];
    crate::ensure_eq!(rig.a.send(client, &data)?, 2920);
    crate::ensure_eq!(rig.a.inspect(client)?.in_flight, 2);

    rig.b.poll(rig.now); // Receive both segments, ACK them.
    rig.a.poll(rig.now); // Process the ACKs.

    crate::ensure_eq!(rig.a.inspect(client)?.in_flight, 0);
    crate::ensure_eq!(rig.a.inspect(client)?.mode, TransmitMode::Lookahead);
    crate::ensure_eq!(rig.a.inspect(client)?.outq.is_empty(), true);

    Ok(())
}

/// Three consecutive duplicate pure ACKs walk the transmit mode through
/// first-dup, second-dup and into recovery, with `ssthresh` floored at 2.
#[test]
fn duplicate_acks_enter_recovery() -> Result<()> {
    let mut rig: TestRig = TestRig::new();
    let (client, _child, _) = rig.establish()?;
    TestRig::drain(&rig.ab);
    TestRig::drain(&rig.ba);

    let data: Vec<u8> = vec![0xBB; 2920];
    crate::ensure_eq!(rig.a.send(client, &data)?, 2920);
    crate::ensure_eq!(rig.a.inspect(client)?.in_flight, 2);
    TestRig::drain(&rig.ab); // The two data segments vanish into the void.

    let snd_una: SeqNumber = rig.a.inspect(client)?.outq.first().unwrap().seq;
    let rcv_nxt: SeqNumber = rig.a.inspect(client)?.rcv_nxt;

    let expected: [TransmitMode; 3] = [
        TransmitMode::FirstDupAck,
        TransmitMode::SecondDupAck,
        TransmitMode::Recover,
    ];
    for mode in expected {
        rig.forge_to_a(client, |header| {
            header.ack = true;
            header.ack_num = snd_una;
            header.seq_num = rcv_nxt;
            header.window_size = 0xffff;
        })?;
        rig.a.poll(rig.now);
        crate::ensure_eq!(rig.a.inspect(client)?.mode, mode);
    }

    crate::ensure_eq!(rig.a.inspect(client)?.ssthresh, 2);

    Ok(())
}

/// Segments marked by a SACK block are skipped by the recovery
/// retransmission; a later cumulative ACK releases everything.
#[test]
fn sack_marks_survive_until_release() -> Result<()> {
    let mut rig: TestRig = TestRig::new();
    let (client, _child, _) = rig.establish()?;
    TestRig::drain(&rig.ab);
    TestRig::drain(&rig.ba);

    let data: Vec<u8> = vec![0xCC; 4380];
    crate::ensure_eq!(rig.a.send(client, &data)?, 4380);
    crate::ensure_eq!(rig.a.inspect(client)?.in_flight, 3);
    TestRig::drain(&rig.ab);

    let first_seq: SeqNumber = rig.a.inspect(client)?.outq.first().unwrap().seq;
    let second_seq: SeqNumber = first_seq + SeqNumber::from(1460);
    let end_seq: SeqNumber = first_seq + SeqNumber::from(4380);
    let rcv_nxt: SeqNumber = rig.a.inspect(client)?.rcv_nxt;

    // Four duplicate ACKs, each selectively acknowledging segments 2 and 3:
    // three to reach recovery, one more to drive the retransmission.
    for _ in 0..4 {
        rig.forge_to_a(client, |header| {
            header.ack = true;
            header.ack_num = first_seq;
            header.seq_num = rcv_nxt;
            header.window_size = 0xffff;
            let mut blocks: arrayvec::ArrayVec<SackRange, 4> = arrayvec::ArrayVec::new();
            blocks.push(SackRange {
                begin: second_seq,
                end: end_seq,
            });
            header.options.push(TcpOption::SackBlocks(blocks));
        })?;
        rig.a.poll(rig.now);
    }

    crate::ensure_eq!(rig.a.inspect(client)?.mode, TransmitMode::Recover);

    // Only the unsacked head was retransmitted.
    let frames: Vec<Frame> = TestRig::drain(&rig.ab);
    let mut data_frames: usize = 0;
    for frame in &frames {
        let (header, payload) = TestRig::parse(frame)?;
        if !payload.is_empty() {
            crate::ensure_eq!(header.seq_num, first_seq);
            data_frames += 1;
        }
    }
    crate::ensure_eq!(data_frames, 1);
    crate::ensure_eq!(rig.a.inspect(client)?.outq.find(second_seq).unwrap().sacked, true);

    // A cumulative ACK of the whole range releases every segment, sacked or
    // not.
    rig.forge_to_a(client, |header| {
        header.ack = true;
        header.ack_num = end_seq;
        header.seq_num = rcv_nxt;
        header.window_size = 0xffff;
    })?;
    rig.a.poll(rig.now);
    crate::ensure_eq!(rig.a.inspect(client)?.outq.is_empty(), true);
    crate::ensure_eq!(rig.a.inspect(client)?.mode, TransmitMode::Lookahead);

    Ok(())
}

/// Nagle: an idle connection sends the first MSS worth of a write
/// immediately; the remainder and any further small writes are held until
/// the outstanding data is acknowledged.
#[test]
fn nagle_holds_small_writes() -> Result<()> {
    let mut rig: TestRig = TestRig::new();

    let listener: SocketId = rig.b.open()?;
    rig.b.bind(listener, SocketAddrV4::new(ADDR_B, LISTEN_PORT))?;
    rig.b.listen(listener, 4)?;

    let client: SocketId = rig.a.open()?;
    rig.a.set_option(client, SocketOption::NoDelay(false))?;
    rig.a.connect(client, SocketAddrV4::new(ADDR_B, LISTEN_PORT))?;
    rig.b.poll(rig.now);
    rig.a.poll(rig.now);
    rig.b.poll(rig.now);
    let child: SocketId = rig.b.accept(listener)?;
    TestRig::drain(&rig.ab);
    TestRig::drain(&rig.ba);

    // 2000 bytes: one full MSS goes out, 540 bytes stay held.
    let data: Vec<u8> = vec![0xDD; 2000];
    crate::ensure_eq!(rig.a.send(client, &data)?, 2000);
    let frames: Vec<Frame> = TestRig::drain(&rig.ab);
    crate::ensure_eq!(frames.len(), 1);
    let (_, payload) = TestRig::parse(&frames[0])?;
    crate::ensure_eq!(payload.len(), 1460);
    crate::ensure_eq!(rig.a.inspect(client)?.holdq.size(), 540);

    // A second small write accumulates in the hold store, nothing emitted.
    crate::ensure_eq!(rig.a.send(client, &[1u8; 100])?, 100);
    crate::ensure_eq!(rig.ab.frames(), 0);
    crate::ensure_eq!(rig.a.inspect(client)?.holdq.size(), 640);

    // Deliver the first segment to B so its ACK releases the hold store.
    for frame in frames {
        rig.ab
            .enqueue(frame)
            .map_err(|e| anyhow::anyhow!("enqueue failed: {:?}", e))?;
    }
    rig.b.poll(rig.now);
    rig.a.poll(rig.now);

    let frames: Vec<Frame> = TestRig::drain(&rig.ab);
    crate::ensure_eq!(frames.len(), 1);
    let (_, payload) = TestRig::parse(&frames[0])?;
    crate::ensure_eq!(payload.len(), 640);
    crate::ensure_eq!(rig.a.inspect(client)?.holdq.is_empty(), true);

    // B eventually reads the whole stream in order.
    rig.b.poll(rig.now);
    let mut buf: Vec<u8> = vec![0; 4096];
    let mut total: usize = 0;
    while let Ok(read) = rig.b.recv(child, &mut buf[total..]) {
        total += read;
    }
    crate::ensure_eq!(total, 2100);

    Ok(())
}

/// A zero peer window parks the sender in window-full mode: no data frames,
/// periodic one-byte probes backed off exponentially.
#[test]
fn zero_window_probes() -> Result<()> {
    let mut rig: TestRig = TestRig::new();
    let (client, _child, _) = rig.establish()?;
    TestRig::drain(&rig.ab);
    TestRig::drain(&rig.ba);

    let snd_nxt: SeqNumber = rig.a.inspect(client)?.snd_nxt;
    let rcv_nxt: SeqNumber = rig.a.inspect(client)?.rcv_nxt;

    // The peer advertises a closed window.
    rig.forge_to_a(client, |header| {
        header.ack = true;
        header.ack_num = snd_nxt;
        header.seq_num = rcv_nxt;
        header.window_size = 0;
    })?;
    rig.a.poll(rig.now);
    crate::ensure_eq!(rig.a.inspect(client)?.peer_window_bytes(), 0);

    // A write queues but nothing is transmitted.
    crate::ensure_eq!(rig.a.send(client, &[2u8; 100])?, 100);
    rig.a.poll(rig.now);
    crate::ensure_eq!(rig.a.inspect(client)?.mode, TransmitMode::WindowFull);
    crate::ensure_eq!(rig.ab.frames(), 0);

    // The probe fires after one RTO and escalates the backoff.
    rig.advance(100);
    rig.a.poll(rig.now);
    let frames: Vec<Frame> = TestRig::drain(&rig.ab);
    crate::ensure_eq!(frames.len(), 1);
    let (header, payload) = TestRig::parse(&frames[0])?;
    crate::ensure_eq!(payload.len(), 0);
    crate::ensure_eq!(header.seq_num, snd_nxt - SeqNumber::from(1));
    crate::ensure_eq!(rig.a.inspect(client)?.backoff, 1);

    // Second probe arrives one doubled RTO later.
    rig.advance(200);
    rig.a.poll(rig.now);
    crate::ensure_eq!(rig.ab.frames(), 1);
    crate::ensure_eq!(rig.a.inspect(client)?.backoff, 2);
    TestRig::drain(&rig.ab);

    // Re-opening the window releases the real data.
    rig.forge_to_a(client, |header| {
        header.ack = true;
        header.ack_num = snd_nxt;
        header.seq_num = rcv_nxt;
        header.window_size = 0xffff;
    })?;
    rig.a.poll(rig.now);
    crate::ensure_eq!(rig.a.inspect(client)?.mode, TransmitMode::Lookahead);
    let frames: Vec<Frame> = TestRig::drain(&rig.ab);
    let mut sent_data: usize = 0;
    for frame in &frames {
        let (_, payload) = TestRig::parse(frame)?;
        sent_data += payload.len();
    }
    crate::ensure_eq!(sent_data, 100);

    Ok(())
}

/// Repeated timeouts with no acknowledgment escalate the backoff until the
/// ceiling, then the connection is torn down exactly once.
#[test]
fn retransmission_backoff_until_abandon() -> Result<()> {
    let mut rig: TestRig = TestRig::new();
    let (client, _child, _) = rig.establish()?;
    TestRig::drain(&rig.ab);
    TestRig::drain(&rig.ba);

    crate::ensure_eq!(rig.a.send(client, &[3u8; 64])?, 64);
    TestRig::drain(&rig.ab);

    let mut last_backoff: u32 = 0;
    for _ in 0..MAX_RETRANS {
        rig.advance(130_000);
        rig.a.poll(rig.now);
        let backoff: u32 = rig.a.inspect(client)?.backoff;
        crate::ensure_eq!(backoff > last_backoff, true);
        last_backoff = backoff;
    }
    crate::ensure_eq!(last_backoff, MAX_RETRANS);

    // The next fire crosses the ceiling: torn down, reported once.
    rig.advance(130_000);
    rig.a.poll(rig.now);
    let events = rig.a.poll_events();
    crate::ensure_eq!(events_for(&events, client).contains(SocketEvents::CLOSED), true);
    crate::ensure_eq!(rig.a.send(client, &[0u8; 1]).is_err(), true);

    // No further notification ever arrives.
    rig.advance(130_000);
    rig.a.poll(rig.now);
    crate::ensure_eq!(rig.a.poll_events().is_empty(), true);

    Ok(())
}

/// Orderly bidirectional close: FIN/ACK exchange walks both sides down, the
/// passive closer is released on the last ACK and the active closer leaves
/// TIME-WAIT through the linger timer.
#[test]
fn orderly_close_both_sides() -> Result<()> {
    let mut rig: TestRig = TestRig::new();
    let (client, child, _) = rig.establish()?;

    rig.a.close(client)?;
    crate::ensure_eq!(rig.a.inspect(client)?.state, TcpState::FinWait1);

    rig.b.poll(rig.now); // FIN in: CLOSE-WAIT, ACK out.
    crate::ensure_eq!(rig.b.inspect(child)?.state, TcpState::CloseWait);
    let b_events = rig.b.poll_events();
    crate::ensure_eq!(events_for(&b_events, child).contains(SocketEvents::PEER_FIN), true);

    rig.a.poll(rig.now); // ACK of our FIN: FIN-WAIT-2.
    crate::ensure_eq!(rig.a.inspect(client)?.state, TcpState::FinWait2);

    rig.b.close(child)?; // Passive side closes: FIN out, LAST-ACK.
    crate::ensure_eq!(rig.b.inspect(child)?.state, TcpState::LastAck);

    rig.a.poll(rig.now); // FIN in: TIME-WAIT, final ACK out.
    crate::ensure_eq!(rig.a.inspect(client)?.state, TcpState::TimeWait);
    let a_events = rig.a.poll_events();
    crate::ensure_eq!(events_for(&a_events, client).contains(SocketEvents::CLOSED), true);

    rig.b.poll(rig.now); // Final ACK: LAST-ACK socket is gone.
    let b_events = rig.b.poll_events();
    crate::ensure_eq!(events_for(&b_events, child).contains(SocketEvents::CLOSED), true);
    crate::ensure_eq!(rig.b.recv(child, &mut [0u8; 8]).is_err(), true);

    // TIME-WAIT expires through the linger timer without another event.
    rig.advance(3_500);
    rig.a.poll(rig.now);
    crate::ensure_eq!(rig.a.poll_events().is_empty(), true);
    crate::ensure_eq!(rig.a.recv(client, &mut [0u8; 8]).is_err(), true);

    Ok(())
}

/// A validated inbound reset on an established connection flips it to
/// CLOSED and reports it once; mid-handshake it is an error.
#[test]
fn reset_tears_connection_down() -> Result<()> {
    let mut rig: TestRig = TestRig::new();
    let (client, _child, _) = rig.establish()?;
    TestRig::drain(&rig.ab);
    TestRig::drain(&rig.ba);

    let rcv_ackd: SeqNumber = rig.a.inspect(client)?.rcv_ackd;
    rig.forge_to_a(client, |header| {
        header.rst = true;
        header.seq_num = rcv_ackd;
    })?;
    rig.a.poll(rig.now);

    let events = rig.a.poll_events();
    crate::ensure_eq!(events_for(&events, client).contains(SocketEvents::CLOSED), true);
    crate::ensure_eq!(rig.a.inspect(client)?.state, TcpState::Closed);
    crate::ensure_eq!(rig.a.send(client, &[0u8; 1]).is_err(), true);

    Ok(())
}

/// An out-of-window reset is ignored.
#[test]
fn out_of_window_reset_is_ignored() -> Result<()> {
    let mut rig: TestRig = TestRig::new();
    let (client, _child, _) = rig.establish()?;

    let rcv_ackd: SeqNumber = rig.a.inspect(client)?.rcv_ackd;
    rig.forge_to_a(client, |header| {
        header.rst = true;
        header.seq_num = rcv_ackd - SeqNumber::from(100_000);
    })?;
    rig.a.poll(rig.now);

    crate::ensure_eq!(rig.a.inspect(client)?.state, TcpState::Established);

    Ok(())
}

/// A segment towards a port nobody listens on is answered with a reset.
#[test]
fn unknown_port_elicits_reset() -> Result<()> {
    let mut rig: TestRig = TestRig::new();

    let client: SocketId = rig.a.open()?;
    rig.a.connect(client, SocketAddrV4::new(ADDR_B, 9999))?;
    rig.b.poll(rig.now);

    let frames: Vec<Frame> = TestRig::drain(&rig.ba);
    crate::ensure_eq!(frames.len(), 1);
    let (header, _) = TestRig::parse(&frames[0])?;
    crate::ensure_eq!(header.rst, true);

    Ok(())
}

/// An unanswered connect retries its SYN and eventually reports an error.
#[test]
fn connect_retries_then_fails() -> Result<()> {
    let mut rig: TestRig = TestRig::new();

    let client: SocketId = rig.a.open()?;
    rig.a.connect(client, SocketAddrV4::new(ADDR_B, LISTEN_PORT))?;
    crate::ensure_eq!(rig.ab.frames(), 1);
    TestRig::drain(&rig.ab);

    // Each expiry of the handshake timer resends the SYN.
    rig.advance(2_100);
    rig.a.poll(rig.now);
    crate::ensure_eq!(rig.ab.frames(), 1);
    let (header, _) = TestRig::parse(&TestRig::drain(&rig.ab)[0])?;
    crate::ensure_eq!(header.syn, true);

    // Burn through the remaining retries.
    for _ in 0..8 {
        rig.advance(300_000);
        rig.a.poll(rig.now);
    }
    let events = rig.a.poll_events();
    crate::ensure_eq!(events_for(&events, client).contains(SocketEvents::ERROR), true);
    crate::ensure_eq!(rig.a.send(client, &[0u8; 1]).is_err(), true);

    Ok(())
}

/// Keepalive probes an idle connection and flags an error once the probe
/// budget is spent without any acknowledgment.
#[test]
fn keepalive_exhaustion_reports_error() -> Result<()> {
    let mut rig: TestRig = TestRig::new();
    let (client, _child, _) = rig.establish()?;
    rig.a.set_option(client, SocketOption::KeepAliveTime(Duration::from_secs(3)))?;
    rig.a.set_option(client, SocketOption::KeepAliveInterval(Duration::from_secs(1)))?;
    rig.a.set_option(client, SocketOption::KeepAliveProbes(2))?;
    TestRig::drain(&rig.ab);
    TestRig::drain(&rig.ba);
    rig.a.poll_events();

    let mut saw_error: bool = false;
    for _ in 0..10 {
        rig.advance(1_000);
        rig.a.poll(rig.now);
        let events = rig.a.poll_events();
        if events_for(&events, client).contains(SocketEvents::ERROR) {
            saw_error = true;
            break;
        }
    }
    crate::ensure_eq!(saw_error, true);

    // Probes went out before the give-up.
    let frames: Vec<Frame> = TestRig::drain(&rig.ab);
    crate::ensure_eq!(frames.len() >= 2, true);

    Ok(())
}

/// Out-of-order delivery reassembles through the input store and the reader
/// sees one contiguous stream.
#[test]
fn out_of_order_segments_reassemble() -> Result<()> {
    let mut rig: TestRig = TestRig::new();
    let (client, child, _) = rig.establish()?;
    TestRig::drain(&rig.ba);

    let data: Vec<u8> = (0..2920u32).map(|i| i as u8).collect();
    crate::ensure_eq!(rig.a.send(client, &data)?, 2920);

    // Swap the two data segments on the wire.
    let mut frames: Vec<Frame> = TestRig::drain(&rig.ab);
    crate::ensure_eq!(frames.len(), 2);
    frames.reverse();
    for frame in frames {
        rig.ab
            .enqueue(frame)
            .map_err(|e| anyhow::anyhow!("enqueue failed: {:?}", e))?;
    }
    rig.b.poll(rig.now);

    let mut buf: Vec<u8> = vec![0; 4096];
    let mut total: usize = 0;
    while let Ok(read) = rig.b.recv(child, &mut buf[total..]) {
        total += read;
    }
    crate::ensure_eq!(total, 2920);
    crate::ensure_eq!(&buf[..2920], &data[..]);

    // The receiver advertised the hole through a SACK while it lasted.
    let frames: Vec<Frame> = TestRig::drain(&rig.ba);
    let mut saw_sack: bool = false;
    for frame in &frames {
        let (header, _) = TestRig::parse(frame)?;
        for option in &header.options {
            if matches!(option, TcpOption::SackBlocks(_)) {
                saw_sack = true;
            }
        }
    }
    crate::ensure_eq!(saw_sack, true);

    Ok(())
}

/// Binding two sockets so that delivery would be ambiguous is refused.
#[test]
fn ambiguous_bind_is_rejected() -> Result<()> {
    let mut rig: TestRig = TestRig::new();

    let first: SocketId = rig.b.open()?;
    rig.b.bind(first, SocketAddrV4::new(ADDR_B, LISTEN_PORT))?;

    let second: SocketId = rig.b.open()?;
    crate::ensure_eq!(
        rig.b.bind(second, SocketAddrV4::new(ADDR_B, LISTEN_PORT)).is_err(),
        true
    );
    let third: SocketId = rig.b.open()?;
    crate::ensure_eq!(
        rig.b
            .bind(third, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, LISTEN_PORT))
            .is_err(),
        true
    );

    // A different port is fine.
    rig.b.bind(third, SocketAddrV4::new(ADDR_B, LISTEN_PORT + 1))?;

    Ok(())
}
