// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// Congestion control and acknowledgment processing.
//
// Slow start and congestion avoidance are unit-based: `cwnd`, `ssthresh`
// and `in_flight` count segments. Loss response is driven by the transmit
// mode, which steps one state per consecutive duplicate ACK and falls to
// blackout on a retransmission timeout.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::protocols::tcp::{
    ctrlblk::{
        ControlBlock,
        SocketEvents,
        TransmitMode,
    },
    header::TcpHeader,
    SeqNumber,
    INITIAL_WINDOW,
};
use ::std::time::Instant;

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl ControlBlock {
    /// Window growth on a fresh acknowledgment: one unit per ACK below
    /// `ssthresh`, one unit per `cwnd` ACKs above it. Skipped while in any
    /// loss-response mode.
    pub fn congestion_control(&mut self) {
        if self.mode > TransmitMode::Lookahead {
            return;
        }
        if self.cwnd < self.ssthresh {
            self.cwnd += 1;
        } else {
            self.cwnd_counter += 1;
            if self.cwnd_counter >= self.cwnd {
                self.cwnd += 1;
                self.cwnd_counter = 0;
            }
        }
        trace!(
            "congestion_control(): cwnd={} ssthresh={} in_flight={}",
            self.cwnd,
            self.ssthresh,
            self.in_flight
        );
    }

    /// Processes the acknowledgment carried by an inbound segment: prunes
    /// the output store, samples the RTT, runs duplicate-ACK detection and
    /// recovery, grows the window, flushes Nagle-held data, and re-opens the
    /// output scheduler. Returns the number of segments acknowledged.
    ///
    /// Mirrors the shape of the RFC 793 / RFC 2988 ACK algorithm; `ts_echo`
    /// is the peer's timestamp echo when the option is negotiated.
    pub fn process_ack(&mut self, header: &TcpHeader, payload_len: usize, ts_echo: Option<u32>, now: Instant) -> u32 {
        let ack_num: SeqNumber = header.ack_num;

        // The advertised window rides on every ACK.
        self.recv_wnd = header.window_size;

        let (acked, acked_timestamp): (u32, Option<Instant>) = self.outq.release_all_until(ack_num);
        let una: Option<SeqNumber> = self.outq.first().map(|segment| segment.seq);
        self.ack_timestamp = now;

        // Leave blackout as soon as the peer talks to us again, and leave
        // window-full once the advertised window can hold a full segment.
        if self.mode == TransmitMode::Blackout
            || (self.mode == TransmitMode::WindowFull && self.peer_window_bytes() > self.mss as u32)
        {
            let prev_mode: TransmitMode = self.mode;
            debug!("process_ack(): re-entering lookahead from {:?}", prev_mode);
            self.mode = TransmitMode::Lookahead;
            self.backoff = 0;
            if prev_mode == TransmitMode::Blackout && acked > 0 {
                if let Some(una) = una {
                    self.snd_nxt = una;
                    // Any armed retransmission deadline refers to the old
                    // cursor; let the fire re-arm from scratch.
                    self.retrans_due = None;
                }
            }
        }

        // A pure ACK that acknowledges nothing still confirms that one probe
        // or retransmission left the network.
        if acked == 0 && payload_len == 0 && self.in_flight > 0 {
            self.in_flight -= 1;
        }

        let is_pure_ack: bool = !header.psh && !header.syn && payload_len == 0;

        if una.is_none() || acked > 0 {
            // Fresh acknowledgment.
            self.mode = TransmitMode::Lookahead;
            self.backoff = 0;

            // RTT sampling: the timestamp echo when negotiated, otherwise a
            // conservative estimate off the segment that ended exactly at
            // the acknowledged byte.
            if let Some(echo) = ts_echo {
                let rtt: u32 = self.now_ms(now).wrapping_sub(echo);
                self.rto.add_sample(rtt);
            } else if let Some(sent_at) = acked_timestamp {
                let rtt: u32 = now.duration_since(sent_at).as_millis() as u32;
                self.rto.add_sample(rtt);
            }

            self.in_flight = self.in_flight.saturating_sub(acked);
            trace!(
                "process_ack(): fresh ack {} (acked {} segments, in_flight {})",
                ack_num,
                acked,
                self.in_flight
            );
        } else if self.snd_old_ack == ack_num && is_pure_ack && ack_num != self.snd_nxt {
            // Duplicate ACK while data is outstanding.
            self.on_duplicate_ack(now);
        }

        // A pure ACK of everything sent, carrying an old sequence number, is
        // a zero-window probe; answer it immediately.
        if is_pure_ack && ack_num == self.snd_nxt && header.seq_num < self.rcv_nxt {
            self.send_ack(now);
        }

        self.congestion_control();

        if acked > 0 && self.outq.size() < self.outq.max_size() {
            self.ev_pending |= SocketEvents::WRITABLE;
        }

        // With Nagle on, acknowledged space may let held writes coalesce out.
        if self.nagle {
            self.flush_hold_queue();
        }

        // If room opened up, put a few segments out.
        if self.mode == TransmitMode::Lookahead && self.cwnd >= self.in_flight && self.snd_nxt > self.snd_last_out {
            self.transmit_pending(now);
        }

        if self.outq.is_empty() {
            self.retrans_due = None;
        } else {
            self.arm_retransmit(None, now);
        }
        self.snd_old_ack = ack_num;
        acked
    }

    /// Steps the duplicate-ACK ladder: two consecutive duplicates enter
    /// recovery (seeding `cwnd` from the flight size and halving
    /// `ssthresh`); further duplicates drive retransmission of the lost
    /// segment, skipping anything already selectively acknowledged.
    fn on_duplicate_ack(&mut self, now: Instant) {
        if self.mode < TransmitMode::Recover {
            self.mode = match self.mode {
                TransmitMode::Lookahead => TransmitMode::FirstDupAck,
                TransmitMode::FirstDupAck => TransmitMode::SecondDupAck,
                _ => TransmitMode::Recover,
            };
            debug!("on_duplicate_ack(): mode now {:?}", self.mode);
            if self.mode == TransmitMode::Recover {
                self.cwnd = self.in_flight.max(INITIAL_WINDOW);
                if let Some(first) = self.outq.first() {
                    self.snd_retry = first.seq;
                }
                if self.ssthresh > self.cwnd {
                    self.ssthresh >>= 2;
                } else {
                    self.ssthresh = self.cwnd >> 1;
                }
                if self.ssthresh < 2 {
                    self.ssthresh = 2;
                }
                debug!(
                    "on_duplicate_ack(): entering recovery, cwnd={} ssthresh={}",
                    self.cwnd, self.ssthresh
                );
            }
        } else if self.mode == TransmitMode::Recover {
            if self.in_flight <= self.cwnd {
                self.recovery_retransmit(now);
            }
            // Recovery deflates the window slowly while duplicates keep
            // arriving.
            self.cwnd_counter += 1;
            if self.cwnd_counter > 1 {
                self.cwnd = (self.cwnd - 1).max(2);
                self.cwnd_counter = 0;
            }
        } else {
            debug!("on_duplicate_ack(): duplicate in mode {:?}", self.mode);
        }
    }

    /// Retransmits the segment at the recovery cursor and advances the
    /// cursor past selectively-acknowledged segments.
    fn recovery_retransmit(&mut self, now: Instant) {
        let first_seq: Option<SeqNumber> = self.outq.first().map(|segment| segment.seq);
        let Some(first_seq) = first_seq else {
            return;
        };

        // Pick the next retransmission candidate, skipping sacked segments.
        let mut candidate: Option<SeqNumber> = None;
        {
            let mut cursor = self.outq.find(self.snd_retry).or_else(|| self.outq.first());
            while let Some(segment) = cursor {
                if !segment.sacked || segment.seq == first_seq {
                    candidate = Some(segment.seq);
                    break;
                }
                trace!("recovery_retransmit(): skipping sacked segment {}", segment.seq);
                cursor = self.outq.next(segment);
            }
        }
        let candidate: SeqNumber = match candidate {
            Some(seq) if seq > self.snd_nxt => first_seq,
            Some(seq) if seq.offset_from(first_seq) > self.peer_window_bytes() => first_seq,
            Some(seq) => seq,
            None => first_seq,
        };

        self.retransmit_one(self.snd_retry, now);
        self.snd_retry = candidate;
    }
}
