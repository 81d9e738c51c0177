// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    protocols::tcp::{
        SeqNumber,
        MAX_WIRE_SACK_BLOCKS,
    },
    runtime::{
        fail::Fail,
        memory::Buffer,
    },
};
use ::arrayvec::ArrayVec;
use ::libc::EBADMSG;
use ::std::{
    convert::TryInto,
    net::Ipv4Addr,
    slice::ChunksExact,
};

//======================================================================================================================
// Constants
//======================================================================================================================

pub const MIN_TCP_HEADER_SIZE: usize = 20;
pub const MAX_TCP_HEADER_SIZE: usize = 60;
pub const MAX_TCP_OPTIONS: usize = 5;

/// IPv4 protocol number for TCP, used in the pseudo-header.
const IPV4_PROTOCOL_TCP: u8 = 0x06;

/// Header flag bits (octet 13).
pub mod flags {
    pub const FIN: u8 = 1;
    pub const SYN: u8 = 1 << 1;
    pub const RST: u8 = 1 << 2;
    pub const PSH: u8 = 1 << 3;
    pub const ACK: u8 = 1 << 4;
    pub const URG: u8 = 1 << 5;
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// One selectively-acknowledged range: `begin` is received, `end` is the
/// first sequence number past the range.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SackRange {
    pub begin: SeqNumber,
    pub end: SeqNumber,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TcpOption {
    EndOfOptionsList,
    NoOperation,
    MaximumSegmentSize(u16),
    WindowScale(u8),
    SackPermitted,
    SackBlocks(ArrayVec<SackRange, MAX_WIRE_SACK_BLOCKS>),
    Timestamp {
        sender_timestamp: u32,
        echo_timestamp: u32,
    },
}

/// TCP header, wire layout per RFC 793:
/// source/destination port, sequence, ack, data-offset nibble, flags,
/// window, checksum, urgent pointer, then options padded to 32 bits.
#[derive(Clone, Debug)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_num: SeqNumber,
    pub ack_num: SeqNumber,

    // Octet 13: [ CWR ] [ ECE ] [ URG ] [ ACK ] [ PSH ] [ RST ] [ SYN ] [ FIN ]
    pub urg: bool,
    pub ack: bool,
    pub psh: bool,
    pub rst: bool,
    pub syn: bool,
    pub fin: bool,

    pub window_size: u16,
    // The checksum is verified when parsing and computed when serializing.
    pub urgent_pointer: u16,

    pub options: ArrayVec<TcpOption, MAX_TCP_OPTIONS>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl TcpOption {
    pub fn compute_size(&self) -> usize {
        match self {
            TcpOption::EndOfOptionsList => 1,
            TcpOption::NoOperation => 1,
            TcpOption::MaximumSegmentSize(..) => 4,
            TcpOption::WindowScale(..) => 3,
            TcpOption::SackPermitted => 2,
            TcpOption::SackBlocks(blocks) => 2 + 8 * blocks.len(),
            TcpOption::Timestamp { .. } => 10,
        }
    }

    fn serialize(&self, buf: &mut [u8]) -> usize {
        match self {
            TcpOption::EndOfOptionsList => {
                buf[0] = 0;
                1
            },
            TcpOption::NoOperation => {
                buf[0] = 1;
                1
            },
            TcpOption::MaximumSegmentSize(mss) => {
                buf[0] = 2;
                buf[1] = 4;
                buf[2..4].copy_from_slice(&mss.to_be_bytes());
                4
            },
            TcpOption::WindowScale(scale) => {
                buf[0] = 3;
                buf[1] = 3;
                buf[2] = *scale;
                3
            },
            TcpOption::SackPermitted => {
                buf[0] = 4;
                buf[1] = 2;
                2
            },
            TcpOption::SackBlocks(blocks) => {
                buf[0] = 5;
                buf[1] = 2 + 8 * blocks.len() as u8;
                for (i, block) in blocks.iter().enumerate() {
                    buf[(2 + 8 * i)..(6 + 8 * i)].copy_from_slice(&u32::from(block.begin).to_be_bytes());
                    buf[(6 + 8 * i)..(10 + 8 * i)].copy_from_slice(&u32::from(block.end).to_be_bytes());
                }
                2 + 8 * blocks.len()
            },
            TcpOption::Timestamp {
                sender_timestamp,
                echo_timestamp,
            } => {
                buf[0] = 8;
                buf[1] = 10;
                buf[2..6].copy_from_slice(&sender_timestamp.to_be_bytes());
                buf[6..10].copy_from_slice(&echo_timestamp.to_be_bytes());
                10
            },
        }
    }
}

impl TcpHeader {
    pub fn new(src_port: u16, dst_port: u16) -> Self {
        Self {
            src_port,
            dst_port,
            seq_num: SeqNumber::from(0),
            ack_num: SeqNumber::from(0),
            urg: false,
            ack: false,
            psh: false,
            rst: false,
            syn: false,
            fin: false,
            window_size: 0,
            urgent_pointer: 0,
            options: ArrayVec::new(),
        }
    }

    /// The flag bits of octet 13 that the state machine classifies on.
    pub fn flag_bits(&self) -> u8 {
        let mut bits: u8 = 0;
        if self.fin {
            bits |= flags::FIN;
        }
        if self.syn {
            bits |= flags::SYN;
        }
        if self.rst {
            bits |= flags::RST;
        }
        if self.psh {
            bits |= flags::PSH;
        }
        if self.ack {
            bits |= flags::ACK;
        }
        if self.urg {
            bits |= flags::URG;
        }
        bits
    }

    /// Parses a header off the front of `buf`, returning it together with
    /// the remaining payload.
    ///
    /// Option anomalies are tolerated: an option whose declared length does
    /// not match the fixed length for its kind, or an unknown kind, causes
    /// the parser to skip exactly the declared length and continue.
    pub fn parse(src_addr: &Ipv4Addr, dst_addr: &Ipv4Addr, mut buf: Buffer) -> Result<(Self, Buffer), Fail> {
        if buf.len() < MIN_TCP_HEADER_SIZE {
            return Err(Fail::new(EBADMSG, "TCP segment too small"));
        }
        let data_offset: usize = (buf[12] >> 4) as usize * 4;
        if buf.len() < data_offset {
            return Err(Fail::new(EBADMSG, "TCP segment smaller than data offset"));
        }
        if data_offset < MIN_TCP_HEADER_SIZE {
            return Err(Fail::new(EBADMSG, "TCP data offset too small"));
        }
        if data_offset > MAX_TCP_HEADER_SIZE {
            return Err(Fail::new(EBADMSG, "TCP data offset too large"));
        }
        let (hdr_buf, data_buf): (&[u8], &[u8]) = buf[..].split_at(data_offset);

        let src_port: u16 = u16::from_be_bytes([hdr_buf[0], hdr_buf[1]]);
        let dst_port: u16 = u16::from_be_bytes([hdr_buf[2], hdr_buf[3]]);
        let seq_num: SeqNumber = SeqNumber::from(u32::from_be_bytes([hdr_buf[4], hdr_buf[5], hdr_buf[6], hdr_buf[7]]));
        let ack_num: SeqNumber =
            SeqNumber::from(u32::from_be_bytes([hdr_buf[8], hdr_buf[9], hdr_buf[10], hdr_buf[11]]));

        let urg: bool = (hdr_buf[13] & flags::URG) != 0;
        let ack: bool = (hdr_buf[13] & flags::ACK) != 0;
        let psh: bool = (hdr_buf[13] & flags::PSH) != 0;
        let rst: bool = (hdr_buf[13] & flags::RST) != 0;
        let syn: bool = (hdr_buf[13] & flags::SYN) != 0;
        let fin: bool = (hdr_buf[13] & flags::FIN) != 0;

        let window_size: u16 = u16::from_be_bytes([hdr_buf[14], hdr_buf[15]]);

        let checksum: u16 = u16::from_be_bytes([hdr_buf[16], hdr_buf[17]]);
        if checksum != tcp_checksum(src_addr, dst_addr, hdr_buf, data_buf) {
            return Err(Fail::new(EBADMSG, "TCP checksum mismatch"));
        }

        let urgent_pointer: u16 = u16::from_be_bytes([hdr_buf[18], hdr_buf[19]]);

        let mut options: ArrayVec<TcpOption, MAX_TCP_OPTIONS> = ArrayVec::new();
        let area: &[u8] = &hdr_buf[MIN_TCP_HEADER_SIZE..data_offset];
        let mut i: usize = 0;
        while i < area.len() {
            let kind: u8 = area[i];
            i += 1;
            if kind == 0 {
                break;
            }
            if kind == 1 {
                continue;
            }
            if i >= area.len() {
                // Truncated length octet.
                break;
            }
            let declared: usize = area[i] as usize;
            i += 1;
            let body_len: usize = declared.saturating_sub(2);
            let body_end: usize = i + body_len;
            if body_end > area.len() {
                // Declared length runs past the option area.
                break;
            }
            let body: &[u8] = &area[i..body_end];
            let option: Option<TcpOption> = match kind {
                2 if declared == 4 => Some(TcpOption::MaximumSegmentSize(u16::from_be_bytes([body[0], body[1]]))),
                3 if declared == 3 => Some(TcpOption::WindowScale(body[0])),
                4 if declared == 2 => Some(TcpOption::SackPermitted),
                5 if matches!(declared, 10 | 18 | 26 | 34) => {
                    let mut blocks: ArrayVec<SackRange, MAX_WIRE_SACK_BLOCKS> = ArrayVec::new();
                    for chunk in body.chunks_exact(8) {
                        blocks.push(SackRange {
                            begin: SeqNumber::from(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
                            end: SeqNumber::from(u32::from_be_bytes([chunk[4], chunk[5], chunk[6], chunk[7]])),
                        });
                    }
                    Some(TcpOption::SackBlocks(blocks))
                },
                8 if declared == 10 => Some(TcpOption::Timestamp {
                    sender_timestamp: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
                    echo_timestamp: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
                }),
                _ => {
                    debug!("parse(): skipping option kind={} declared_len={}", kind, declared);
                    None
                },
            };
            if let Some(option) = option {
                if options.try_push(option).is_err() {
                    debug!("parse(): option list full, ignoring the rest");
                    break;
                }
            }
            i = body_end;
        }

        let header: TcpHeader = Self {
            src_port,
            dst_port,
            seq_num,
            ack_num,
            urg,
            ack,
            psh,
            rst,
            syn,
            fin,
            window_size,
            urgent_pointer,
            options,
        };
        buf.adjust(data_offset)?;
        Ok((header, buf))
    }

    /// Serializes the header (with options and checksum) into `buf`, which
    /// must be exactly `compute_size()` bytes; `data` is the payload that
    /// follows on the wire and participates in the checksum.
    pub fn serialize(&self, buf: &mut [u8], src_addr: &Ipv4Addr, dst_addr: &Ipv4Addr, data: &[u8]) {
        let fixed_buf: &mut [u8; MIN_TCP_HEADER_SIZE] = (&mut buf[..MIN_TCP_HEADER_SIZE]).try_into().unwrap();
        fixed_buf[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        fixed_buf[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        fixed_buf[4..8].copy_from_slice(&u32::from(self.seq_num).to_be_bytes());
        fixed_buf[8..12].copy_from_slice(&u32::from(self.ack_num).to_be_bytes());
        fixed_buf[12] = ((self.compute_size() / 4) as u8) << 4;
        fixed_buf[13] = self.flag_bits();
        fixed_buf[14..16].copy_from_slice(&self.window_size.to_be_bytes());
        // Checksum (bytes 16..18) is written last.
        fixed_buf[18..20].copy_from_slice(&self.urgent_pointer.to_be_bytes());

        let mut cur_pos: usize = MIN_TCP_HEADER_SIZE;
        for option in &self.options {
            cur_pos += option.serialize(&mut buf[cur_pos..]);
        }
        // Terminate the option list if we wrote one.
        if !self.options.is_empty() && cur_pos < buf.len() {
            buf[cur_pos] = 0;
            cur_pos += 1;
        }
        // Zero the remaining padding.
        for byte in &mut buf[cur_pos..] {
            *byte = 0;
        }

        let checksum: u16 = tcp_checksum(src_addr, dst_addr, buf, data);
        buf[16..18].copy_from_slice(&checksum.to_be_bytes());
    }

    /// Header size with options, rounded up to the next multiple of 4 so the
    /// payload stays 32-bit aligned.
    pub fn compute_size(&self) -> usize {
        let mut size: usize = MIN_TCP_HEADER_SIZE;
        for option in &self.options {
            size += option.compute_size();
        }
        if !self.options.is_empty() {
            // One byte for the end-of-options marker.
            size += 1;
        }
        (size + 3) & !0x3
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Computes the TCP checksum over the IPv4 pseudo-header, the header, and
/// the payload.
pub fn tcp_checksum(src_addr: &Ipv4Addr, dst_addr: &Ipv4Addr, header: &[u8], data: &[u8]) -> u16 {
    let mut state: u32 = 0xffff;

    // Pseudo-header: source address, destination address, zero + protocol
    // number, and TCP segment length.
    let src_octets: [u8; 4] = src_addr.octets();
    state += u16::from_be_bytes([src_octets[0], src_octets[1]]) as u32;
    state += u16::from_be_bytes([src_octets[2], src_octets[3]]) as u32;

    let dst_octets: [u8; 4] = dst_addr.octets();
    state += u16::from_be_bytes([dst_octets[0], dst_octets[1]]) as u32;
    state += u16::from_be_bytes([dst_octets[2], dst_octets[3]]) as u32;

    state += u16::from_be_bytes([0, IPV4_PROTOCOL_TCP]) as u32;
    state += (header.len() + data.len()) as u32;

    // Header, with the checksum field taken as zero.
    for (i, chunk) in header.chunks_exact(2).enumerate() {
        if i == 8 {
            continue;
        }
        state += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }

    // Payload, padding a trailing odd byte with zero.
    let mut chunks_iter: ChunksExact<u8> = data.chunks_exact(2);
    for chunk in chunks_iter.by_ref() {
        state += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let Some(&b) = chunks_iter.remainder().first() {
        state += u16::from_be_bytes([b, 0]) as u32;
    }

    // Fold the carries. Starting from 0xffff keeps the subtraction loop
    // branch-predictable; the accumulator cannot overflow u32 for any
    // realistic segment size.
    while state > 0xffff {
        state -= 0xffff;
    }
    !state as u16
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        flags,
        SackRange,
        TcpHeader,
        TcpOption,
    };
    use crate::{
        protocols::tcp::SeqNumber,
        runtime::memory::Buffer,
    };
    use ::anyhow::Result;
    use ::arrayvec::ArrayVec;
    use ::std::net::Ipv4Addr;

    const SRC: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
    const DST: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 2);

    fn serialize_to_buffer(header: &TcpHeader, payload: &[u8]) -> Buffer {
        let hdr_size: usize = header.compute_size();
        let mut bytes: Vec<u8> = vec![0; hdr_size + payload.len()];
        bytes[hdr_size..].copy_from_slice(payload);
        let (hdr_bytes, data_bytes) = bytes.split_at_mut(hdr_size);
        header.serialize(hdr_bytes, &SRC, &DST, data_bytes);
        Buffer::from_slice(&bytes)
    }

    #[test]
    fn parse_syn_options() -> Result<()> {
        let mut header: TcpHeader = TcpHeader::new(12345, 80);
        header.syn = true;
        header.seq_num = SeqNumber::from(0x1000);
        header.window_size = 0x4000;
        header.options.push(TcpOption::MaximumSegmentSize(1460));
        header.options.push(TcpOption::SackPermitted);
        header.options.push(TcpOption::WindowScale(4));
        header.options.push(TcpOption::Timestamp {
            sender_timestamp: 0xdead_beef,
            echo_timestamp: 0,
        });

        let wire: Buffer = serialize_to_buffer(&header, &[]);
        let (parsed, payload) = TcpHeader::parse(&SRC, &DST, wire)?;

        crate::ensure_eq!(parsed.src_port, 12345);
        crate::ensure_eq!(parsed.dst_port, 80);
        crate::ensure_eq!(parsed.syn, true);
        crate::ensure_eq!(parsed.seq_num, SeqNumber::from(0x1000));
        crate::ensure_eq!(payload.len(), 0);
        crate::ensure_eq!(parsed.options.len(), 4);
        crate::ensure_eq!(parsed.options[0], TcpOption::MaximumSegmentSize(1460));
        crate::ensure_eq!(parsed.options[1], TcpOption::SackPermitted);
        crate::ensure_eq!(parsed.options[2], TcpOption::WindowScale(4));

        Ok(())
    }

    #[test]
    fn parse_sack_blocks_and_payload() -> Result<()> {
        let mut blocks: ArrayVec<SackRange, 4> = ArrayVec::new();
        blocks.push(SackRange {
            begin: SeqNumber::from(1000),
            end: SeqNumber::from(2000),
        });
        blocks.push(SackRange {
            begin: SeqNumber::from(3000),
            end: SeqNumber::from(3500),
        });

        let mut header: TcpHeader = TcpHeader::new(80, 12345);
        header.ack = true;
        header.ack_num = SeqNumber::from(500);
        header.options.push(TcpOption::SackBlocks(blocks.clone()));

        let wire: Buffer = serialize_to_buffer(&header, b"hello");
        let (parsed, payload) = TcpHeader::parse(&SRC, &DST, wire)?;

        crate::ensure_eq!(&payload[..], b"hello");
        crate::ensure_eq!(parsed.options.len(), 1);
        crate::ensure_eq!(parsed.options[0], TcpOption::SackBlocks(blocks));

        Ok(())
    }

    /// A malformed option length skips that option and keeps the rest of the
    /// segment.
    #[test]
    fn malformed_option_is_skipped() -> Result<()> {
        let mut header: TcpHeader = TcpHeader::new(1, 2);
        header.ack = true;
        header.options.push(TcpOption::WindowScale(7));
        let mut wire: Buffer = serialize_to_buffer(&header, &[]);

        // Corrupt the window-scale declared length from 3 to 4 and refresh
        // the checksum.
        let hdr_size: usize = header.compute_size();
        wire[21] = 4;
        wire[16] = 0;
        wire[17] = 0;
        let checksum: u16 = super::tcp_checksum(&SRC, &DST, &wire[..hdr_size], &[]);
        wire[16..18].copy_from_slice(&checksum.to_be_bytes());

        let (parsed, _) = TcpHeader::parse(&SRC, &DST, wire)?;
        crate::ensure_eq!(parsed.options.is_empty(), true);
        crate::ensure_eq!(parsed.ack, true);

        Ok(())
    }

    #[test]
    fn checksum_mismatch_rejected() -> Result<()> {
        let mut header: TcpHeader = TcpHeader::new(1, 2);
        header.ack = true;
        let mut wire: Buffer = serialize_to_buffer(&header, b"payload");
        wire[17] ^= 0xff;
        crate::ensure_eq!(TcpHeader::parse(&SRC, &DST, wire).is_err(), true);
        Ok(())
    }

    #[test]
    fn flag_bits_roundtrip() -> Result<()> {
        let mut header: TcpHeader = TcpHeader::new(1, 2);
        header.syn = true;
        header.ack = true;
        crate::ensure_eq!(header.flag_bits(), flags::SYN | flags::ACK);
        Ok(())
    }
}
