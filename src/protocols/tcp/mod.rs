// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod congestion;
pub mod ctrlblk;
pub mod fsm;
pub mod header;
pub mod isn_generator;
pub mod peer;
pub mod rto;
pub mod sender;
pub mod sequence_number;

#[cfg(test)]
mod tests;

pub use self::sequence_number::{
    SeqKey,
    SeqNumber,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Initial congestion window, in segments.
pub const INITIAL_WINDOW: u32 = 2;

/// Retransmission ceiling: the connection is abandoned once the backoff
/// exponent passes this while established or closing.
pub const MAX_RETRANS: u32 = 10;

/// Interval between keepalive inspections.
pub const KEEPALIVE_PERIOD_MS: u64 = 1000;

/// Maximum number of SACK blocks we advertise in one segment.
pub const MAX_SACK_BLOCKS: usize = 3;

/// Maximum number of SACK blocks a peer may encode in one segment.
pub const MAX_WIRE_SACK_BLOCKS: usize = 4;
