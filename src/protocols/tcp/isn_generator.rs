// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::protocols::tcp::SeqNumber;
use ::rand::{
    rngs::SmallRng,
    Rng,
    SeedableRng,
};
use ::std::{
    net::SocketAddrV4,
    num::Wrapping,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Initial sequence number generator.
///
/// Mixes a per-stack random nonce with the 4-tuple and a monotone counter so
/// that successive incarnations of the same connection do not reuse sequence
/// space immediately.
pub struct IsnGenerator {
    rng: SmallRng,
    counter: Wrapping<u16>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl IsnGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            counter: Wrapping(0),
        }
    }

    pub fn generate(&mut self, local: &SocketAddrV4, remote: &SocketAddrV4) -> SeqNumber {
        let nonce: u32 = self.rng.gen();
        let mut hash: u32 = nonce;
        for octet in local.ip().octets().iter().chain(remote.ip().octets().iter()) {
            hash = hash.rotate_left(5) ^ (*octet as u32);
        }
        hash = hash.rotate_left(5) ^ (local.port() as u32);
        hash = hash.rotate_left(5) ^ (remote.port() as u32);
        let isn: SeqNumber = SeqNumber::from(hash.wrapping_add(self.counter.0 as u32));
        self.counter += Wrapping(1);
        isn
    }
}
