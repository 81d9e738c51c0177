// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    SocketId,
};
use ::libc::EINVAL;
use ::std::{
    net::Ipv4Addr,
    ops::{
        Deref,
        DerefMut,
    },
    time::Instant,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Byte Buffer
///
/// A heap buffer that supports dropping bytes from the front (`adjust`) and
/// from the back (`trim`) without reallocating. The front cut is tracked as
/// an offset so that `adjust` is O(1).
#[derive(Clone, Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    offset: usize,
}

/// Network Frame
///
/// An opaque network buffer as exchanged with the network layer: the raw
/// transport segment (header plus payload), the IPv4 addresses it traveled
/// between, a transmit/receive timestamp, and a weak reference to the owning
/// socket. Ownership of a frame belongs to whichever queue currently holds
/// it; it is dropped exactly once when it leaves the last queue.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Source IPv4 address.
    pub src_addr: Ipv4Addr,
    /// Destination IPv4 address.
    pub dst_addr: Ipv4Addr,
    /// Raw segment bytes, starting at the transport header.
    pub body: Buffer,
    /// When this frame was received or last transmitted.
    pub timestamp: Option<Instant>,
    /// Owning socket, if any. Weak: must be re-validated against the arena.
    pub socket: Option<SocketId>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Buffer {
    /// Creates a zeroed buffer with the given length.
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![0; len],
            offset: 0,
        }
    }

    /// Creates a buffer holding a copy of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            offset: 0,
        }
    }

    /// Creates an empty buffer.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the number of readable bytes.
    pub fn len(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Returns `true` when no readable bytes remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops `nbytes` from the front of the buffer.
    pub fn adjust(&mut self, nbytes: usize) -> Result<(), Fail> {
        if nbytes > self.len() {
            return Err(Fail::new(EINVAL, "adjusting past end of buffer"));
        }
        self.offset += nbytes;
        Ok(())
    }

    /// Drops `nbytes` from the back of the buffer.
    pub fn trim(&mut self, nbytes: usize) -> Result<(), Fail> {
        if nbytes > self.len() {
            return Err(Fail::new(EINVAL, "trimming past beginning of buffer"));
        }
        self.data.truncate(self.data.len() - nbytes);
        Ok(())
    }

    /// Splits off and returns the first `nbytes` of the buffer.
    pub fn split_front(&mut self, nbytes: usize) -> Result<Buffer, Fail> {
        if nbytes > self.len() {
            return Err(Fail::new(EINVAL, "splitting past end of buffer"));
        }
        let front: Buffer = Buffer::from_slice(&self[..nbytes]);
        self.adjust(nbytes)?;
        Ok(front)
    }
}

impl Frame {
    /// Creates a frame around a raw transport segment.
    pub fn new(src_addr: Ipv4Addr, dst_addr: Ipv4Addr, body: Buffer) -> Self {
        Self {
            src_addr,
            dst_addr,
            body,
            timestamp: None,
            socket: None,
        }
    }

    /// Returns the length of the raw segment carried by this frame.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// Returns `true` when the frame carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[self.offset..]
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.offset..]
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Self { data, offset: 0 }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
