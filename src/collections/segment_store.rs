// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    protocols::tcp::sequence_number::{
        SeqKey,
        SeqNumber,
    },
    runtime::fail::Fail,
};
use ::libc::{
    EEXIST,
    ENOBUFS,
};
use ::std::{
    collections::BTreeMap,
    time::Instant,
};

//======================================================================================================================
// Traits
//======================================================================================================================

/// A segment that can live in a [SegmentStore]: it occupies a span of
/// sequence space starting at `seq()`.
pub trait StoredSegment {
    /// Starting sequence number. This is the store key; it must not change
    /// while the segment is stored.
    fn seq(&self) -> SeqNumber;

    /// Bytes of payload carried.
    fn len(&self) -> u32;

    /// Last transmit timestamp, if this segment tracks one.
    fn timestamp(&self) -> Option<Instant> {
        None
    }
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Ordered Segment Store
///
/// An ordered container keyed by starting sequence number, bounded by a byte
/// budget. Keys are unique; an insert that would shadow an existing key is
/// rejected rather than overwriting. "Next" after a segment is the segment
/// whose key equals its end, so an in-order walk over contiguous data is an
/// O(1) amortized step while random lookup stays logarithmic.
///
/// Invariant: all live keys fall within one half of the sequence space, so
/// the circular key order is consistent. The byte budget enforces this.
pub struct SegmentStore<T: StoredSegment> {
    pool: BTreeMap<SeqKey, T>,
    /// Accounted bytes currently held.
    size: u32,
    /// Number of segments currently held.
    frames: u32,
    max_size: u32,
    /// Fixed byte cost added to every segment's accounting.
    overhead: u32,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl<T: StoredSegment> SegmentStore<T> {
    /// Creates a store bounded by `max_size` accounted bytes.
    pub fn new(max_size: u32, overhead: u32) -> Self {
        Self {
            pool: BTreeMap::new(),
            size: 0,
            frames: 0,
            max_size,
            overhead,
        }
    }

    /// Inserts a segment. Fails, with no mutation, when the byte budget
    /// would be exceeded or a segment with the same key is already stored.
    pub fn insert(&mut self, segment: T) -> Result<(), Fail> {
        let cost: u32 = segment.len() + self.overhead;
        if self.size + cost > self.max_size {
            return Err(Fail::new(ENOBUFS, "segment store byte budget exceeded"));
        }
        let key: SeqKey = SeqKey::from(segment.seq());
        if self.pool.contains_key(&key) {
            return Err(Fail::new(EEXIST, "duplicate segment"));
        }
        self.pool.insert(key, segment);
        self.size += cost;
        self.frames += 1;
        Ok(())
    }

    /// Returns the segment whose key matches `seq` exactly.
    pub fn find(&self, seq: SeqNumber) -> Option<&T> {
        self.pool.get(&SeqKey::from(seq))
    }

    pub fn find_mut(&mut self, seq: SeqNumber) -> Option<&mut T> {
        self.pool.get_mut(&SeqKey::from(seq))
    }

    /// Returns the segment with the lowest key.
    pub fn first(&self) -> Option<&T> {
        self.pool.values().next()
    }

    /// Returns the segment contiguously following `cur`, i.e. the one whose
    /// key equals `cur.seq() + cur.len()`.
    pub fn next(&self, cur: &T) -> Option<&T> {
        self.find(cur.seq() + SeqNumber::from(cur.len()))
    }

    /// Removes and returns the segment keyed by `seq`.
    pub fn remove(&mut self, seq: SeqNumber) -> Option<T> {
        let segment: T = self.pool.remove(&SeqKey::from(seq))?;
        self.size -= segment.len() + self.overhead;
        self.frames -= 1;
        Some(segment)
    }

    /// Removes every segment whose end lies at or before `seq`, stopping at
    /// the first that extends past it. Returns the number removed. Calling
    /// this twice with the same `seq` is a no-op the second time.
    pub fn release_until(&mut self, seq: SeqNumber) -> u32 {
        self.release_all_until(seq).0
    }

    /// Like [Self::release_until], but also reports the transmit timestamp
    /// of the last removed segment whose end equals `seq` exactly. That
    /// timestamp feeds the RTT estimator when no timestamp option is in
    /// play.
    pub fn release_all_until(&mut self, seq: SeqNumber) -> (u32, Option<Instant>) {
        let mut released: u32 = 0;
        let mut timestamp: Option<Instant> = None;
        while let Some(head) = self.first() {
            let end: SeqNumber = head.seq() + SeqNumber::from(head.len());
            if !(end <= seq) {
                break;
            }
            let head_seq: SeqNumber = head.seq();
            if end == seq {
                timestamp = head.timestamp();
            }
            self.remove(head_seq);
            released += 1;
        }
        (released, timestamp)
    }

    /// Ordered iteration over all stored segments.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.pool.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.pool.values_mut()
    }

    /// Removes every stored segment.
    pub fn clear(&mut self) {
        self.pool.clear();
        self.size = 0;
        self.frames = 0;
    }

    pub fn frames(&self) -> u32 {
        self.frames
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    /// Accounted bytes still available before the budget is hit.
    pub fn headroom(&self) -> u32 {
        self.max_size - self.size
    }

    pub fn is_empty(&self) -> bool {
        self.frames == 0
    }

    pub fn set_max_size(&mut self, max_size: u32) {
        self.max_size = max_size;
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
