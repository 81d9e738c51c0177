// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// This file defines a type to represent a TCP Sequence Number.
//
// RFC 793, Section 3.3 defines TCP sequence numbers. The sequence number space ranges from 0 to 2^32 - 1. This space
// "wraps around", so all arithmetic dealing with sequence numbers must be performed modulo 2^32. This also means that
// excluding equality, all comparisons between sequence numbers are non-transitive. That is, for any three distinct
// sequence numbers a, b, & c, having a < b and b < c being true does NOT necessarily imply that a < c. One can have
// the situation that a < b < c < a. For this reason, we define sequence numbers to be their own type.

use ::std::{
    cmp::Ordering,
    convert::From,
    fmt,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Internally, we store sequence numbers as unsigned 32-bit integers.
///
/// We allow our sequence numbers to be cloned, copied, created, and checked for equality the same as for u32. We
/// restrict all other behaviors to those we explicitly define below.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct SeqNumber {
    value: u32,
}

/// Ordering key for segment stores.
///
/// Circular comparison is not a lawful total order over the full sequence
/// space, but every store bounds its contents to far less than half the
/// space (the byte budget), so all live keys fall inside one half-window and
/// compare consistently. The key type exists to keep that caveat out of
/// [SeqNumber] itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SeqKey(SeqNumber);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl SeqNumber {
    /// Wrapping distance from `other` up to `self`.
    pub fn offset_from(self, other: SeqNumber) -> u32 {
        self.value.wrapping_sub(other.value)
    }
}

impl SeqKey {
    pub fn seq(&self) -> SeqNumber {
        self.0
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<SeqNumber> for u32 {
    #[inline]
    fn from(item: SeqNumber) -> u32 {
        item.value
    }
}

impl From<u32> for SeqNumber {
    #[inline]
    fn from(item: u32) -> Self {
        SeqNumber { value: item }
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.value.fmt(f)
    }
}

impl std::ops::Add for SeqNumber {
    type Output = SeqNumber;

    #[inline]
    fn add(self, other: SeqNumber) -> SeqNumber {
        (self.value.wrapping_add(other.value)).into()
    }
}

impl std::ops::Sub for SeqNumber {
    type Output = SeqNumber;

    #[inline]
    fn sub(self, other: SeqNumber) -> SeqNumber {
        (self.value.wrapping_sub(other.value)).into()
    }
}

// We define the PartialOrd trait in order to support the "<", "<=", ">", and ">=" operators on sequence numbers.
// Strictly speaking, however, sequence numbers are not a partially ordered set (much less a totally ordered set) due
// to the fact that they wrap around. So to avoid problems with other code that might assume our implementation of the
// PartialOrd trait means that sequence numbers can be uniquely ordered, we don't implement the partial_cmp function of
// this trait. Well, actually we do, because the compiler complains if we don't, but we have it panic if it is called.
impl std::cmp::PartialOrd for SeqNumber {
    fn partial_cmp(&self, _other: &Self) -> Option<Ordering> {
        panic!("somebody called partial_cmp on a sequence number, don't do that");
    }

    #[inline]
    fn lt(&self, other: &Self) -> bool {
        (self.value.wrapping_sub(other.value) as i32) < 0
    }

    #[inline]
    fn le(&self, other: &Self) -> bool {
        (self.value.wrapping_sub(other.value) as i32) <= 0
    }

    #[inline]
    fn gt(&self, other: &Self) -> bool {
        (self.value.wrapping_sub(other.value) as i32) > 0
    }

    #[inline]
    fn ge(&self, other: &Self) -> bool {
        (self.value.wrapping_sub(other.value) as i32) >= 0
    }
}

impl From<SeqNumber> for SeqKey {
    fn from(seq: SeqNumber) -> Self {
        SeqKey(seq)
    }
}

impl PartialOrd for SeqKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SeqKey {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        (u32::from(self.0).wrapping_sub(u32::from(other.0)) as i32).cmp(&0)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
