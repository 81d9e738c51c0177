// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::SocketId;
use ::std::{
    cell::RefCell,
    cmp::{
        Ordering,
        Reverse,
    },
    collections::{
        BinaryHeap,
        HashSet,
    },
    rc::Rc,
    time::Instant,
};

//======================================================================================================================
// Enumerations
//======================================================================================================================

/// Kinds of single-shot deadlines the transport arms against a socket.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimerEvent {
    /// Retransmission deadline for the oldest unacknowledged segment.
    Retransmit(SocketId),
    /// Periodic keepalive inspection.
    Keepalive(SocketId),
    /// SYN retransmission while connecting.
    ConnectRetry(SocketId),
    /// FIN handshake watchdog and TIME-WAIT expiry.
    FinLinger(SocketId),
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Handle to a pending timer; cancellation is by handle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TimerHandle(u64);

struct TimerQueueEntry {
    expiry: Instant,
    id: u64,
    event: TimerEvent,
}

/// Timer wheel holding single-shot events for future ticks.
///
/// Entries are only ever popped by the tick thread; a canceled entry stays in
/// the heap and is discarded when it surfaces.
pub struct TimerWheel {
    heap: BinaryHeap<Reverse<TimerQueueEntry>>,
    canceled: HashSet<u64>,
    next_id: u64,
}

/// Shared handle to the timer wheel, cloned into every control block.
#[derive(Clone)]
pub struct SharedTimerWheel(Rc<RefCell<TimerWheel>>);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            canceled: HashSet::new(),
            next_id: 1,
        }
    }

    /// Arms a single-shot event for `expiry` and returns its handle.
    pub fn set(&mut self, expiry: Instant, event: TimerEvent) -> TimerHandle {
        let id: u64 = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse(TimerQueueEntry { expiry, id, event }));
        TimerHandle(id)
    }

    /// Cancels a pending event. Canceling an already-fired handle is a no-op.
    pub fn cancel(&mut self, handle: TimerHandle) {
        self.canceled.insert(handle.0);
    }

    /// Pops the next event whose deadline has passed, skipping canceled ones.
    pub fn pop_expired(&mut self, now: Instant) -> Option<TimerEvent> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.expiry > now {
                return None;
            }
            let entry: TimerQueueEntry = self.heap.pop()?.0;
            if self.canceled.remove(&entry.id) {
                continue;
            }
            return Some(entry.event);
        }
        None
    }

    /// Number of armed (possibly canceled) entries.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl SharedTimerWheel {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(TimerWheel::new())))
    }

    pub fn set(&self, expiry: Instant, event: TimerEvent) -> TimerHandle {
        self.0.borrow_mut().set(expiry, event)
    }

    pub fn cancel(&self, handle: TimerHandle) {
        self.0.borrow_mut().cancel(handle)
    }

    pub fn pop_expired(&self, now: Instant) -> Option<TimerEvent> {
        self.0.borrow_mut().pop_expired(now)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for SharedTimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for TimerQueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TimerQueueEntry {}

impl PartialOrd for TimerQueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerQueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.expiry.cmp(&other.expiry).then(self.id.cmp(&other.id))
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        TimerEvent,
        TimerHandle,
        TimerWheel,
    };
    use crate::runtime::SocketId;
    use ::anyhow::Result;
    use ::std::time::{
        Duration,
        Instant,
    };

    #[test]
    fn fires_in_deadline_order() -> Result<()> {
        let mut wheel: TimerWheel = TimerWheel::new();
        let now: Instant = Instant::now();
        let a: SocketId = SocketId::from(1);
        let b: SocketId = SocketId::from(2);

        wheel.set(now + Duration::from_millis(20), TimerEvent::Keepalive(b));
        wheel.set(now + Duration::from_millis(10), TimerEvent::Retransmit(a));

        crate::ensure_eq!(wheel.pop_expired(now), None);

        let later: Instant = now + Duration::from_millis(30);
        crate::ensure_eq!(wheel.pop_expired(later), Some(TimerEvent::Retransmit(a)));
        crate::ensure_eq!(wheel.pop_expired(later), Some(TimerEvent::Keepalive(b)));
        crate::ensure_eq!(wheel.pop_expired(later), None);

        Ok(())
    }

    #[test]
    fn canceled_entries_do_not_fire() -> Result<()> {
        let mut wheel: TimerWheel = TimerWheel::new();
        let now: Instant = Instant::now();
        let id: SocketId = SocketId::from(7);

        let handle: TimerHandle = wheel.set(now + Duration::from_millis(5), TimerEvent::FinLinger(id));
        wheel.set(now + Duration::from_millis(6), TimerEvent::ConnectRetry(id));
        wheel.cancel(handle);

        let later: Instant = now + Duration::from_millis(10);
        crate::ensure_eq!(wheel.pop_expired(later), Some(TimerEvent::ConnectRetry(id)));
        crate::ensure_eq!(wheel.pop_expired(later), None);

        Ok(())
    }
}
