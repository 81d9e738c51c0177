// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    memory::Frame,
};
use ::libc::ENOBUFS;
use ::std::{
    collections::VecDeque,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Bounded Frame Queue
///
/// A FIFO of frames bounded by frame count and by byte budget. Each enqueued
/// frame accounts for its length plus a fixed per-frame overhead. Enqueue is
/// all-or-nothing: a frame that would exceed either cap is rejected with no
/// change to the counters.
pub struct FrameQueue {
    queue: VecDeque<Frame>,
    /// Number of frames currently held. Always equals `queue.len()`.
    frames: u32,
    /// Accounted bytes currently held.
    size: u32,
    max_frames: u32,
    max_size: u32,
    /// Fixed byte cost added to every frame's accounting.
    overhead: u32,
}

/// A [FrameQueue] shared with a producer on another execution context (e.g. a
/// driver receive path). This is the only locked structure in the stack;
/// per-connection state never leaves the tick thread.
#[derive(Clone)]
pub struct SharedFrameQueue(Arc<Mutex<FrameQueue>>);

/// The rendezvous point between the transport and the network layer: one
/// inbound and one outbound shared queue, constructed by the host and
/// injected into the stack at initialization.
#[derive(Clone)]
pub struct QueuePair {
    pub incoming: SharedFrameQueue,
    pub outgoing: SharedFrameQueue,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl FrameQueue {
    /// Creates a queue bounded by `max_frames` frames and `max_size` bytes.
    pub fn new(max_frames: u32, max_size: u32, overhead: u32) -> Self {
        Self {
            queue: VecDeque::new(),
            frames: 0,
            size: 0,
            max_frames,
            max_size,
            overhead,
        }
    }

    /// Appends a frame to the tail. The frame is dropped if either cap would
    /// be exceeded; the counters are untouched in that case.
    pub fn enqueue(&mut self, frame: Frame) -> Result<(), Fail> {
        let cost: u32 = frame.len() as u32 + self.overhead;
        if self.frames + 1 > self.max_frames {
            return Err(Fail::new(ENOBUFS, "frame queue is full"));
        }
        if self.size + cost > self.max_size {
            return Err(Fail::new(ENOBUFS, "frame queue byte budget exceeded"));
        }
        self.queue.push_back(frame);
        self.frames += 1;
        self.size += cost;
        Ok(())
    }

    /// Removes and returns the head frame.
    pub fn dequeue(&mut self) -> Option<Frame> {
        let frame: Frame = self.queue.pop_front()?;
        self.frames -= 1;
        self.size -= frame.len() as u32 + self.overhead;
        Some(frame)
    }

    /// Returns the head frame without removing it.
    pub fn peek(&self) -> Option<&Frame> {
        self.queue.front()
    }

    pub fn frames(&self) -> u32 {
        self.frames
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.frames == 0
    }
}

impl SharedFrameQueue {
    pub fn new(max_frames: u32, max_size: u32, overhead: u32) -> Self {
        Self(Arc::new(Mutex::new(FrameQueue::new(max_frames, max_size, overhead))))
    }

    pub fn enqueue(&self, frame: Frame) -> Result<(), Fail> {
        self.lock().enqueue(frame)
    }

    pub fn dequeue(&self) -> Option<Frame> {
        self.lock().dequeue()
    }

    pub fn frames(&self) -> u32 {
        self.lock().frames()
    }

    pub fn size(&self) -> u32 {
        self.lock().size()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, FrameQueue> {
        // A poisoned lock means a producer panicked mid-enqueue; the queue
        // contents are still structurally sound, so keep going.
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl QueuePair {
    /// Builds an inbound/outbound queue pair with identical bounds.
    pub fn new(max_frames: u32, max_size: u32, overhead: u32) -> Self {
        Self {
            incoming: SharedFrameQueue::new(max_frames, max_size, overhead),
            outgoing: SharedFrameQueue::new(max_frames, max_size, overhead),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::FrameQueue;
    use crate::runtime::memory::{
        Buffer,
        Frame,
    };
    use ::anyhow::Result;
    use ::std::net::Ipv4Addr;

    fn cook_frame(len: usize) -> Frame {
        Frame::new(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, Buffer::new(len))
    }

    /// The `frames`/`size` counters always match the contained set, across
    /// an arbitrary interleaving of enqueues and dequeues.
    #[test]
    fn counters_track_contents() -> Result<()> {
        let mut queue: FrameQueue = FrameQueue::new(8, 1024, 8);
        let lens: [usize; 6] = [10, 0, 100, 42, 7, 300];

        let mut expected_frames: u32 = 0;
        let mut expected_size: u32 = 0;
        for (i, len) in lens.iter().enumerate() {
            queue.enqueue(cook_frame(*len))?;
            expected_frames += 1;
            expected_size += *len as u32 + 8;
            crate::ensure_eq!(queue.frames(), expected_frames);
            crate::ensure_eq!(queue.size(), expected_size);

            if i % 2 == 1 {
                let out: Frame = queue.dequeue().unwrap();
                expected_frames -= 1;
                expected_size -= out.len() as u32 + 8;
                crate::ensure_eq!(queue.frames(), expected_frames);
                crate::ensure_eq!(queue.size(), expected_size);
            }
        }

        while let Some(out) = queue.dequeue() {
            expected_frames -= 1;
            expected_size -= out.len() as u32 + 8;
            crate::ensure_eq!(queue.frames(), expected_frames);
            crate::ensure_eq!(queue.size(), expected_size);
        }
        crate::ensure_eq!(queue.frames(), 0);
        crate::ensure_eq!(queue.size(), 0);

        Ok(())
    }

    /// A rejected enqueue leaves the queue untouched.
    #[test]
    fn enqueue_rejects_without_mutation() -> Result<()> {
        let mut queue: FrameQueue = FrameQueue::new(2, 64, 0);
        queue.enqueue(cook_frame(30))?;

        // Byte cap exceeded.
        crate::ensure_eq!(queue.enqueue(cook_frame(60)).is_err(), true);
        crate::ensure_eq!(queue.frames(), 1);
        crate::ensure_eq!(queue.size(), 30);

        // Frame cap exceeded.
        queue.enqueue(cook_frame(10))?;
        crate::ensure_eq!(queue.enqueue(cook_frame(1)).is_err(), true);
        crate::ensure_eq!(queue.frames(), 2);
        crate::ensure_eq!(queue.size(), 40);

        Ok(())
    }

    /// FIFO order is preserved and `peek` does not remove.
    #[test]
    fn fifo_order() -> Result<()> {
        let mut queue: FrameQueue = FrameQueue::new(4, 1024, 0);
        for len in [1usize, 2, 3] {
            queue.enqueue(cook_frame(len))?;
        }
        crate::ensure_eq!(queue.peek().unwrap().len(), 1);
        crate::ensure_eq!(queue.dequeue().unwrap().len(), 1);
        crate::ensure_eq!(queue.dequeue().unwrap().len(), 2);
        crate::ensure_eq!(queue.dequeue().unwrap().len(), 3);
        crate::ensure_eq!(queue.dequeue().is_none(), true);
        Ok(())
    }
}
