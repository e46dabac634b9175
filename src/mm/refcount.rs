//! Frame Reference Table
//!
//! Maps every physical frame to the number of page-table entries, across
//! all address spaces, that currently map it.
//!
//! # Locking
//! One spinlock guards the whole table. Every read-modify-write of a
//! count happens with it held, and callers that must decide on a count and
//! then act on it (COW resolution) hold the [`RefCounts`] guard across the
//! whole sequence. Lock order is table, then frame pool: `decrement` frees
//! into the pool while the table lock is held.

use alloc::boxed::Box;
use alloc::vec;

use spin::{Mutex, MutexGuard};

use super::address::PhysFrame;
use super::frame::FrameAllocator;

/// Shared table of per-frame mapping counts.
pub struct FrameRefTable {
    counts: Mutex<Box<[u32]>>,
}

impl FrameRefTable {
    /// Create a table covering `frames` frames, all with count 0.
    pub fn new(frames: usize) -> Self {
        Self {
            counts: Mutex::new(vec![0u32; frames].into_boxed_slice()),
        }
    }

    /// Lock the table for a sequence of count operations.
    pub fn lock(&self) -> RefCounts<'_> {
        RefCounts {
            counts: self.counts.lock(),
        }
    }

    /// Current count of `frame`.
    pub fn count(&self, frame: PhysFrame) -> u32 {
        self.lock().count(frame)
    }

    /// Record one more mapping of an already mapped frame.
    pub fn increment(&self, frame: PhysFrame) -> u32 {
        self.lock().increment(frame)
    }

    /// Drop one mapping; the frame goes back to `allocator` at zero.
    pub fn decrement<A: FrameAllocator + ?Sized>(&self, frame: PhysFrame, allocator: &A) -> u32 {
        self.lock().decrement(frame, allocator)
    }

    /// Number of frames with a non-zero count.
    pub fn mapped_frames(&self) -> usize {
        self.counts.lock().iter().filter(|&&count| count > 0).count()
    }
}

/// Locked view of the reference table.
pub struct RefCounts<'a> {
    counts: MutexGuard<'a, Box<[u32]>>,
}

impl RefCounts<'_> {
    fn slot(&mut self, frame: PhysFrame) -> &mut u32 {
        match self.counts.get_mut(frame.index()) {
            Some(count) => count,
            None => panic!("frame {} outside reference table", frame),
        }
    }

    pub fn count(&self, frame: PhysFrame) -> u32 {
        match self.counts.get(frame.index()) {
            Some(&count) => count,
            None => panic!("frame {} outside reference table", frame),
        }
    }

    /// Take the first reference on a freshly allocated frame.
    ///
    /// # Panics
    /// Panics if the frame is already referenced.
    pub fn register(&mut self, frame: PhysFrame) {
        let count = self.slot(frame);
        if *count != 0 {
            panic!("frame {} registered while still mapped ({} refs)", frame, count);
        }
        *count = 1;
    }

    /// # Panics
    /// Panics if the frame has no references: sharing an unowned frame
    /// means the accounting is already broken.
    pub fn increment(&mut self, frame: PhysFrame) -> u32 {
        let count = self.slot(frame);
        if *count == 0 {
            panic!("refcount increment on unreferenced frame {}", frame);
        }
        *count += 1;
        *count
    }

    /// # Panics
    /// Panics on underflow.
    pub fn decrement<A: FrameAllocator + ?Sized>(&mut self, frame: PhysFrame, allocator: &A) -> u32 {
        let count = self.slot(frame);
        if *count == 0 {
            panic!("refcount underflow on frame {}", frame);
        }
        *count -= 1;
        let remaining = *count;
        if remaining == 0 {
            log::trace!("[frame] {} released to pool", frame);
            allocator.free_frame(frame);
        }
        remaining
    }
}
