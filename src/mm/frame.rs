//! Physical Frame Allocator
//!
//! The physical frame pool the VM core consumes, behind the
//! [`FrameAllocator`] trait, plus a bitmap-backed implementation.
//!
//! # Design
//! - Each bit in the bitmap represents one 4KB frame
//! - Bit = 0: frame is free
//! - Bit = 1: frame is allocated
//! - Frame contents live in per-frame buffers, created on first write
//!
//! # Security Properties
//! - The pool never scrubs a frame on free; callers zero-fill what they
//!   hand to user space (see [`FrameGuard::zeroed`])
//! - Double-free is detected and causes a panic
//! - The bitmap and every frame buffer are protected by spinlocks

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{compiler_fence, Ordering};

use spin::Mutex;

use super::address::{PhysFrame, PAGE_SIZE};
use super::paging::MappingError;

/// The physical memory collaborator.
///
/// Besides handing out and taking back frames, it gives the core the
/// direct-map style access it needs to zero, copy, read and write frame
/// contents.
pub trait FrameAllocator: Send + Sync {
    /// Allocate a single frame. Contents are unspecified.
    fn allocate_frame(&self) -> Option<PhysFrame>;

    /// Return a frame to the free pool.
    fn free_frame(&self, frame: PhysFrame);

    /// Overwrite a whole frame with zeros.
    fn zero_frame(&self, frame: PhysFrame);

    /// Copy the full contents of `src` into `dst`.
    fn copy_frame(&self, src: PhysFrame, dst: PhysFrame);

    /// Read `buf.len()` bytes starting at `offset` within the frame.
    fn read_frame(&self, frame: PhysFrame, offset: usize, buf: &mut [u8]);

    /// Write `buf` starting at `offset` within the frame.
    fn write_frame(&self, frame: PhysFrame, offset: usize, buf: &[u8]);

    /// Number of frames currently free.
    fn free_frames(&self) -> usize;

    /// Number of frames under management.
    fn total_frames(&self) -> usize;
}

/// Bitmap state for the frame pool.
struct FrameBitmap {
    /// One bit per frame (1 = allocated, 0 = free).
    words: Vec<u64>,
    /// Number of free frames remaining.
    free_count: usize,
    /// Total frames under management.
    total_frames: usize,
    /// Word to start the next search from.
    hint: usize,
}

impl FrameBitmap {
    fn new(total_frames: usize) -> Self {
        let mut words = vec![0u64; total_frames.div_ceil(64)];

        // Bits past the end of the pool are permanently allocated.
        let tail = total_frames % 64;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last = !0u64 << tail;
            }
        }

        Self {
            words,
            free_count: total_frames,
            total_frames,
            hint: 0,
        }
    }

    #[inline]
    fn is_allocated(&self, frame: usize) -> bool {
        (self.words[frame / 64] >> (frame % 64)) & 1 == 1
    }

    fn alloc(&mut self) -> Option<usize> {
        if self.free_count == 0 {
            return None;
        }

        let len = self.words.len();
        for step in 0..len {
            let word_idx = (self.hint + step) % len;
            let word = self.words[word_idx];
            if word != !0u64 {
                let bit = (!word).trailing_zeros() as usize;
                self.words[word_idx] |= 1 << bit;
                self.free_count -= 1;
                self.hint = word_idx;
                return Some(word_idx * 64 + bit);
            }
        }

        None
    }

    fn free(&mut self, frame: usize) {
        if frame >= self.total_frames {
            panic!("Attempted to free frame outside managed range: {:#x}", frame);
        }

        if !self.is_allocated(frame) {
            panic!("Double free detected for frame: {:#x}", frame);
        }

        self.words[frame / 64] &= !(1 << (frame % 64));
        self.free_count += 1;
    }
}

/// Simulated physical memory: a fixed pool of page frames.
pub struct PhysicalMemory {
    bitmap: Mutex<FrameBitmap>,
    /// `None` means the frame has never been written and reads as zero.
    frames: Box<[Mutex<Option<Box<[u8]>>>]>,
}

impl PhysicalMemory {
    /// Create a pool of `total_frames` frames, all free.
    pub fn new(total_frames: usize) -> Self {
        let frames = (0..total_frames)
            .map(|_| Mutex::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        log::debug!(
            "[frame] pool initialized: {} frames ({} KiB)",
            total_frames,
            total_frames * PAGE_SIZE / 1024
        );

        Self {
            bitmap: Mutex::new(FrameBitmap::new(total_frames)),
            frames,
        }
    }

    /// Check whether a frame is currently allocated.
    pub fn is_allocated(&self, frame: PhysFrame) -> bool {
        let bitmap = self.bitmap.lock();
        frame.index() >= bitmap.total_frames || bitmap.is_allocated(frame.index())
    }

    fn slot(&self, frame: PhysFrame) -> &Mutex<Option<Box<[u8]>>> {
        match self.frames.get(frame.index()) {
            Some(slot) => slot,
            None => panic!("frame {} outside physical memory", frame),
        }
    }
}

impl FrameAllocator for PhysicalMemory {
    fn allocate_frame(&self) -> Option<PhysFrame> {
        self.bitmap.lock().alloc().map(PhysFrame::new)
    }

    fn free_frame(&self, frame: PhysFrame) {
        self.bitmap.lock().free(frame.index());
    }

    fn zero_frame(&self, frame: PhysFrame) {
        if let Some(bytes) = self.slot(frame).lock().as_deref_mut() {
            scrub(bytes);
        }
    }

    fn copy_frame(&self, src: PhysFrame, dst: PhysFrame) {
        // Never hold two frame locks at once.
        let data = self.slot(src).lock().clone();
        match data {
            Some(bytes) => *self.slot(dst).lock() = Some(bytes),
            None => self.zero_frame(dst),
        }
    }

    fn read_frame(&self, frame: PhysFrame, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= PAGE_SIZE, "read past end of frame {}", frame);
        match self.slot(frame).lock().as_deref() {
            Some(bytes) => buf.copy_from_slice(&bytes[offset..offset + buf.len()]),
            None => buf.fill(0),
        }
    }

    fn write_frame(&self, frame: PhysFrame, offset: usize, buf: &[u8]) {
        assert!(offset + buf.len() <= PAGE_SIZE, "write past end of frame {}", frame);
        let mut slot = self.slot(frame).lock();
        let bytes = slot.get_or_insert_with(|| vec![0u8; PAGE_SIZE].into_boxed_slice());
        bytes[offset..offset + buf.len()].copy_from_slice(buf);
    }

    fn free_frames(&self) -> usize {
        self.bitmap.lock().free_count
    }

    fn total_frames(&self) -> usize {
        self.bitmap.lock().total_frames
    }
}

/// Zero memory with volatile writes so the compiler cannot elide them.
fn scrub(bytes: &mut [u8]) {
    let dst = bytes.as_mut_ptr();
    for i in 0..bytes.len() {
        // SAFETY: `i` is within the bounds of the exclusively borrowed slice.
        unsafe { ptr::write_volatile(dst.add(i), 0) };
    }
    compiler_fence(Ordering::SeqCst);
}

/// A RAII guard for a physical frame that is not yet installed in any
/// page table. Dropping it returns the frame to the pool.
///
/// This provides automatic cleanup on every error path.
pub struct FrameGuard<'a, A: FrameAllocator + ?Sized> {
    frame: PhysFrame,
    allocator: &'a A,
}

impl<'a, A: FrameAllocator + ?Sized> FrameGuard<'a, A> {
    /// Allocate a frame whose contents will be overwritten by the caller.
    pub fn new(allocator: &'a A) -> Result<Self, MappingError> {
        let frame = allocator.allocate_frame().ok_or(MappingError::OutOfMemory)?;
        Ok(Self { frame, allocator })
    }

    /// Allocate a frame and zero-fill it.
    pub fn zeroed(allocator: &'a A) -> Result<Self, MappingError> {
        let guard = Self::new(allocator)?;
        allocator.zero_frame(guard.frame);
        Ok(guard)
    }

    #[inline]
    pub fn frame(&self) -> PhysFrame {
        self.frame
    }

    /// Consume the guard without freeing the frame.
    ///
    /// Use this when transferring ownership to a page table.
    #[inline]
    pub fn into_frame(self) -> PhysFrame {
        let frame = self.frame;
        core::mem::forget(self);
        frame
    }
}

impl<A: FrameAllocator + ?Sized> Drop for FrameGuard<'_, A> {
    fn drop(&mut self) {
        self.allocator.free_frame(self.frame);
    }
}
