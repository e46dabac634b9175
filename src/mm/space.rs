//! Per-process address spaces
//!
//! An [`AddressSpace`] is a page directory plus a declared size. Every
//! virtual page below the size is either unmapped (legal to fault in) or
//! mapped present; everything at or above it is illegal.
//!
//! Growing and shrinking keep the frame reference table exact: each
//! installed leaf entry owns one reference on its frame.

use super::address::{page_round_up, PhysFrame, VirtAddr, ENTRIES_PER_TABLE, PAGE_SIZE};
use super::frame::{FrameAllocator, FrameGuard};
use super::paging::{MappingError, PageDirectory, PageTableEntry, PteFlags};
use super::refcount::FrameRefTable;
use crate::config::GrowthPolicy;

/// How a copy-on-write page was made private.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowResolution {
    /// Sole owner: the existing frame was made writable in place.
    Upgraded(PhysFrame),
    /// Shared: the page now maps a private copy.
    Copied { from: PhysFrame, to: PhysFrame },
}

pub struct AddressSpace {
    directory: PageDirectory,
    size: usize,
    reloads: u64,
}

impl AddressSpace {
    /// Create an empty address space of size 0.
    pub fn new<A: FrameAllocator + ?Sized>(allocator: &A) -> Result<Self, MappingError> {
        Ok(Self {
            directory: PageDirectory::new(allocator)?,
            size: 0,
            reloads: 0,
        })
    }

    /// Declared size: one past the highest legal virtual address.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub(crate) fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    #[inline]
    pub fn directory(&self) -> &PageDirectory {
        &self.directory
    }

    #[inline]
    pub(crate) fn directory_mut(&mut self) -> &mut PageDirectory {
        &mut self.directory
    }

    /// The non-empty entry mapping `va`, if any.
    #[inline]
    pub fn translate(&self, va: VirtAddr) -> Option<PageTableEntry> {
        self.directory.lookup(va)
    }

    /// Every mapped page with its entry.
    pub fn mapped(&self) -> impl Iterator<Item = (VirtAddr, PageTableEntry)> + '_ {
        self.directory.iter_mapped()
    }

    /// Drop cached translations after a mapping change.
    pub fn reload(&mut self) {
        self.reloads += 1;
        log::trace!("[mmu] reload root {} (#{})", self.directory.root(), self.reloads);
    }

    /// Number of translation reloads performed on this space.
    pub fn reload_count(&self) -> u64 {
        self.reloads
    }

    /// Back the page containing `va` with a fresh zero-filled frame.
    pub fn map_zeroed<A: FrameAllocator + ?Sized>(
        &mut self,
        va: VirtAddr,
        refs: &FrameRefTable,
        allocator: &A,
    ) -> Result<PhysFrame, MappingError> {
        let page = FrameGuard::zeroed(allocator)?;
        let slot = self.directory.lookup_or_create(va.align_down(), true, allocator)?;
        debug_assert!(slot.is_empty(), "remapping {} over {:?}", va, slot);

        let frame = page.into_frame();
        *slot = PageTableEntry::new(frame, PteFlags::USER_DATA);
        refs.lock().register(frame);
        Ok(frame)
    }

    /// Unmap the page containing `va` and drop its frame reference.
    pub fn unmap<A: FrameAllocator + ?Sized>(
        &mut self,
        va: VirtAddr,
        refs: &FrameRefTable,
        allocator: &A,
    ) -> Option<PhysFrame> {
        let old = self.directory.unmap(va.align_down())?;
        refs.decrement(old.frame(), allocator);
        Some(old.frame())
    }

    /// Change the declared size by `delta` bytes and return the old size.
    ///
    /// On failure the space is left exactly as it was.
    pub fn grow<A: FrameAllocator + ?Sized>(
        &mut self,
        delta: isize,
        policy: GrowthPolicy,
        user_limit: usize,
        refs: &FrameRefTable,
        allocator: &A,
    ) -> Result<usize, MappingError> {
        let old = self.size;
        let new = old
            .checked_add_signed(delta)
            .filter(|&new| new <= user_limit)
            .ok_or(MappingError::OutOfRange)?;

        if new > old {
            self.scrub_boundary(old, new, refs, allocator)?;
            if policy == GrowthPolicy::Eager {
                self.map_range(old, new, refs, allocator)?;
            }
        } else if new < old {
            self.shrink(new, refs, allocator)?;
        }

        self.size = new;
        self.reload();
        Ok(old)
    }

    /// Map every page in `[round_up(old), new)`, undoing the lot on failure.
    fn map_range<A: FrameAllocator + ?Sized>(
        &mut self,
        old: usize,
        new: usize,
        refs: &FrameRefTable,
        allocator: &A,
    ) -> Result<(), MappingError> {
        let start = page_round_up(old).ok_or(MappingError::OutOfRange)?;
        let mut addr = start;
        while addr < new {
            let va = VirtAddr::new(addr);
            if let Err(err) = self.map_zeroed(va, refs, allocator) {
                log::warn!("[sbrk] out of memory at {}, rolling back", va);
                self.unmap_range(start, addr, refs, allocator);
                return Err(err);
            }
            addr += PAGE_SIZE;
        }
        Ok(())
    }

    fn unmap_range<A: FrameAllocator + ?Sized>(
        &mut self,
        start: usize,
        end: usize,
        refs: &FrameRefTable,
        allocator: &A,
    ) {
        let mut addr = start;
        while addr < end {
            self.unmap(VirtAddr::new(addr), refs, allocator);
            addr += PAGE_SIZE;
        }
    }

    /// Zero `[old, min(new, round_up(old)))` in the page holding `old`.
    ///
    /// Bytes past the size in a mapped page stay writable through that
    /// page, so they must be cleared before the size covers them.
    fn scrub_boundary<A: FrameAllocator + ?Sized>(
        &mut self,
        old: usize,
        new: usize,
        refs: &FrameRefTable,
        allocator: &A,
    ) -> Result<(), MappingError> {
        let boundary = page_round_up(old).ok_or(MappingError::OutOfRange)?;
        let start = VirtAddr::new(old);
        if boundary > old && self.translate(start).is_some() {
            self.scrub_tail(start, boundary.min(new) - old, refs, allocator)?;
        }
        Ok(())
    }

    /// Drop every page at or above `new`, scrubbing the tail of a
    /// partially kept page so a later regrow reads zeros.
    fn shrink<A: FrameAllocator + ?Sized>(
        &mut self,
        new: usize,
        refs: &FrameRefTable,
        allocator: &A,
    ) -> Result<(), MappingError> {
        let keep = page_round_up(new).ok_or(MappingError::OutOfRange)?;
        let tail = VirtAddr::new(new);
        if keep > new && self.translate(tail).is_some() {
            self.scrub_tail(tail, keep - new, refs, allocator)?;
        }
        self.unmap_range(keep, page_round_up(self.size).unwrap_or(self.size), refs, allocator);
        Ok(())
    }

    fn scrub_tail<A: FrameAllocator + ?Sized>(
        &mut self,
        tail: VirtAddr,
        len: usize,
        refs: &FrameRefTable,
        allocator: &A,
    ) -> Result<(), MappingError> {
        let entry = self.translate(tail).ok_or(MappingError::NotMapped)?;
        let frame = if entry.is_writable() {
            entry.frame()
        } else {
            match self.break_cow(tail, refs, allocator)? {
                CowResolution::Upgraded(frame) => frame,
                CowResolution::Copied { to, .. } => to,
            }
        };
        let zeros = [0u8; PAGE_SIZE];
        allocator.write_frame(frame, tail.page_offset(), &zeros[..len]);
        Ok(())
    }

    /// Make the read-only page containing `va` privately writable.
    ///
    /// The reference table stays locked from reading the count until the
    /// entry has been rewritten, so no concurrent fork, exit or fault can
    /// change the decision underneath.
    ///
    /// # Panics
    /// Panics if the page is already writable or its frame has no
    /// references: both mean the accounting is corrupt.
    pub fn break_cow<A: FrameAllocator + ?Sized>(
        &mut self,
        va: VirtAddr,
        refs: &FrameRefTable,
        allocator: &A,
    ) -> Result<CowResolution, MappingError> {
        let slot = self
            .directory
            .lookup_mut(va.align_down())
            .filter(|slot| slot.is_present())
            .ok_or(MappingError::NotMapped)?;
        if slot.is_writable() {
            panic!("copy-on-write fault on writable page {}: {:?}", va, slot);
        }
        let old = slot.frame();

        let mut counts = refs.lock();
        let resolution = match counts.count(old) {
            0 => panic!("present page {} maps frame {} with no references", va, old),
            1 => {
                slot.insert_flags(PteFlags::WRITABLE);
                CowResolution::Upgraded(old)
            }
            _ => {
                let copy = FrameGuard::new(allocator)?;
                allocator.copy_frame(old, copy.frame());
                let new = copy.into_frame();
                *slot = PageTableEntry::new(new, PteFlags::USER_DATA);
                counts.register(new);
                counts.decrement(old, allocator);
                CowResolution::Copied { from: old, to: new }
            }
        };
        drop(counts);

        self.reload();
        Ok(resolution)
    }

    /// Dereference every mapped page and return the table frames.
    pub fn release<A: FrameAllocator + ?Sized>(mut self, refs: &FrameRefTable, allocator: &A) {
        let mut counts = refs.lock();
        for (_, table) in self.directory.tables_mut() {
            for index in 0..ENTRIES_PER_TABLE {
                let entry = table[index];
                if !entry.is_empty() {
                    counts.decrement(entry.frame(), allocator);
                    table[index].clear();
                }
            }
        }
        drop(counts);
        self.directory.free(allocator);
    }
}
