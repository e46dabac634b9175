//! Two-Level Page Table Management
//!
//! # Page Table Structure (4KB pages)
//! - Directory: 1024 slots, each covers 4MB and may own one leaf table
//! - Leaf table: 1024 entries, each maps one 4KB page
//!
//! Only the user half of the directory can hold tables. The directory root
//! and each leaf table consume one frame from the frame pool, so creating a
//! table can fail with [`MappingError::OutOfMemory`].

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ops::{Index, IndexMut};

use bitflags::bitflags;

use super::address::{PhysFrame, VirtAddr, ENTRIES_PER_TABLE, PAGE_SHIFT, TABLE_SHIFT, USER_TABLES};
use super::frame::{FrameAllocator, FrameGuard};
use crate::config::MAX_FRAMES;

bitflags! {
    /// Page table entry permission bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PteFlags: u32 {
        /// Entry maps a frame.
        const PRESENT = 1 << 0;
        /// Writes are allowed.
        const WRITABLE = 1 << 1;
        /// Accessible from user mode.
        const USER = 1 << 2;

        /// Private user data page.
        const USER_DATA = Self::PRESENT.bits() | Self::WRITABLE.bits() | Self::USER.bits();
        /// User page that may be shared copy-on-write.
        const USER_SHARED = Self::PRESENT.bits() | Self::USER.bits();
    }
}

/// A single leaf page table entry: frame index in bits [31:12],
/// flags in bits [11:0]. An all-zero entry is empty.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    const ADDR_MASK: u32 = 0xFFFF_F000;

    /// Create an empty entry.
    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Create an entry mapping `frame` with `flags`.
    ///
    /// # Panics
    /// Panics if the frame index does not fit in the entry's 20 frame bits.
    #[inline]
    pub fn new(frame: PhysFrame, flags: PteFlags) -> Self {
        if frame.index() >= MAX_FRAMES {
            panic!("frame {} does not fit in a page table entry", frame);
        }
        Self(((frame.index() << PAGE_SHIFT) as u32 & Self::ADDR_MASK) | flags.bits())
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.flags().contains(PteFlags::WRITABLE)
    }

    #[inline]
    pub fn is_user(self) -> bool {
        self.flags().contains(PteFlags::USER)
    }

    /// Get the mapped frame.
    #[inline]
    pub const fn frame(self) -> PhysFrame {
        PhysFrame::new(((self.0 & Self::ADDR_MASK) >> PAGE_SHIFT) as usize)
    }

    #[inline]
    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & !Self::ADDR_MASK)
    }

    #[inline]
    pub fn insert_flags(&mut self, flags: PteFlags) {
        self.0 |= flags.bits();
    }

    #[inline]
    pub fn remove_flags(&mut self, flags: PteFlags) {
        self.0 &= !flags.bits();
    }

    /// Get the raw u32 value.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Clear the entry (make empty).
    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_empty() {
            write!(f, "PTE(empty)")
        } else {
            write!(f, "PTE(frame={}, flags={:?})", self.frame(), self.flags())
        }
    }
}

/// A leaf page table: 1024 entries.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Create a new table with all entries empty.
    pub const fn new() -> Self {
        const EMPTY: PageTableEntry = PageTableEntry::empty();
        Self {
            entries: [EMPTY; ENTRIES_PER_TABLE],
        }
    }

    /// Iterate over all non-empty entries with their indices.
    pub fn iter_mapped(&self) -> impl Iterator<Item = (usize, PageTableEntry)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.is_empty())
            .map(|(i, e)| (i, *e))
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A leaf table together with the frame it occupies.
struct LeafTable {
    frame: PhysFrame,
    table: Box<PageTable>,
}

/// The root of a two-level page table.
pub struct PageDirectory {
    root: PhysFrame,
    tables: Vec<Option<LeafTable>>,
}

impl PageDirectory {
    /// Allocate an empty directory.
    pub fn new<A: FrameAllocator + ?Sized>(allocator: &A) -> Result<Self, MappingError> {
        let root = FrameGuard::zeroed(allocator)?.into_frame();
        let mut tables = Vec::with_capacity(USER_TABLES);
        tables.resize_with(USER_TABLES, || None);
        Ok(Self { root, tables })
    }

    /// Frame holding the directory itself.
    pub fn root(&self) -> PhysFrame {
        self.root
    }

    /// Return the leaf entry slot for the page containing `va`.
    ///
    /// With `create` set, a missing leaf table is allocated on demand;
    /// without it, a missing table is [`MappingError::NotMapped`]. The slot
    /// returned may itself be empty.
    pub fn lookup_or_create<A: FrameAllocator + ?Sized>(
        &mut self,
        va: VirtAddr,
        create: bool,
        allocator: &A,
    ) -> Result<&mut PageTableEntry, MappingError> {
        if va.is_kernel() {
            return Err(MappingError::InvalidAddress);
        }
        let (dir, index) = va.table_indices();
        let table = if create {
            self.table_or_create(dir, allocator)?
        } else {
            self.table_mut(dir).ok_or(MappingError::NotMapped)?
        };
        Ok(&mut table[index])
    }

    /// Look up the non-empty entry mapping `va`.
    pub fn lookup(&self, va: VirtAddr) -> Option<PageTableEntry> {
        if va.is_kernel() {
            return None;
        }
        let (dir, index) = va.table_indices();
        let leaf = self.tables[dir].as_ref()?;
        let entry = leaf.table[index];
        (!entry.is_empty()).then_some(entry)
    }

    /// Mutable slot for `va` if its leaf table exists.
    pub fn lookup_mut(&mut self, va: VirtAddr) -> Option<&mut PageTableEntry> {
        if va.is_kernel() {
            return None;
        }
        let (dir, index) = va.table_indices();
        self.table_mut(dir).map(|table| &mut table[index])
    }

    /// Clear the entry for `va`, returning what it held.
    pub fn unmap(&mut self, va: VirtAddr) -> Option<PageTableEntry> {
        let slot = self.lookup_mut(va)?;
        let old = *slot;
        slot.clear();
        (!old.is_empty()).then_some(old)
    }

    pub(crate) fn table_mut(&mut self, dir: usize) -> Option<&mut PageTable> {
        self.tables
            .get_mut(dir)?
            .as_mut()
            .map(|leaf| &mut *leaf.table)
    }

    /// Leaf table at directory slot `dir`, allocating it if absent.
    pub(crate) fn table_or_create<A: FrameAllocator + ?Sized>(
        &mut self,
        dir: usize,
        allocator: &A,
    ) -> Result<&mut PageTable, MappingError> {
        let slot = self.tables.get_mut(dir).ok_or(MappingError::InvalidAddress)?;
        if slot.is_none() {
            let frame = FrameGuard::zeroed(allocator)?.into_frame();
            log::trace!("[paging] leaf table {} at {:#x}", frame, dir << TABLE_SHIFT);
            *slot = Some(LeafTable {
                frame,
                table: Box::new(PageTable::new()),
            });
        }
        match slot {
            Some(leaf) => Ok(&mut *leaf.table),
            None => unreachable!(),
        }
    }

    /// Iterate over the existing leaf tables with their directory index.
    pub(crate) fn tables_mut(&mut self) -> impl Iterator<Item = (usize, &mut PageTable)> + '_ {
        self.tables
            .iter_mut()
            .enumerate()
            .filter_map(|(dir, slot)| slot.as_mut().map(|leaf| (dir, &mut *leaf.table)))
    }

    /// Iterate over every non-empty leaf entry with its virtual address.
    pub fn iter_mapped(&self) -> impl Iterator<Item = (VirtAddr, PageTableEntry)> + '_ {
        self.tables.iter().enumerate().flat_map(|(dir, slot)| {
            slot.iter().flat_map(move |leaf| {
                leaf.table.iter_mapped().map(move |(index, entry)| {
                    (VirtAddr::new((dir << TABLE_SHIFT) | (index << PAGE_SHIFT)), entry)
                })
            })
        })
    }

    /// Number of frames occupied by the table structure itself.
    pub fn table_frames(&self) -> usize {
        1 + self.tables.iter().filter(|slot| slot.is_some()).count()
    }

    /// Return the root and every leaf table frame to the pool.
    ///
    /// Leaf entries must already have been dereferenced by the caller.
    pub fn free<A: FrameAllocator + ?Sized>(self, allocator: &A) {
        for leaf in self.tables.into_iter().flatten() {
            debug_assert!(leaf.table.iter_mapped().next().is_none());
            allocator.free_frame(leaf.frame);
        }
        allocator.free_frame(self.root);
    }
}

/// Error type for page mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingError {
    /// No physical frames available for pages or page tables.
    OutOfMemory,
    /// The address lies in the kernel/reserved region.
    InvalidAddress,
    /// The virtual address is not mapped.
    NotMapped,
    /// The requested size leaves the legal user range.
    OutOfRange,
    /// The process no longer has an address space.
    NoAddressSpace,
}

impl core::fmt::Display for MappingError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of physical memory"),
            Self::InvalidAddress => write!(f, "address in reserved region"),
            Self::NotMapped => write!(f, "virtual address not mapped"),
            Self::OutOfRange => write!(f, "size outside user address range"),
            Self::NoAddressSpace => write!(f, "process has no address space"),
        }
    }
}
