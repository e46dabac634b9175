//! Physical Frame and Virtual Address Types
//!
//! Type-safe wrappers that keep frame indices and user virtual addresses
//! from being mixed up.
//!
//! # Layout
//! - 4 KiB pages
//! - Two-level translation: 10 bits of directory index, 10 bits of table
//!   index, 12 bits of page offset
//! - Everything at or above `KERNEL_BASE` is reserved for the kernel

use core::fmt;

/// Page size (4 KiB)
pub const PAGE_SIZE: usize = 4096;
/// Page size mask
pub const PAGE_MASK: usize = PAGE_SIZE - 1;
/// Bits to shift for page number
pub const PAGE_SHIFT: usize = 12;

/// Number of entries per page table and per directory
pub const ENTRIES_PER_TABLE: usize = 1024;
/// Bits to shift for the directory index
pub const TABLE_SHIFT: usize = 22;

/// First address of the kernel/reserved region.
pub const KERNEL_BASE: usize = 0x8000_0000;

/// Number of directory slots that can hold user page tables.
pub const USER_TABLES: usize = KERNEL_BASE >> TABLE_SHIFT;

/// A physical frame, identified by its index in the frame pool.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysFrame(usize);

impl PhysFrame {
    /// Create a frame handle from its index.
    #[inline]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Get the frame index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Debug for PhysFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysFrame({:#x})", self.0)
    }
}

impl fmt::Display for PhysFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A user virtual address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Address of the first byte of virtual page `index`.
    #[inline]
    pub const fn from_page_index(index: usize) -> Self {
        Self(index << PAGE_SHIFT)
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Check if the address is page-aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Align the address down to the nearest page boundary.
    #[inline]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Align the address up to the nearest page boundary.
    ///
    /// Returns `None` if rounding would overflow.
    #[inline]
    pub const fn align_up(self) -> Option<Self> {
        match page_round_up(self.0) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Virtual page number.
    #[inline]
    pub const fn page_index(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Get the (directory, table) indices for this address.
    #[inline]
    pub const fn table_indices(self) -> (usize, usize) {
        let dir = (self.0 >> TABLE_SHIFT) & (ENTRIES_PER_TABLE - 1);
        let table = (self.0 >> PAGE_SHIFT) & (ENTRIES_PER_TABLE - 1);
        (dir, table)
    }

    /// Get the page offset (lowest 12 bits).
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Add an offset to this address.
    #[inline]
    pub const fn add(self, offset: usize) -> Self {
        Self(self.0.wrapping_add(offset))
    }

    /// Check if this address lies in the kernel/reserved region.
    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 >= KERNEL_BASE
    }

    /// Check if this is a user address.
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < KERNEL_BASE
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#010x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Round a byte count up to a whole number of pages.
#[inline]
pub const fn page_round_up(bytes: usize) -> Option<usize> {
    match bytes.checked_add(PAGE_MASK) {
        Some(sum) => Some(sum & !PAGE_MASK),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_kernel_split() {
        assert!(VirtAddr::new(0x7FFF_FFFF).is_user());
        assert!(VirtAddr::new(KERNEL_BASE).is_kernel());
        assert_eq!(USER_TABLES, 512);
    }

    #[test]
    fn test_table_indices() {
        let va = VirtAddr::new(0x0040_3123);
        assert_eq!(va.table_indices(), (1, 3));
        assert_eq!(va.page_offset(), 0x123);
        assert_eq!(va.page_index(), 0x403);
        assert_eq!(VirtAddr::from_page_index(0x403), va.align_down());
    }

    #[test]
    fn test_page_alignment() {
        let addr = VirtAddr::new(0x4008_1234);
        assert!(!addr.is_aligned());
        assert_eq!(addr.align_down().as_usize(), 0x4008_1000);
        assert_eq!(addr.align_up().map(VirtAddr::as_usize), Some(0x4008_2000));
        assert_eq!(VirtAddr::new(usize::MAX).align_up(), None);
        assert_eq!(page_round_up(0), Some(0));
        assert_eq!(page_round_up(1), Some(PAGE_SIZE));
    }
}
