//! Memory management
//!
//! Provides:
//! - Physical frame pool and RAII frame ownership
//! - The shared frame reference table
//! - Two-level page tables and the walker over them
//! - Per-process address spaces that grow and shrink
//! - Copy-on-write duplication for `fork`
//! - Page table dumps for diagnostics
//!
//! # Invariants
//! - Every present leaf entry holds exactly one reference on its frame
//! - A frame mapped by more than one entry is read-only in all of them
//! - Frames handed to user space are zero-filled first

pub mod address;
pub mod dump;
pub mod fork;
pub mod frame;
pub mod paging;
pub mod refcount;
pub mod space;

pub use address::{PhysFrame, VirtAddr, KERNEL_BASE, PAGE_SHIFT, PAGE_SIZE};
pub use dump::PageReport;
pub use frame::{FrameAllocator, FrameGuard, PhysicalMemory};
pub use paging::{MappingError, PageTableEntry, PteFlags};
pub use refcount::FrameRefTable;
pub use space::{AddressSpace, CowResolution};
