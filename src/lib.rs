//! PantherOS VM - Copy-on-Write Virtual Memory Core
//!
//! The virtual memory subsystem of a small multiprocessor kernel, runnable
//! hosted against a simulated physical frame pool.
//!
//! # Features
//! - Per-frame reference counts shared by every address space
//! - Two-level page tables with on-demand leaf table allocation
//! - Eager or lazy `sbrk`-style heap growth with rollback on failure
//! - `fork` that shares every user page read-only instead of copying
//! - A page fault handler that grows lazily and breaks copy-on-write
//! - A textual page table dump for diagnostics
//!
//! # Invariants
//! - A frame's count equals the number of present leaf entries mapping it
//! - A frame with count above one is never writable through any mapping
//! - A frame is back in the pool exactly when its count reaches zero
//!
//! # Concurrency
//! [`Vm`] is shared by reference across execution units. The frame
//! reference table lock is taken before the frame pool lock, never the
//! other way round.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod config;
pub mod fault;
pub mod mm;
pub mod process;
pub mod syscall;
pub mod uaccess;
pub mod vm;

pub use config::{ConfigError, GrowthPolicy, VmConfig};
pub use fault::{FaultClass, FaultOutcome, KillReason};
pub use mm::{
    AddressSpace, CowResolution, FrameAllocator, FrameRefTable, MappingError, PageReport,
    PageTableEntry, PhysFrame, PhysicalMemory, PteFlags, VirtAddr, KERNEL_BASE, PAGE_SIZE,
};
pub use process::{Pid, Process, ProcessState};
pub use uaccess::AccessError;
pub use vm::Vm;
