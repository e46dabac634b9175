//! Page fault handling
//!
//! A fault arrives with the faulting address and runs synchronously on the
//! faulting process's own context. It is classified against the page
//! table without creating anything, then:
//!
//! - Growth: unmapped but below the declared size; back it with a zeroed frame
//! - Copy-on-write: present, user, read-only; make it privately writable
//! - Illegal: anything else; mark the process killed
//!
//! Failures never leave this module: out of memory kills the faulting
//! process, and only accounting corruption halts the kernel.

use core::fmt;

use crate::mm::address::{PhysFrame, VirtAddr};
use crate::mm::frame::FrameAllocator;
use crate::mm::paging::MappingError;
use crate::mm::refcount::FrameRefTable;
use crate::mm::space::{AddressSpace, CowResolution};
use crate::process::Process;

/// Fault class derived from the page table state at the faulting address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// No entry, address below the declared size.
    Growth,
    /// Present user page with Writable clear.
    CopyOnWrite,
    /// Outside every legal region.
    Illegal,
    /// Entry already writable: the hardware should never raise this.
    Spurious,
}

/// Why the fault handler killed a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    IllegalAddress,
    OutOfMemory,
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalAddress => write!(f, "illegal address"),
            Self::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

/// Result of handling one fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A zeroed frame now backs the page.
    Grown(PhysFrame),
    /// A copy-on-write page was made writable.
    Resolved(CowResolution),
    /// The process was marked killed.
    Killed(KillReason),
    /// The process has no address space left.
    Ignored,
}

/// Classify a fault at `va` without modifying the page table.
pub fn classify(space: &AddressSpace, va: VirtAddr) -> FaultClass {
    if va.is_kernel() {
        return FaultClass::Illegal;
    }
    match space.translate(va) {
        None if va.as_usize() < space.size() => FaultClass::Growth,
        None => FaultClass::Illegal,
        Some(entry) if entry.is_writable() => FaultClass::Spurious,
        Some(entry) if entry.is_present() && entry.is_user() => FaultClass::CopyOnWrite,
        Some(_) => FaultClass::Illegal,
    }
}

/// Handle a page fault taken by `process` at `va`.
///
/// # Panics
/// Panics on a fault against an already writable entry, or when the
/// reference table disagrees with the page table.
pub fn handle_page_fault<A: FrameAllocator + ?Sized>(
    process: &mut Process,
    va: VirtAddr,
    refs: &FrameRefTable,
    allocator: &A,
) -> FaultOutcome {
    let Some(space) = process.space_mut() else {
        return FaultOutcome::Ignored;
    };

    let class = classify(space, va);
    log::trace!("[page fault] {} classified {:?}", va, class);

    let result = match class {
        FaultClass::Growth => match space.map_zeroed(va, refs, allocator) {
            Ok(frame) => {
                space.reload();
                Ok(FaultOutcome::Grown(frame))
            }
            Err(err) => Err(kill_reason(err)),
        },
        FaultClass::CopyOnWrite => space
            .break_cow(va, refs, allocator)
            .map(FaultOutcome::Resolved)
            .map_err(kill_reason),
        FaultClass::Illegal => Err(KillReason::IllegalAddress),
        FaultClass::Spurious => {
            panic!("page fault at {} on already writable page", va)
        }
    };

    match result {
        Ok(outcome) => outcome,
        Err(reason) => {
            log::warn!(
                "[page fault] {} at {}, killing pid {} ({})",
                reason,
                va,
                process.pid(),
                process.name()
            );
            process.kill();
            FaultOutcome::Killed(reason)
        }
    }
}

fn kill_reason(err: MappingError) -> KillReason {
    match err {
        MappingError::OutOfMemory => KillReason::OutOfMemory,
        _ => KillReason::IllegalAddress,
    }
}
