//! User memory access through the page table
//!
//! The kernel touches user memory the way the MMU would: one page at a
//! time, translating through the process's page table. A missing entry,
//! or a write to a read-only one, raises a page fault that runs the fault
//! handler before the access is retried. Copy-on-write and lazy growth
//! are therefore exercised by every access made here.

use core::fmt;

use crate::fault::FaultOutcome;
use crate::mm::address::{PhysFrame, VirtAddr, PAGE_SIZE};
use crate::mm::frame::FrameAllocator;
use crate::process::Process;
use crate::vm::Vm;

/// Faults taken on a single page before the access is declared stuck.
const MAX_FAULTS_PER_PAGE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    /// The process is killed, or was killed by a fault during the access.
    Killed,
    /// The process's address space has been released.
    NoAddressSpace,
    /// The range wraps around the address space.
    InvalidAddress,
}

impl fmt::Display for AccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Killed => write!(f, "process killed"),
            Self::NoAddressSpace => write!(f, "no address space"),
            Self::InvalidAddress => write!(f, "invalid user range"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

impl<A: FrameAllocator> Vm<A> {
    /// Copy `data` into user memory at `va`.
    pub fn write_user(&self, process: &mut Process, va: VirtAddr, data: &[u8]) -> Result<(), AccessError> {
        let mut done = 0;
        for_each_page(va, data.len(), |addr, len| {
            let frame = self.resolve(process, addr, Access::Write)?;
            self.memory().write_frame(frame, addr.page_offset(), &data[done..done + len]);
            done += len;
            Ok(())
        })
    }

    /// Copy user memory at `va` into `buf`.
    pub fn read_user(&self, process: &mut Process, va: VirtAddr, buf: &mut [u8]) -> Result<(), AccessError> {
        let mut done = 0;
        let total = buf.len();
        for_each_page(va, total, |addr, len| {
            let frame = self.resolve(process, addr, Access::Read)?;
            self.memory().read_frame(frame, addr.page_offset(), &mut buf[done..done + len]);
            done += len;
            Ok(())
        })
    }

    /// Set `len` bytes of user memory at `va` to `byte`.
    pub fn fill_user(&self, process: &mut Process, va: VirtAddr, len: usize, byte: u8) -> Result<(), AccessError> {
        let pattern = [byte; PAGE_SIZE];
        for_each_page(va, len, |addr, len| {
            let frame = self.resolve(process, addr, Access::Write)?;
            self.memory().write_frame(frame, addr.page_offset(), &pattern[..len]);
            Ok(())
        })
    }

    /// Translate `addr` for `access`, faulting until the entry allows it.
    fn resolve(&self, process: &mut Process, addr: VirtAddr, access: Access) -> Result<PhysFrame, AccessError> {
        for _ in 0..=MAX_FAULTS_PER_PAGE {
            let space = process.space().ok_or(AccessError::NoAddressSpace)?;
            if process.is_killed() {
                return Err(AccessError::Killed);
            }

            match space.translate(addr) {
                Some(entry)
                    if entry.is_present()
                        && entry.is_user()
                        && (access == Access::Read || entry.is_writable()) =>
                {
                    return Ok(entry.frame());
                }
                _ => {}
            }

            log::trace!("[uaccess] {:?} fault at {}", access, addr);
            match self.handle_fault(process, addr) {
                FaultOutcome::Killed(_) => return Err(AccessError::Killed),
                FaultOutcome::Ignored => return Err(AccessError::NoAddressSpace),
                FaultOutcome::Grown(_) | FaultOutcome::Resolved(_) => {}
            }
        }
        panic!("{:?} access at {} still faulting after {} faults", access, addr, MAX_FAULTS_PER_PAGE)
    }
}

/// Split `[va, va + len)` at page boundaries and visit each piece.
fn for_each_page<F>(va: VirtAddr, len: usize, mut visit: F) -> Result<(), AccessError>
where
    F: FnMut(VirtAddr, usize) -> Result<(), AccessError>,
{
    let start = va.as_usize();
    let end = start.checked_add(len).ok_or(AccessError::InvalidAddress)?;
    let mut addr = start;
    while addr < end {
        let chunk = (PAGE_SIZE - (addr % PAGE_SIZE)).min(end - addr);
        visit(VirtAddr::new(addr), chunk)?;
        addr += chunk;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GrowthPolicy, VmConfig};
    use crate::mm::address::KERNEL_BASE;
    use crate::process::ProcessState;

    fn lazy_vm(frames: usize) -> Vm {
        Vm::new(VmConfig::new().with_frames(frames).with_growth(GrowthPolicy::Lazy)).unwrap()
    }

    #[test]
    fn test_read_faults_in_zero_pages() {
        let vm = lazy_vm(16);
        let mut p = vm.spawn("reader").unwrap();
        vm.grow_address_space(&mut p, 3 * PAGE_SIZE as isize).unwrap();
        assert_eq!(p.space().unwrap().mapped().count(), 0);

        let mut buf = [0xFFu8; 64];
        vm.read_user(&mut p, VirtAddr::new(PAGE_SIZE - 32), &mut buf).unwrap();
        assert_eq!(buf, [0u8; 64]);
        assert_eq!(p.space().unwrap().mapped().count(), 2);
    }

    #[test]
    fn test_write_spans_pages() {
        let vm = lazy_vm(16);
        let mut p = vm.spawn("writer").unwrap();
        vm.grow_address_space(&mut p, 2 * PAGE_SIZE as isize).unwrap();

        let data: Vec<u8> = (0..=255u8).cycle().take(PAGE_SIZE + 10).collect();
        vm.write_user(&mut p, VirtAddr::new(5), &data).unwrap();

        let mut back = vec![0u8; data.len()];
        vm.read_user(&mut p, VirtAddr::new(5), &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_fill_user() {
        let vm = lazy_vm(16);
        let mut p = vm.spawn("fill").unwrap();
        vm.grow_address_space(&mut p, 2 * PAGE_SIZE as isize).unwrap();
        vm.fill_user(&mut p, VirtAddr::new(0), 2 * PAGE_SIZE, b'A').unwrap();

        let mut buf = [0u8; 3];
        vm.read_user(&mut p, VirtAddr::new(2 * PAGE_SIZE - 3), &mut buf).unwrap();
        assert_eq!(&buf, b"AAA");
    }

    #[test]
    fn test_access_beyond_size_kills() {
        let vm = lazy_vm(16);
        let mut p = vm.spawn("oob").unwrap();
        vm.grow_address_space(&mut p, PAGE_SIZE as isize).unwrap();

        assert_eq!(
            vm.write_user(&mut p, VirtAddr::new(PAGE_SIZE - 1), b"ab"),
            Err(AccessError::Killed)
        );
        assert_eq!(p.state(), ProcessState::KillPending);
        // Nothing more gets through once killed.
        let mut byte = [0u8];
        assert_eq!(vm.read_user(&mut p, VirtAddr::new(PAGE_SIZE - 1), &mut byte), Err(AccessError::Killed));
    }

    #[test]
    fn test_kernel_address_kills() {
        let vm = lazy_vm(16);
        let mut p = vm.spawn("kernel").unwrap();
        let mut byte = [0u8];
        assert_eq!(vm.read_user(&mut p, VirtAddr::new(KERNEL_BASE), &mut byte), Err(AccessError::Killed));
        assert!(p.is_killed());
    }

    #[test]
    fn test_wrapping_range_rejected() {
        let vm = lazy_vm(16);
        let mut p = vm.spawn("wrap").unwrap();
        assert_eq!(
            vm.fill_user(&mut p, VirtAddr::new(usize::MAX - 1), 4, 0),
            Err(AccessError::InvalidAddress)
        );
        assert!(!p.is_killed());
    }

    #[test]
    fn test_released_space() {
        let vm = lazy_vm(16);
        let mut p = vm.spawn("gone").unwrap();
        vm.exit(&mut p);
        assert_eq!(vm.write_user(&mut p, VirtAddr::new(0), b"x"), Err(AccessError::NoAddressSpace));
        assert_eq!(vm.write_user(&mut p, VirtAddr::new(0), b""), Ok(()));
    }
}
