//! System call adapters
//!
//! Thin wrappers that turn the VM core's typed results into the return
//! conventions user space expects: a non-negative value on success, a
//! negative error code on failure.

use core::fmt;

use crate::mm::frame::FrameAllocator;
use crate::mm::paging::MappingError;
use crate::process::{Pid, Process};
use crate::vm::Vm;

/// System call error codes
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    /// No such process
    Esrch = -3,
    /// Out of memory
    Enomem = -12,
    /// Bad address
    Efault = -14,
    /// Invalid argument
    Einval = -22,
}

impl SyscallError {
    #[inline]
    pub fn code(self) -> i64 {
        self as i64
    }
}

impl From<MappingError> for SyscallError {
    fn from(err: MappingError) -> Self {
        match err {
            MappingError::OutOfMemory => Self::Enomem,
            MappingError::OutOfRange => Self::Einval,
            MappingError::InvalidAddress | MappingError::NotMapped => Self::Efault,
            MappingError::NoAddressSpace => Self::Esrch,
        }
    }
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Esrch => write!(f, "no such process"),
            Self::Enomem => write!(f, "out of memory"),
            Self::Efault => write!(f, "bad address"),
            Self::Einval => write!(f, "invalid argument"),
        }
    }
}

/// Grow or shrink the heap by `n` bytes.
///
/// # Returns
/// The size before the call, or a negative error code. A failed call
/// leaves the address space unchanged.
pub fn sys_sbrk<A: FrameAllocator>(vm: &Vm<A>, process: &mut Process, n: isize) -> i64 {
    match vm.grow_address_space(process, n) {
        Ok(old) => old as i64,
        Err(err) => {
            log::debug!("[sbrk] pid {}: sbrk({}) -> {}", process.pid(), n, err);
            SyscallError::from(err).code()
        }
    }
}

/// Create a child sharing the caller's memory copy-on-write.
pub fn sys_fork<A: FrameAllocator>(vm: &Vm<A>, parent: &mut Process) -> Result<Process, SyscallError> {
    vm.fork_address_space(parent).map_err(|err| {
        log::debug!("[fork] pid {}: fork failed: {}", parent.pid(), err);
        SyscallError::from(err)
    })
}

/// Print the page table of `process` to `sink`.
///
/// # Returns
/// 0 on success, `Efault` if the sink rejected the output.
pub fn sys_dumppagetable<A: FrameAllocator, W: fmt::Write + ?Sized>(
    vm: &Vm<A>,
    process: &Process,
    sink: &mut W,
) -> i64 {
    match vm.dump_address_space(process, sink) {
        Ok(()) => 0,
        Err(fmt::Error) => SyscallError::Efault.code(),
    }
}

/// [`sys_dumppagetable`] addressed by pid over a process table.
pub fn sys_dumppagetable_pid<A: FrameAllocator, W: fmt::Write + ?Sized>(
    vm: &Vm<A>,
    processes: &[Process],
    pid: Pid,
    sink: &mut W,
) -> i64 {
    match processes.iter().find(|p| p.pid() == pid) {
        Some(process) => sys_dumppagetable(vm, process, sink),
        None => SyscallError::Esrch.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::mm::address::{KERNEL_BASE, PAGE_SIZE};
    use crate::mm::dump::PageReport;

    fn vm(frames: usize) -> Vm {
        Vm::new(VmConfig::new().with_frames(frames)).unwrap()
    }

    #[test]
    fn test_sbrk_returns_old_size() {
        let vm = vm(32);
        let mut p = vm.spawn("sbrk").unwrap();
        assert_eq!(sys_sbrk(&vm, &mut p, 100), 0);
        assert_eq!(sys_sbrk(&vm, &mut p, 0), 100);
        assert_eq!(sys_sbrk(&vm, &mut p, -50), 100);
        assert_eq!(p.size(), 50);
    }

    #[test]
    fn test_sbrk_error_codes() {
        let vm = vm(4);
        let mut p = vm.spawn("sbrk").unwrap();
        assert_eq!(sys_sbrk(&vm, &mut p, -1), SyscallError::Einval.code());
        assert_eq!(sys_sbrk(&vm, &mut p, KERNEL_BASE as isize + 1), SyscallError::Einval.code());
        assert_eq!(sys_sbrk(&vm, &mut p, 8 * PAGE_SIZE as isize), SyscallError::Enomem.code());
        assert_eq!(p.size(), 0);
    }

    #[test]
    fn test_fork_out_of_memory() {
        // Directory, one table and one page leave nothing for a child.
        let vm = vm(3);
        let mut p = vm.spawn("parent").unwrap();
        sys_sbrk(&vm, &mut p, PAGE_SIZE as isize);
        assert_eq!(sys_fork(&vm, &mut p).err(), Some(SyscallError::Enomem));
        assert!(!p.is_killed());
    }

    #[test]
    fn test_dumppagetable_by_pid() {
        let vm = vm(32);
        let mut parent = vm.spawn("parent").unwrap();
        sys_sbrk(&vm, &mut parent, 2 * PAGE_SIZE as isize);
        let child = sys_fork(&vm, &mut parent).unwrap();
        let child_pid = child.pid();
        let table = [parent, child];

        let mut out = String::new();
        assert_eq!(sys_dumppagetable_pid(&vm, &table, child_pid, &mut out), 0);
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.first(), Some(&"START PAGE TABLE"));
        assert_eq!(lines.last(), Some(&"END PAGE TABLE"));
        let pages: Vec<PageReport> = lines[1..lines.len() - 1].iter().map(|l| l.parse().unwrap()).collect();
        assert_eq!(pages.len(), 2);
        assert!(pages.iter().all(|page| page.to_string().ends_with(&format!("P U - {:x}", page.frame.index()))));

        assert_eq!(sys_dumppagetable_pid(&vm, &table, 9999, &mut out), SyscallError::Esrch.code());
    }
}
