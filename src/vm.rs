//! The VM core as consumed by the scheduler and syscall layer
//!
//! [`Vm`] owns the physical frame pool and the frame reference table, the
//! only state shared between address spaces, and threads them explicitly
//! through every operation. It is `Sync`: processes on different
//! execution units call into the same `Vm` concurrently, each with
//! exclusive access to its own [`Process`].

use alloc::string::String;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::config::{ConfigError, GrowthPolicy, VmConfig};
use crate::fault::{self, FaultOutcome};
use crate::mm::address::VirtAddr;
use crate::mm::dump;
use crate::mm::fork;
use crate::mm::frame::{FrameAllocator, PhysicalMemory};
use crate::mm::paging::MappingError;
use crate::mm::refcount::FrameRefTable;
use crate::mm::space::AddressSpace;
use crate::process::{Pid, Process, ProcessState};

pub struct Vm<A: FrameAllocator = PhysicalMemory> {
    config: VmConfig,
    memory: A,
    refs: FrameRefTable,
    next_pid: AtomicUsize,
}

impl Vm<PhysicalMemory> {
    /// Create a VM core over a fresh simulated frame pool.
    pub fn new(config: VmConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Self::with_allocator(config, PhysicalMemory::new(config.frames))
    }
}

impl<A: FrameAllocator> Vm<A> {
    /// Create a VM core over an existing frame allocator.
    ///
    /// `config.frames` is replaced by the allocator's pool size, which must
    /// be addressable by a page table entry.
    pub fn with_allocator(config: VmConfig, memory: A) -> Result<Self, ConfigError> {
        let config = config.with_frames(memory.total_frames());
        config.validate()?;
        let refs = FrameRefTable::new(memory.total_frames());
        log::debug!(
            "[vm] {} frames, user limit {:#x}, {:?} growth",
            memory.total_frames(),
            config.user_limit,
            config.growth
        );
        Ok(Self {
            config,
            memory,
            refs,
            next_pid: AtomicUsize::new(1),
        })
    }

    #[inline]
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    #[inline]
    pub fn memory(&self) -> &A {
        &self.memory
    }

    #[inline]
    pub fn refs(&self) -> &FrameRefTable {
        &self.refs
    }

    fn alloc_pid(&self) -> Pid {
        self.next_pid.fetch_add(1, Ordering::Relaxed)
    }

    /// Create a process with a fresh, empty address space.
    pub fn spawn(&self, name: &str) -> Result<Process, MappingError> {
        let space = AddressSpace::new(&self.memory)?;
        let pid = self.alloc_pid();
        log::debug!("[vm] spawn pid {} ({})", pid, name);
        Ok(Process::new(pid, None, String::from(name), space))
    }

    /// Trap entry for a page fault. May mark `process` killed.
    pub fn handle_fault(&self, process: &mut Process, addr: VirtAddr) -> FaultOutcome {
        fault::handle_page_fault(process, addr, &self.refs, &self.memory)
    }

    /// Resize the heap by `delta` bytes using the configured policy.
    /// Returns the previous size.
    pub fn grow_address_space(&self, process: &mut Process, delta: isize) -> Result<usize, MappingError> {
        self.grow_address_space_with(process, delta, self.config.growth)
    }

    /// Resize the heap by `delta` bytes with an explicit policy.
    pub fn grow_address_space_with(
        &self,
        process: &mut Process,
        delta: isize,
        policy: GrowthPolicy,
    ) -> Result<usize, MappingError> {
        let pid = process.pid();
        let space = process.space_mut().ok_or(MappingError::NoAddressSpace)?;
        let result = space.grow(delta, policy, self.config.user_limit, &self.refs, &self.memory);
        match result {
            Ok(old) => log::trace!("[sbrk] pid {}: {:#x} -> {:#x}", pid, old, space.size()),
            Err(err) => log::warn!("[sbrk] pid {}: grow by {} failed: {}", pid, delta, err),
        }
        result
    }

    /// Duplicate `parent`'s address space copy-on-write into a new process.
    pub fn fork_address_space(&self, parent: &mut Process) -> Result<Process, MappingError> {
        let parent_pid = parent.pid();
        let name = String::from(parent.name());
        let space = parent.space_mut().ok_or(MappingError::NoAddressSpace)?;
        let child_space = fork::duplicate(space, &self.refs, &self.memory)?;

        let pid = self.alloc_pid();
        log::debug!("[fork] parent={}, child={}", parent_pid, pid);
        Ok(Process::new(pid, Some(parent_pid), name, child_space))
    }

    /// Unmap and dereference every page of `process`.
    pub fn release_address_space(&self, process: &mut Process) {
        if let Some(space) = process.terminate() {
            log::debug!(
                "[vm] release pid {}: {} pages",
                process.pid(),
                space.mapped().count()
            );
            space.release(&self.refs, &self.memory);
        }
    }

    /// Write the page table dump of `process` to `out`.
    pub fn dump_address_space<W: fmt::Write + ?Sized>(&self, process: &Process, out: &mut W) -> fmt::Result {
        match process.space() {
            Some(space) => dump::dump(space, out),
            None => {
                writeln!(out, "{}", dump::DUMP_START)?;
                writeln!(out, "{}", dump::DUMP_END)
            }
        }
    }

    /// Normal process exit.
    pub fn exit(&self, process: &mut Process) {
        log::trace!("[vm] exit pid {}", process.pid());
        self.release_address_space(process);
    }

    /// Scheduler checkpoint on return to user mode: reap a killed process.
    pub fn checkpoint(&self, process: &mut Process) -> ProcessState {
        if process.state() == ProcessState::KillPending {
            log::debug!("[vm] reaping killed pid {} ({})", process.pid(), process.name());
            self.release_address_space(process);
        }
        process.state()
    }
}
