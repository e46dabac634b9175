//! Process lifecycle as seen by the VM core
//!
//! Termination is deferred: the fault path only marks a process
//! `KillPending`, and the scheduler reaps it at its next checkpoint
//! (see [`Vm::checkpoint`](crate::vm::Vm::checkpoint)).

use alloc::string::String;

use crate::mm::space::AddressSpace;

/// Process identifier.
pub type Pid = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Runnable; user accesses proceed.
    Running,
    /// Killed; stops at the next checkpoint.
    KillPending,
    /// Reaped; the address space is gone.
    Terminated,
}

pub struct Process {
    pid: Pid,
    parent: Option<Pid>,
    name: String,
    state: ProcessState,
    space: Option<AddressSpace>,
}

impl Process {
    pub(crate) fn new(pid: Pid, parent: Option<Pid>, name: String, space: AddressSpace) -> Self {
        Self {
            pid,
            parent,
            name,
            state: ProcessState::Running,
            space: Some(space),
        }
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[inline]
    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn state(&self) -> ProcessState {
        self.state
    }

    #[inline]
    pub fn is_killed(&self) -> bool {
        self.state != ProcessState::Running
    }

    /// Mark the process killed. It keeps its address space until reaped.
    pub fn kill(&mut self) {
        if self.state == ProcessState::Running {
            self.state = ProcessState::KillPending;
        }
    }

    pub(crate) fn terminate(&mut self) -> Option<AddressSpace> {
        self.state = ProcessState::Terminated;
        self.space.take()
    }

    #[inline]
    pub fn space(&self) -> Option<&AddressSpace> {
        self.space.as_ref()
    }

    #[inline]
    pub fn space_mut(&mut self) -> Option<&mut AddressSpace> {
        self.space.as_mut()
    }

    /// Declared size of the address space, 0 once released.
    pub fn size(&self) -> usize {
        self.space.as_ref().map_or(0, AddressSpace::size)
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("size", &self.size())
            .finish()
    }
}
