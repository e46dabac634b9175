//! VM core configuration
//!
//! Defaults describe a 512 MiB machine with a 2 GiB user address space.

use core::fmt;

use crate::mm::address::{KERNEL_BASE, PAGE_MASK};

/// Default size of the physical frame pool: 512 MiB of 4 KiB frames.
pub const DEFAULT_FRAMES: usize = 1 << 17;

/// Largest pool a 32-bit page table entry can address.
pub const MAX_FRAMES: usize = 1 << 20;

/// How explicit growth requests back new pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowthPolicy {
    /// Allocate, zero and map every new page immediately.
    Eager,
    /// Only move the declared size; pages are backed on first touch.
    Lazy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Frames in the physical pool.
    pub frames: usize,
    /// Policy for `sbrk`-style growth.
    pub growth: GrowthPolicy,
    /// Exclusive upper bound on any declared size.
    pub user_limit: usize,
}

impl VmConfig {
    pub const fn new() -> Self {
        Self {
            frames: DEFAULT_FRAMES,
            growth: GrowthPolicy::Eager,
            user_limit: KERNEL_BASE,
        }
    }

    pub const fn with_frames(mut self, frames: usize) -> Self {
        self.frames = frames;
        self
    }

    pub const fn with_growth(mut self, growth: GrowthPolicy) -> Self {
        self.growth = growth;
        self
    }

    pub const fn with_user_limit(mut self, user_limit: usize) -> Self {
        self.user_limit = user_limit;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frames == 0 {
            return Err(ConfigError::NoFrames);
        }
        if self.frames > MAX_FRAMES {
            return Err(ConfigError::TooManyFrames(self.frames));
        }
        if self.user_limit & PAGE_MASK != 0 {
            return Err(ConfigError::UnalignedLimit(self.user_limit));
        }
        if self.user_limit > KERNEL_BASE {
            return Err(ConfigError::LimitInKernel(self.user_limit));
        }
        Ok(())
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    NoFrames,
    TooManyFrames(usize),
    UnalignedLimit(usize),
    LimitInKernel(usize),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoFrames => write!(f, "frame pool is empty"),
            Self::TooManyFrames(n) => write!(f, "{} frames exceeds the {} a PTE can address", n, MAX_FRAMES),
            Self::UnalignedLimit(limit) => write!(f, "user limit {:#x} is not page aligned", limit),
            Self::LimitInKernel(limit) => write!(f, "user limit {:#x} reaches into the kernel region", limit),
        }
    }
}
