//! # Boot Information and Memory Layout
//!
//! Types for the platform memory map handed over by the bootstrap
//! collaborator, plus the fixed virtual-memory layout constants shared by
//! the rest of the memory subsystem.
//!
//! The memory map is an ordered sequence of [`MemoryMapEntry`] records,
//! ascending by address, possibly with gaps between consecutive entries.
//! The physical memory manager treats gaps exactly like explicit
//! [`RegionKind::Reserved`] entries.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod layout;

use core::fmt;
use kernel_addresses::{FRAME_SIZE, PhysicalAddress};

/// Classification of one memory-map entry.
///
/// Only [`Free`](RegionKind::Free) frames are ever handed to the frame
/// allocator. Everything else is live before the allocator exists (kernel
/// image, stacks, loaded user code) or permanently unusable (firmware
/// reservations), and is excluded from the free list forever.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum RegionKind {
    /// Usable conventional memory.
    Free,
    /// Firmware-reserved; never usable.
    Reserved,
    /// The kernel's executable image.
    KernelCode,
    /// The kernel's writable data and BSS.
    KernelData,
    /// The bootstrap kernel stack.
    KernelStack,
    /// User-mode code loaded before the allocator was up.
    UserCode,
}

impl RegionKind {
    /// `true` for frames the allocator may own.
    #[inline]
    #[must_use]
    pub const fn is_free(self) -> bool {
        matches!(self, Self::Free)
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Free => "free",
            Self::Reserved => "reserved",
            Self::KernelCode => "kernel code",
            Self::KernelData => "kernel data",
            Self::KernelStack => "kernel stack",
            Self::UserCode => "user code",
        };
        f.write_str(s)
    }
}

/// One entry of the platform memory map.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryMapEntry {
    /// Frame-aligned start of the region.
    pub start: PhysicalAddress,
    /// Length in 4 KiB frames.
    pub frame_count: u64,
    /// What the region holds.
    pub kind: RegionKind,
}

impl MemoryMapEntry {
    #[inline]
    #[must_use]
    pub const fn new(start: PhysicalAddress, frame_count: u64, kind: RegionKind) -> Self {
        Self {
            start,
            frame_count,
            kind,
        }
    }

    /// Exclusive end of the region.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.start.as_u64() + self.frame_count * FRAME_SIZE)
    }
}
