//! # Page Table Core
//!
//! x86-64 4-level paging structures and the algorithms that mutate them.
//! This crate owns the pure data-structure side of virtual memory: it walks
//! and grows one page-table tree, but never decides *which* frames back a
//! mapping — frames come from a [`FrameProvider`] callback and table memory
//! is reached through the [`PhysMapper`] seam.
//!
//! ## Virtual address → physical address walk
//!
//! Each canonical 48-bit virtual address divides into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The four 9-bit fields index four levels of tables (512 entries of 8
//! bytes each, one 4 KiB frame per table):
//!
//! ```text
//! PML4 → PDPT → PD → PT → physical frame
//! ```
//!
//! Every mapping in this kernel is a 4 KiB leaf at the PT level; huge pages
//! are out of scope. A non-present entry at any of the first three levels
//! is filled on demand with a freshly allocated, zeroed table.
//!
//! ## Addressing table memory
//!
//! Intermediate tables are named by physical frame but must be read and
//! written through virtual addresses. Two strategies are supported:
//!
//! - a [`PhysMapper`] that offset-translates physical addresses (identity
//!   at early boot, the kernel's physical window later), used by
//!   [`PageMapper`];
//! - the [`recursive`] self-mapping trick, which reserves one root index so
//!   that the translation hardware itself can address any table at any
//!   depth without allocating.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod entry;
mod mapper;
pub mod recursive;
mod table;

pub use crate::entry::PageEntry;
pub use crate::mapper::PageMapper;
pub use crate::table::{L1Index, L2Index, L3Index, L4Index, PageTable, split_indices};

use kernel_addresses::{PhysicalAddress, PhysicalFrame, VirtualAddress, VirtualPage};
pub use kernel_addresses::{PhysMapper, FRAME_SIZE};

bitflags::bitflags! {
    /// Software-level access rights of a mapping.
    ///
    /// x86-64 has no read bit; `READ` is implied by presence and kept here
    /// so region bookkeeping can express intent. `WRITE` maps to the
    /// writable bit, absence of `EXECUTE` sets no-execute.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct AccessFlags: u8 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// Privilege domain a mapping belongs to.
///
/// Selects the user/supervisor bit across the whole walk: user mappings
/// need it set at every level, supervisor mappings at none.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AccessMode {
    /// Ring 0 only.
    Supervisor,
    /// Accessible from ring 3.
    User,
}

/// Source of physical 4 KiB frames for page tables.
///
/// The implementation decides where frames come from (the physical memory
/// manager at runtime, a bump pool in tests). Returned frames are owned by
/// the table tree from then on; `None` means out of memory.
pub trait FrameProvider {
    /// Allocate one frame. Must be 4 KiB-aligned.
    fn alloc_frame(&mut self) -> Option<PhysicalFrame>;
}

/// Failed to grow the table tree.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    /// The [`FrameProvider`] ran dry while allocating an intermediate table.
    #[error("out of physical frames while extending page tables")]
    OutOfFrames,
}

/// Failed to remove a mapping.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum UnmapError {
    /// No present 4 KiB leaf at the given page.
    #[error("no mapping at {0}")]
    NotMapped(VirtualAddress),
}

/// Read the physical frame of the currently active root table from CR3.
///
/// # Safety
/// Must run at CPL0 with paging enabled.
#[cfg(target_arch = "x86_64")]
#[inline]
pub unsafe fn active_root() -> PhysicalFrame {
    let cr3: u64;
    unsafe {
        core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
    }
    PhysicalFrame::containing(PhysicalAddress::new(cr3))
}

/// Load CR3 with `root`, switching the active address space.
///
/// # Safety
/// The tree under `root` must map the currently executing code and stack;
/// all non-global TLB entries are discarded.
#[cfg(target_arch = "x86_64")]
#[inline]
pub unsafe fn activate(root: PhysicalFrame) {
    let cr3 = root.base().as_u64();
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
    }
}

/// Invalidate the TLB entry for one page on this CPU.
///
/// # Safety
/// Callers must issue this after changing an *active* mapping; harmless
/// otherwise.
#[cfg(target_arch = "x86_64")]
#[inline]
pub unsafe fn invalidate_page(page: VirtualPage) {
    let va = page.base().as_u64();
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
    }
}
