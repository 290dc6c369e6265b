//! # Virtual Memory Manager
//!
//! Per-domain virtual address spaces: a bounded range of canonical
//! addresses, a sorted list of the regions handed out so far, and the
//! page-table root that backs them. One [`AddressSpace`] exists for the
//! kernel (canonical upper half) and one per user task (canonical lower
//! half).
//!
//! Region allocation mirrors the physical allocator's policy — first fit,
//! ascending order — applied to the *gaps* between tracked regions. Each
//! region is backed by one physically contiguous run from the PMM and
//! mapped page by page through [`kernel_paging::PageMapper`].
//!
//! There is deliberately no virtual-region free operation: virtual space
//! of a departed task dies with its table tree, and kernel regions live
//! forever.
//!
//! Not internally synchronized; the design assumes a single CPU with no
//! concurrent callers.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod address_space;
pub mod bootstrap;

pub use crate::address_space::{AddressSpace, MAX_REGIONS_PER_SPACE, VmRegion};

use kernel_addresses::VirtualAddress;
use kernel_paging::MapError;
use kernel_pmm::FreeError;

/// Region allocation failed.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum RegionAllocError {
    /// Zero-page regions are never valid.
    #[error("zero-page region requested")]
    ZeroPages,
    /// No gap in the virtual range is large enough. Virtual space is
    /// never reclaimed, so this is permanent for the given size.
    #[error("no virtual gap of {page_count} pages")]
    NoVirtualSpace { page_count: u64 },
    /// The PMM had no contiguous run of the required length. Regions are
    /// backed by a single physical run; fragmentation can starve large
    /// requests even when enough total memory is free.
    #[error("no contiguous physical run of {page_count} frames")]
    NoPhysicalRun { page_count: u64 },
    /// The per-space region table is full.
    #[error("address space already tracks its maximum of {capacity} regions")]
    TooManyRegions { capacity: usize },
    /// Page-table growth ran out of frames; the partially built mapping
    /// was torn down and the run returned to the PMM.
    #[error("mapping failed: {0}")]
    MapFailed(MapError),
    /// Returning the run to the PMM after a mapping failure itself
    /// failed — the allocator state is inconsistent; treat as fatal.
    #[error("rollback failed: {0}")]
    RollbackFailed(FreeError),
}

/// Invalid region registration.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum RegionError {
    /// The start address is not page-aligned.
    #[error("region start {0} is not page-aligned")]
    Misaligned(VirtualAddress),
    /// Zero-page regions are never valid.
    #[error("zero-page region at {0}")]
    ZeroPages(VirtualAddress),
    /// The region does not fit the space's address range.
    #[error("region at {0} lies outside the address space range")]
    OutOfRange(VirtualAddress),
    /// The region intersects one already tracked.
    #[error("region at {0} overlaps an existing region at {1}")]
    Overlap(VirtualAddress, VirtualAddress),
    /// The per-space region table is full.
    #[error("address space already tracks its maximum of {capacity} regions")]
    TooManyRegions { capacity: usize },
}
