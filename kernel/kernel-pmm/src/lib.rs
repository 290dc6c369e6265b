//! # Physical Memory Manager
//!
//! Owns every physical page frame of the machine. Frames are handed out as
//! contiguous runs (first-fit, ascending address order) and reclaimed with
//! full coalescing, so the free list never contains two adjacent nodes.
//!
//! ## Free-list representation
//!
//! The allocator needs memory for its bookkeeping before any allocator
//! exists — the classic bootstrap problem. The way out is that free memory
//! describes itself: a small [`span::FreeSpan`] header (frame count + link
//! to the next free run) is written at the start of each free run. The
//! list costs nothing beyond the head pointer, and splitting/merging runs
//! is a handful of header rewrites.
//!
//! Span headers live in physical memory, which can only be dereferenced
//! through the current virtual mapping. All header access therefore goes
//! through the [`PhysMapper`](kernel_addresses::PhysMapper) seam: identity
//! at early boot, rebased to the
//! kernel's physical window once paging is live (see
//! [`PhysicalMemoryManager::set_physical_window_base`]). Raw pointers
//! never leak out of the span helpers, and a header is only ever read
//! while its run is on the list — `alloc` splices the run out before
//! returning the range to the caller.
//!
//! ## Failure policy
//!
//! Exhaustion is an ordinary outcome: [`PhysicalMemoryManager::alloc`]
//! returns `None` and the caller decides. Everything
//! [`PhysicalMemoryManager::free`] can reject, however, is an integrity
//! violation — freeing misaligned, out-of-range, reserved, or
//! already-free memory means some caller's idea of ownership is wrong,
//! and continuing would risk handing out live memory twice. Those come
//! back as typed [`FreeError`]s that callers must treat as fatal; the
//! crate itself never panics and never retries.
//!
//! Not internally synchronized; the design assumes a single CPU with no
//! concurrent callers.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod manager;
mod mapper;
mod span;

pub use crate::manager::{
    MAX_RESERVED_REGIONS, MemoryStats, PhysicalMemoryManager, ReservedRegion, SpanIter,
};
pub use crate::mapper::DirectMapper;

use kernel_addresses::PhysicalAddress;

/// The platform memory map was unusable.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum InitError {
    /// Entries must ascend by address and must not overlap.
    #[error("memory map entry at {entry} is below the end of its predecessor {previous_end}")]
    UnsortedMap {
        entry: PhysicalAddress,
        previous_end: PhysicalAddress,
    },
    /// The reserved-region table is full.
    #[error("too many reserved regions in the memory map (capacity {capacity})")]
    TooManyReservedRegions { capacity: usize },
}

/// An invalid `free` request. Any of these is an integrity violation: the
/// free list has *not* been modified, but the caller's ownership
/// accounting is broken and the kernel should halt rather than continue.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum FreeError {
    /// The address is not frame-aligned.
    #[error("free of misaligned address {addr}")]
    Misaligned { addr: PhysicalAddress },
    /// Zero-length frees are never valid.
    #[error("free of zero frames at {addr}")]
    ZeroFrames { addr: PhysicalAddress },
    /// The range ends beyond the tracked physical memory.
    #[error("free of {frame_count} frames at {addr} reaches past tracked memory end {limit}")]
    OutOfRange {
        addr: PhysicalAddress,
        frame_count: u64,
        limit: PhysicalAddress,
    },
    /// The range intersects a region excluded from the free list forever.
    #[error(
        "free of {frame_count} frames at {addr} overlaps reserved region at {region_start} \
         ({region_frames} frames)"
    )]
    ReservedOverlap {
        addr: PhysicalAddress,
        frame_count: u64,
        region_start: PhysicalAddress,
        region_frames: u64,
    },
    /// The range intersects memory that is already free (double free).
    #[error("free of {frame_count} frames at {addr} overlaps free span at {span}")]
    AlreadyFree {
        addr: PhysicalAddress,
        frame_count: u64,
        span: PhysicalAddress,
    },
}
