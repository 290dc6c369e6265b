//! In-place free-span headers.
//!
//! A free run of physical memory carries its own bookkeeping: the first
//! bytes of the run hold a [`FreeSpan`] header. The header is dead the
//! moment the run is allocated — nothing in this module hands out a
//! reference that could outlive the node's presence on the list.

use kernel_addresses::{PhysMapper, PhysicalAddress};

/// List terminator. Physical address 0 is a legal span base (the memory
/// map may start at frame 0), so null cannot terminate the list.
pub(crate) const LIST_END: PhysicalAddress = PhysicalAddress::MAX;

/// Header written at the first bytes of every free run.
///
/// ```text
/// +--------------------+--------------------------------+
/// | FreeSpan (header)  |  rest of the free run          |
/// +--------------------+--------------------------------+
/// ^ run base           (frame_count * 4096 bytes total)
/// ```
///
/// Invariants maintained by the manager:
/// - spans are linked in strictly ascending address order;
/// - no two spans are adjacent (adjacency is always coalesced);
/// - `frame_count >= 1`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct FreeSpan {
    /// Length of the run in 4 KiB frames, header included.
    pub frame_count: u64,
    /// Physical base of the next span, or [`LIST_END`].
    pub next: PhysicalAddress,
}

impl FreeSpan {
    /// Exclusive physical end of the run described by a span at `base`.
    #[inline]
    pub(crate) fn end(&self, base: PhysicalAddress) -> PhysicalAddress {
        base + self.frame_count * kernel_addresses::FRAME_SIZE
    }
}

/// Copy the span header out of physical memory.
#[inline]
pub(crate) fn read_span<M: PhysMapper>(mapper: &M, at: PhysicalAddress) -> FreeSpan {
    debug_assert!(at.is_frame_aligned());
    // SAFETY: `at` is the base of a run currently on the free list, which
    // the manager owns exclusively; the mapper covers all tracked memory.
    unsafe { *mapper.phys_to_mut::<FreeSpan>(at) }
}

/// Write a span header into physical memory.
#[inline]
pub(crate) fn write_span<M: PhysMapper>(mapper: &M, at: PhysicalAddress, span: FreeSpan) {
    debug_assert!(at.is_frame_aligned());
    debug_assert!(span.frame_count >= 1);
    // SAFETY: as for `read_span`; the run is free, so scribbling a header
    // over its first bytes clobbers nothing live.
    unsafe {
        *mapper.phys_to_mut::<FreeSpan>(at) = span;
    }
}

/// Rewrite only the link field of the span at `at`.
#[inline]
pub(crate) fn set_span_next<M: PhysMapper>(mapper: &M, at: PhysicalAddress, next: PhysicalAddress) {
    let mut span = read_span(mapper, at);
    span.next = next;
    write_span(mapper, at, span);
}
