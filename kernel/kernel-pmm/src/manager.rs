//! The frame allocator proper.

use crate::span::{self, FreeSpan, LIST_END};
use crate::{FreeError, InitError};
use kernel_addresses::{FRAME_SIZE, PhysMapper, PhysicalAddress, PhysicalFrame};
use kernel_bootinfo::MemoryMapEntry;
use kernel_paging::FrameProvider;

/// Capacity of the reserved-region table. Firmware maps on real machines
/// run a few dozen entries; init fails loudly if this is ever exceeded.
pub const MAX_RESERVED_REGIONS: usize = 128;

/// A physical range excluded from the free list forever — an explicit
/// firmware reservation, a region live before the allocator existed
/// (kernel image, stacks), or a gap between memory-map entries.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReservedRegion {
    /// Frame-aligned start.
    pub start: PhysicalAddress,
    /// Length in frames.
    pub frame_count: u64,
}

impl ReservedRegion {
    /// Exclusive end of the region.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.start.as_u64() + self.frame_count * FRAME_SIZE)
    }
}

/// Frame accounting snapshot.
///
/// `free + allocated + reserved == total` holds after every operation;
/// `total` is the frame count implied by the boot memory map, gaps
/// included.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MemoryStats {
    pub total_frames: u64,
    pub free_frames: u64,
    pub allocated_frames: u64,
    pub reserved_frames: u64,
}

/// Owner of all physical page frames.
///
/// An explicitly owned value, not a global: tests run several isolated
/// instances side by side, and a future multi-core port can wrap one in a
/// lock without touching this crate.
#[derive(Debug)]
pub struct PhysicalMemoryManager<M: PhysMapper> {
    mapper: M,
    /// Base of the lowest free span, or [`LIST_END`].
    head: PhysicalAddress,
    reserved: heapless::Vec<ReservedRegion, MAX_RESERVED_REGIONS>,
    /// Exclusive end of the highest free region seen at init; `free`
    /// rejects anything at or beyond this.
    max_physical: PhysicalAddress,
    stats: MemoryStats,
}

impl<M: PhysMapper> PhysicalMemoryManager<M> {
    /// Build the free list from the platform memory map.
    ///
    /// Walks the entries in order: `Free` entries are appended to the list
    /// (merged with the previous span when exactly adjacent); every other
    /// kind, and every positive gap between consecutive entries, becomes a
    /// [`ReservedRegion`]. Memory below the first entry is reserved as
    /// well, so no untracked range can ever be freed into the list.
    ///
    /// # Errors
    /// [`InitError::UnsortedMap`] when entries are not ascending,
    /// [`InitError::TooManyReservedRegions`] when the reservation table
    /// overflows. Both leave the map unusable; there is no partial init.
    pub fn init(mapper: M, map: &[MemoryMapEntry]) -> Result<Self, InitError> {
        let mut pmm = Self {
            mapper,
            head: LIST_END,
            reserved: heapless::Vec::new(),
            max_physical: PhysicalAddress::zero(),
            stats: MemoryStats::default(),
        };

        // Base of the last span so far, for adjacency merging and linking.
        let mut tail = LIST_END;
        let mut previous_end = PhysicalAddress::zero();

        for entry in map {
            if entry.start < previous_end {
                return Err(InitError::UnsortedMap {
                    entry: entry.start,
                    previous_end,
                });
            }
            if entry.start > previous_end {
                // Implicit gap; treated exactly like an explicit reservation.
                let gap_frames = (entry.start.as_u64() - previous_end.as_u64()) / FRAME_SIZE;
                pmm.reserve(previous_end, gap_frames)?;
            }

            if entry.kind.is_free() {
                let end = entry.end();
                if tail != LIST_END && span::read_span(&pmm.mapper, tail).end(tail) == entry.start {
                    // Adjacent to the previous free entry: one longer span.
                    let mut tail_span = span::read_span(&pmm.mapper, tail);
                    tail_span.frame_count += entry.frame_count;
                    span::write_span(&pmm.mapper, tail, tail_span);
                } else {
                    span::write_span(
                        &pmm.mapper,
                        entry.start,
                        FreeSpan {
                            frame_count: entry.frame_count,
                            next: LIST_END,
                        },
                    );
                    if tail == LIST_END {
                        pmm.head = entry.start;
                    } else {
                        span::set_span_next(&pmm.mapper, tail, entry.start);
                    }
                    tail = entry.start;
                }
                pmm.stats.free_frames += entry.frame_count;
                pmm.max_physical = end;
            } else {
                pmm.reserve(entry.start, entry.frame_count)?;
            }

            pmm.stats.total_frames += entry.frame_count
                + (entry.start.as_u64() - previous_end.as_u64()) / FRAME_SIZE;
            previous_end = entry.end();
        }

        log::info!(
            "pmm: {} frames tracked ({} free, {} reserved), top of memory {}",
            pmm.stats.total_frames,
            pmm.stats.free_frames,
            pmm.stats.reserved_frames,
            pmm.max_physical,
        );
        Ok(pmm)
    }

    fn reserve(&mut self, start: PhysicalAddress, frame_count: u64) -> Result<(), InitError> {
        if frame_count == 0 {
            return Ok(());
        }
        self.reserved
            .push(ReservedRegion { start, frame_count })
            .map_err(|_| InitError::TooManyReservedRegions {
                capacity: MAX_RESERVED_REGIONS,
            })?;
        self.stats.reserved_frames += frame_count;
        Ok(())
    }

    /// Allocate `frame_count` physically contiguous frames.
    ///
    /// First-fit in ascending address order: the first span large enough
    /// wins. An exact-size span is spliced out; a larger one is consumed
    /// from its head, with the remainder span rewritten at
    /// `base + frame_count * 4096`.
    ///
    /// Returns `None` when no single span fits (even if the *sum* of free
    /// frames would), and for `frame_count == 0`. Never an error:
    /// exhaustion is an ordinary outcome for the caller to handle.
    ///
    /// The returned frames contain the stale span header; callers that
    /// care must zero them.
    pub fn alloc(&mut self, frame_count: u64) -> Option<PhysicalAddress> {
        if frame_count == 0 {
            return None;
        }

        let mut prev = LIST_END;
        let mut current = self.head;
        while current != LIST_END {
            let current_span = span::read_span(&self.mapper, current);
            if current_span.frame_count < frame_count {
                prev = current;
                current = current_span.next;
                continue;
            }

            let successor = if current_span.frame_count == frame_count {
                current_span.next
            } else {
                // Consume the head of the span; the remainder keeps its place.
                let remainder = current + frame_count * FRAME_SIZE;
                span::write_span(
                    &self.mapper,
                    remainder,
                    FreeSpan {
                        frame_count: current_span.frame_count - frame_count,
                        next: current_span.next,
                    },
                );
                remainder
            };
            if prev == LIST_END {
                self.head = successor;
            } else {
                span::set_span_next(&self.mapper, prev, successor);
            }

            self.stats.free_frames -= frame_count;
            self.stats.allocated_frames += frame_count;
            log::trace!("pmm: alloc {frame_count} frames at {current}");
            return Some(current);
        }

        log::debug!("pmm: no contiguous run of {frame_count} frames");
        None
    }

    /// Return `frame_count` frames starting at `addr` to the free list.
    ///
    /// The range is validated before any state changes: alignment, count,
    /// the tracked-memory bound, reserved regions, and overlap with memory
    /// that is already free. Insertion then applies exactly one of five
    /// cases — standalone node, merge into the left neighbor, merge with
    /// the right neighbor, bridge both (three-way merge), or first node of
    /// an empty list — so the list stays ordered and fully coalesced.
    ///
    /// # Errors
    /// See [`FreeError`]; every variant is an integrity violation the
    /// caller must treat as fatal. The list is untouched on error.
    pub fn free(&mut self, addr: PhysicalAddress, frame_count: u64) -> Result<(), FreeError> {
        if !addr.is_frame_aligned() {
            return Err(FreeError::Misaligned { addr });
        }
        if frame_count == 0 {
            return Err(FreeError::ZeroFrames { addr });
        }
        let end = frame_count
            .checked_mul(FRAME_SIZE)
            .and_then(|bytes| addr.checked_add(bytes))
            .ok_or(FreeError::OutOfRange {
                addr,
                frame_count,
                limit: self.max_physical,
            })?;
        if end > self.max_physical {
            return Err(FreeError::OutOfRange {
                addr,
                frame_count,
                limit: self.max_physical,
            });
        }
        for region in &self.reserved {
            if addr < region.end() && region.start < end {
                return Err(FreeError::ReservedOverlap {
                    addr,
                    frame_count,
                    region_start: region.start,
                    region_frames: region.frame_count,
                });
            }
        }

        // Locate the insertion point: `prev` is the last span below `addr`,
        // `current` the first at or above it.
        let mut prev = LIST_END;
        let mut current = self.head;
        while current != LIST_END && current < addr {
            let current_span = span::read_span(&self.mapper, current);
            if current_span.end(current) > addr {
                return Err(FreeError::AlreadyFree {
                    addr,
                    frame_count,
                    span: current,
                });
            }
            prev = current;
            current = current_span.next;
        }
        if current != LIST_END && current < end {
            return Err(FreeError::AlreadyFree {
                addr,
                frame_count,
                span: current,
            });
        }

        let merges_left =
            prev != LIST_END && span::read_span(&self.mapper, prev).end(prev) == addr;
        let merges_right = current != LIST_END && current == end;

        match (merges_left, merges_right) {
            (true, true) => {
                // The freed range bridges both neighbors into one span.
                let mut left = span::read_span(&self.mapper, prev);
                let right = span::read_span(&self.mapper, current);
                left.frame_count += frame_count + right.frame_count;
                left.next = right.next;
                span::write_span(&self.mapper, prev, left);
            }
            (true, false) => {
                let mut left = span::read_span(&self.mapper, prev);
                left.frame_count += frame_count;
                span::write_span(&self.mapper, prev, left);
            }
            (false, true) => {
                // Absorb the right neighbor into a node at the new base.
                let right = span::read_span(&self.mapper, current);
                span::write_span(
                    &self.mapper,
                    addr,
                    FreeSpan {
                        frame_count: frame_count + right.frame_count,
                        next: right.next,
                    },
                );
                self.link_after(prev, addr);
            }
            (false, false) => {
                span::write_span(
                    &self.mapper,
                    addr,
                    FreeSpan {
                        frame_count,
                        next: current,
                    },
                );
                self.link_after(prev, addr);
            }
        }

        self.stats.free_frames += frame_count;
        self.stats.allocated_frames -= frame_count;
        log::trace!("pmm: free {frame_count} frames at {addr}");
        Ok(())
    }

    fn link_after(&mut self, prev: PhysicalAddress, node: PhysicalAddress) {
        if prev == LIST_END {
            self.head = node;
        } else {
            span::set_span_next(&self.mapper, prev, node);
        }
    }

    /// Frame accounting snapshot.
    #[inline]
    #[must_use]
    pub const fn stats(&self) -> MemoryStats {
        self.stats
    }

    /// Exclusive upper bound of tracked physical memory.
    #[inline]
    #[must_use]
    pub const fn max_physical_address(&self) -> PhysicalAddress {
        self.max_physical
    }

    /// The regions permanently excluded from the free list.
    #[inline]
    #[must_use]
    pub fn reserved_regions(&self) -> &[ReservedRegion] {
        &self.reserved
    }

    /// Iterate over the free spans as `(base, frame_count)`, ascending.
    #[inline]
    pub fn free_spans(&self) -> SpanIter<'_, M> {
        SpanIter {
            pmm: self,
            next: self.head,
        }
    }

    /// Log the current free-list layout at debug level.
    pub fn dump_free_list(&self) {
        for (base, frames) in self.free_spans() {
            log::debug!("pmm:   span {base} + {frames} frames");
        }
    }
}

impl PhysicalMemoryManager<crate::DirectMapper> {
    /// Feed the kernel's physical-window base back into the manager once
    /// paging is enabled, so span headers keep resolving after the
    /// firmware identity mapping disappears.
    pub fn set_physical_window_base(&mut self, base: u64) {
        self.mapper.set_base(base);
        log::info!("pmm: physical window rebased to 0x{base:016X}");
    }
}

/// Page-table frames come from the same allocator, one frame at a time.
impl<M: PhysMapper> FrameProvider for PhysicalMemoryManager<M> {
    fn alloc_frame(&mut self) -> Option<PhysicalFrame> {
        self.alloc(1).map(PhysicalFrame::from_addr)
    }
}

/// Iterator over the free list; see
/// [`PhysicalMemoryManager::free_spans`].
pub struct SpanIter<'p, M: PhysMapper> {
    pmm: &'p PhysicalMemoryManager<M>,
    next: PhysicalAddress,
}

impl<M: PhysMapper> Iterator for SpanIter<'_, M> {
    type Item = (PhysicalAddress, u64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == LIST_END {
            return None;
        }
        let base = self.next;
        let node = span::read_span(&self.pmm.mapper, base);
        self.next = node.next;
        Some((base, node.frame_count))
    }
}
