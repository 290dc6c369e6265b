//! Region bookkeeping and allocation for one address space.

use crate::{RegionAllocError, RegionError};
use kernel_addresses::{FRAME_SIZE, PhysMapper, PhysicalFrame, VirtualAddress};
use kernel_bootinfo::layout;
use kernel_paging::{AccessFlags, AccessMode, PageMapper};
use kernel_pmm::PhysicalMemoryManager;

/// Capacity of the per-space region table. Kernel spaces carry a handful
/// of fixed regions plus per-task stacks; user spaces carry image
/// segments, stacks, and heaps.
pub const MAX_REGIONS_PER_SPACE: usize = 64;

/// A contiguous run of virtual pages with uniform permissions.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VmRegion {
    /// Page-aligned base.
    pub start: VirtualAddress,
    /// Length in 4 KiB pages.
    pub page_count: u64,
    /// Uniform access rights of every page in the run.
    pub access: AccessFlags,
}

impl VmRegion {
    /// Exclusive end of the region.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.start.as_u64() + self.page_count * FRAME_SIZE)
    }
}

/// One privilege domain's virtual address space.
///
/// Tracks a bounded canonical range, the sorted and non-overlapping
/// regions handed out within it, and the physical root of the page-table
/// tree that backs them.
pub struct AddressSpace {
    min: VirtualAddress,
    max: VirtualAddress,
    root: PhysicalFrame,
    mode: AccessMode,
    regions: heapless::Vec<VmRegion, MAX_REGIONS_PER_SPACE>,
}

impl AddressSpace {
    /// The kernel's space: the canonical upper half, supervisor-only.
    #[must_use]
    pub fn kernel(root: PhysicalFrame) -> Self {
        Self::with_range(
            root,
            VirtualAddress::new(layout::KERNEL_SPACE_BASE),
            VirtualAddress::new(layout::KERNEL_SPACE_END),
            AccessMode::Supervisor,
        )
    }

    /// A task's space: the canonical lower half, user-accessible.
    #[must_use]
    pub fn user(root: PhysicalFrame) -> Self {
        Self::with_range(
            root,
            VirtualAddress::new(layout::USER_SPACE_BASE),
            VirtualAddress::new(layout::USER_SPACE_END),
            AccessMode::User,
        )
    }

    /// A space over an arbitrary `[min, max)` range.
    #[must_use]
    pub fn with_range(
        root: PhysicalFrame,
        min: VirtualAddress,
        max: VirtualAddress,
        mode: AccessMode,
    ) -> Self {
        debug_assert!(min.is_page_aligned() && max.is_page_aligned());
        debug_assert!(min < max);
        Self {
            min,
            max,
            root,
            mode,
            regions: heapless::Vec::new(),
        }
    }

    /// Physical root of the backing table tree (the CR3 value for this
    /// domain).
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalFrame {
        self.root
    }

    /// The privilege domain mappings in this space belong to.
    #[inline]
    #[must_use]
    pub const fn mode(&self) -> AccessMode {
        self.mode
    }

    /// The tracked regions, ascending by address.
    #[inline]
    #[must_use]
    pub fn regions(&self) -> &[VmRegion] {
        &self.regions
    }

    /// First-fit scan of the gaps between regions (and the range ends).
    ///
    /// Returns the insertion index and base address of the first gap that
    /// holds `bytes`.
    fn find_gap(&self, bytes: u64) -> Option<(usize, VirtualAddress)> {
        let mut cursor = self.min;
        for (index, region) in self.regions.iter().enumerate() {
            if region.start.as_u64() - cursor.as_u64() >= bytes {
                return Some((index, cursor));
            }
            cursor = region.end();
        }
        if self.max.as_u64() - cursor.as_u64() >= bytes {
            Some((self.regions.len(), cursor))
        } else {
            None
        }
    }

    /// Allocate a `page_count`-page region, back it with one contiguous
    /// physical run, and map it.
    ///
    /// The virtual gap is found first (no physical allocation when the
    /// space is exhausted). If mapping fails midway, the pages mapped so
    /// far are unmapped and the run is returned to the PMM — no partial
    /// region is ever left behind.
    ///
    /// # Errors
    /// See [`RegionAllocError`]. Exhaustion (virtual or physical) is
    /// recoverable; the caller decides what failing to build, say, a task
    /// stack means.
    pub fn allocate_region<M: PhysMapper, T: PhysMapper>(
        &mut self,
        pmm: &mut PhysicalMemoryManager<M>,
        tables: &T,
        page_count: u64,
        access: AccessFlags,
    ) -> Result<VirtualAddress, RegionAllocError> {
        if page_count == 0 {
            return Err(RegionAllocError::ZeroPages);
        }
        let bytes = page_count
            .checked_mul(FRAME_SIZE)
            .ok_or(RegionAllocError::NoVirtualSpace { page_count })?;
        let (index, start) = self
            .find_gap(bytes)
            .ok_or(RegionAllocError::NoVirtualSpace { page_count })?;
        if self.regions.is_full() {
            return Err(RegionAllocError::TooManyRegions {
                capacity: MAX_REGIONS_PER_SPACE,
            });
        }

        let phys = pmm
            .alloc(page_count)
            .ok_or(RegionAllocError::NoPhysicalRun { page_count })?;

        let mapper = PageMapper::new(tables, self.root);
        let mut mapped = 0;
        for i in 0..page_count {
            match mapper.map_page(pmm, start + i * FRAME_SIZE, phys + i * FRAME_SIZE, access, self.mode)
            {
                Ok(()) => mapped += 1,
                Err(e) => {
                    // Tear the partial mapping down and give the run back.
                    if mapped > 0 {
                        let _ = mapper.unmap_region(start, mapped);
                    }
                    return match pmm.free(phys, page_count) {
                        Ok(()) => Err(RegionAllocError::MapFailed(e)),
                        Err(fe) => Err(RegionAllocError::RollbackFailed(fe)),
                    };
                }
            }
        }

        let region = VmRegion {
            start,
            page_count,
            access,
        };
        // Capacity checked above; insertion at `index` keeps the list sorted.
        let _ = self.regions.insert(index, region);
        log::debug!(
            "vmm: allocated {page_count}-page region at {start} backed by {phys}"
        );
        Ok(start)
    }

    /// Register a region that is already mapped by other means (the
    /// kernel image and bootstrap stack, the recursive window).
    ///
    /// Pure bookkeeping: no frames are allocated and no tables touched.
    /// The region merely becomes invisible to
    /// [`allocate_region`](Self::allocate_region)'s gap scan.
    ///
    /// # Errors
    /// See [`RegionError`]; the list is untouched on error.
    pub fn add_existing_region(
        &mut self,
        start: VirtualAddress,
        page_count: u64,
        access: AccessFlags,
    ) -> Result<(), RegionError> {
        if !start.is_page_aligned() {
            return Err(RegionError::Misaligned(start));
        }
        if page_count == 0 {
            return Err(RegionError::ZeroPages(start));
        }
        let end = page_count
            .checked_mul(FRAME_SIZE)
            .and_then(|bytes| start.checked_add(bytes))
            .ok_or(RegionError::OutOfRange(start))?;
        if start < self.min || end > self.max {
            return Err(RegionError::OutOfRange(start));
        }

        let mut index = self.regions.len();
        for (i, region) in self.regions.iter().enumerate() {
            if start < region.end() && region.start < end {
                return Err(RegionError::Overlap(start, region.start));
            }
            if end <= region.start {
                index = i;
                break;
            }
        }

        self.regions
            .insert(
                index,
                VmRegion {
                    start,
                    page_count,
                    access,
                },
            )
            .map_err(|_| RegionError::TooManyRegions {
                capacity: MAX_REGIONS_PER_SPACE,
            })?;
        Ok(())
    }
}
