//! Walking and growing one page-table tree.

use crate::entry::PageEntry;
use crate::table::{PageTable, split_indices};
use crate::{AccessFlags, AccessMode, FrameProvider, MapError, UnmapError};
use kernel_addresses::{FRAME_SIZE, PhysMapper, PhysicalAddress, PhysicalFrame, VirtualAddress};

/// Handle to a single page-table tree rooted at one PML4 frame.
///
/// The mapper owns no memory: table frames come from the [`FrameProvider`]
/// passed into each growing call, and table contents are reached through
/// the [`PhysMapper`]. Several `PageMapper`s over distinct roots describe
/// distinct address spaces.
///
/// Not internally synchronized; the design assumes a single CPU with no
/// concurrent callers.
pub struct PageMapper<'m, M: PhysMapper> {
    root: PhysicalFrame,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> PageMapper<'m, M> {
    /// Wrap an existing root frame.
    #[inline]
    #[must_use]
    pub const fn new(mapper: &'m M, root: PhysicalFrame) -> Self {
        Self { root, mapper }
    }

    /// Allocate and zero a fresh root table, returning its mapper.
    ///
    /// # Errors
    /// [`MapError::OutOfFrames`] if the provider is exhausted.
    pub fn create<A: FrameProvider>(mapper: &'m M, frames: &mut A) -> Result<Self, MapError> {
        let root = frames.alloc_frame().ok_or(MapError::OutOfFrames)?;
        let this = Self { root, mapper };
        this.table_mut(root).zero();
        Ok(this)
    }

    /// Physical frame of the root table (the value loaded into CR3).
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalFrame {
        self.root
    }

    /// Borrow the table stored in `frame` through the physical mapper.
    #[inline]
    fn table_mut(&self, frame: PhysicalFrame) -> &mut PageTable {
        // SAFETY: table frames are owned by this tree and reachable through
        // the mapper for the lifetime of the walk.
        unsafe { self.mapper.phys_to_mut::<PageTable>(frame.base()) }
    }

    /// Descend one level, allocating a zeroed table if the entry is absent.
    ///
    /// Present entries are widened so the intermediate level stays the
    /// least-restrictive union of every mapping below it.
    fn ensure_table<A: FrameProvider>(
        &self,
        frames: &mut A,
        table: &mut PageTable,
        index: usize,
        access: AccessFlags,
        mode: AccessMode,
    ) -> Result<PhysicalFrame, MapError> {
        let e = table.get(index);
        if e.present() {
            let widened = e.widened_for(access, mode);
            if widened.into_bits() != e.into_bits() {
                table.set(index, widened);
            }
            return Ok(e.frame());
        }
        let frame = frames.alloc_frame().ok_or(MapError::OutOfFrames)?;
        self.table_mut(frame).zero();
        table.set(index, PageEntry::non_leaf(frame, access, mode));
        log::trace!("paging: new table at {frame} (slot {index})");
        Ok(frame)
    }

    /// Install the mapping `va → pa` with the given rights.
    ///
    /// Missing intermediate tables are allocated on demand. An existing
    /// leaf at `va` is overwritten: remapping is explicit and idempotent.
    /// Both addresses must be frame-aligned (asserted in debug builds).
    ///
    /// # Errors
    /// [`MapError::OutOfFrames`] if an intermediate table cannot be
    /// allocated; already-created tables remain in place.
    pub fn map_page<A: FrameProvider>(
        &self,
        frames: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        access: AccessFlags,
        mode: AccessMode,
    ) -> Result<(), MapError> {
        debug_assert!(va.is_page_aligned(), "virtual address not page-aligned");
        debug_assert!(pa.is_frame_aligned(), "physical address not frame-aligned");

        let (i4, i3, i2, i1) = split_indices(va);

        let l4 = self.table_mut(self.root);
        let pdpt = self.ensure_table(frames, l4, i4.as_usize(), access, mode)?;
        let l3 = self.table_mut(pdpt);
        let pd = self.ensure_table(frames, l3, i3.as_usize(), access, mode)?;
        let l2 = self.table_mut(pd);
        let pt = self.ensure_table(frames, l2, i2.as_usize(), access, mode)?;

        self.table_mut(pt).set(
            i1.as_usize(),
            PageEntry::leaf(PhysicalFrame::from_addr(pa), access, mode),
        );
        Ok(())
    }

    /// Map `page_count` consecutive pages, both addresses advancing one
    /// frame per step.
    ///
    /// # Errors
    /// Fails like [`map_page`](Self::map_page); pages mapped before the
    /// failure stay mapped (the caller decides whether to roll back).
    pub fn map_region<A: FrameProvider>(
        &self,
        frames: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        page_count: u64,
        access: AccessFlags,
        mode: AccessMode,
    ) -> Result<(), MapError> {
        for i in 0..page_count {
            self.map_page(frames, va + i * FRAME_SIZE, pa + i * FRAME_SIZE, access, mode)?;
        }
        Ok(())
    }

    /// Map `page_count` pages so that virtual equals physical.
    ///
    /// Used while firmware identity mappings are still the only way to
    /// reach memory, and for the low window the paging switch runs on.
    ///
    /// # Errors
    /// Fails like [`map_region`](Self::map_region).
    pub fn identity_map_region<A: FrameProvider>(
        &self,
        frames: &mut A,
        pa: PhysicalAddress,
        page_count: u64,
        access: AccessFlags,
        mode: AccessMode,
    ) -> Result<(), MapError> {
        self.map_region(frames, VirtualAddress::new(pa.as_u64()), pa, page_count, access, mode)
    }

    /// Clear the leaf entries for `page_count` pages starting at `va`.
    ///
    /// Intermediate tables that become empty are *not* reclaimed; their
    /// frames stay allocated to the tree. Known limitation of this design,
    /// shared with `unmap`'s callers.
    ///
    /// # Errors
    /// [`UnmapError::NotMapped`] on the first page without a present leaf;
    /// earlier pages of the run remain unmapped.
    pub fn unmap_region(&self, va: VirtualAddress, page_count: u64) -> Result<(), UnmapError> {
        for i in 0..page_count {
            self.unmap_page(va + i * FRAME_SIZE)?;
        }
        Ok(())
    }

    fn unmap_page(&self, va: VirtualAddress) -> Result<(), UnmapError> {
        let (i4, i3, i2, i1) = split_indices(va);

        let e4 = self.table_mut(self.root).get(i4.as_usize());
        if !e4.present() {
            return Err(UnmapError::NotMapped(va));
        }
        let e3 = self.table_mut(e4.frame()).get(i3.as_usize());
        if !e3.present() {
            return Err(UnmapError::NotMapped(va));
        }
        let e2 = self.table_mut(e3.frame()).get(i2.as_usize());
        if !e2.present() {
            return Err(UnmapError::NotMapped(va));
        }
        let pt = self.table_mut(e2.frame());
        if !pt.get(i1.as_usize()).present() {
            return Err(UnmapError::NotMapped(va));
        }
        pt.set(i1.as_usize(), PageEntry::new());
        Ok(())
    }

    /// Software walk: translate `va` to the physical address it maps to.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let (i4, i3, i2, i1) = split_indices(va);

        let e4 = self.table_mut(self.root).get(i4.as_usize());
        if !e4.present() {
            return None;
        }
        let e3 = self.table_mut(e4.frame()).get(i3.as_usize());
        if !e3.present() {
            return None;
        }
        let e2 = self.table_mut(e3.frame()).get(i2.as_usize());
        if !e2.present() {
            return None;
        }
        let e1 = self.table_mut(e2.frame()).get(i1.as_usize());
        if !e1.present() {
            return None;
        }
        Some(e1.physical_address() + va.page_offset())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recursive::{self, TableLevel};

    /// A trivial bump provider: hands out the next 4 KiB frame of a fixed
    /// physical range, never reuses anything.
    struct BumpFrames {
        next: u64,
        end: u64,
    }

    impl BumpFrames {
        fn new(start: u64, end: u64) -> Self {
            Self { next: start, end }
        }
    }

    impl FrameProvider for BumpFrames {
        fn alloc_frame(&mut self) -> Option<PhysicalFrame> {
            if self.next + FRAME_SIZE > self.end {
                return None;
            }
            let f = PhysicalFrame::from_addr(PhysicalAddress::new(self.next));
            self.next += FRAME_SIZE;
            Some(f)
        }
    }

    /// Simulated physical memory: a boxed run of 4 KiB-aligned frames.
    /// Physical addresses are byte offsets from 0.
    #[repr(align(4096))]
    struct Aligned4K(core::cell::UnsafeCell<[u8; 4096]>);

    struct TestPhys {
        frames: Vec<Aligned4K>,
    }

    impl TestPhys {
        fn with_frames(n: usize) -> Self {
            let mut frames = Vec::with_capacity(n);
            for _ in 0..n {
                frames.push(Aligned4K(core::cell::UnsafeCell::new([0u8; 4096])));
            }
            Self { frames }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let idx = (pa.as_u64() >> 12) as usize;
            let off = (pa.as_u64() & 0xFFF) as usize;
            debug_assert_eq!(off, 0);
            let ptr = self.frames[idx].0.get().cast::<u8>();
            // SAFETY: the caller promises `T` matches the bytes in the frame.
            unsafe { &mut *(ptr.cast::<T>()) }
        }
    }

    const RW: AccessFlags = AccessFlags::READ.union(AccessFlags::WRITE);

    fn setup(frames: usize) -> (TestPhys, BumpFrames) {
        let phys = TestPhys::with_frames(frames);
        let alloc = BumpFrames::new(0, (frames as u64) << 12);
        (phys, alloc)
    }

    #[test]
    fn map_one_creates_tables_and_leaf() {
        let (phys, mut alloc) = setup(64);
        let pm = PageMapper::create(&phys, &mut alloc).unwrap();

        let va = VirtualAddress::new(0xFFFF_8000_0000_0000);
        let pa = PhysicalAddress::new(0x0003_0000);
        pm.map_page(&mut alloc, va, pa, RW, AccessMode::Supervisor)
            .expect("map_page");

        assert_eq!(pm.translate(va), Some(pa));
        assert_eq!(pm.translate(va + 0x123), Some(pa + 0x123));
        // The neighboring page is not mapped.
        assert_eq!(pm.translate(va + FRAME_SIZE), None);
    }

    #[test]
    fn remap_overwrites_leaf() {
        // Scenario: mapping V→P1 then V→P2 must translate V to P2.
        let (phys, mut alloc) = setup(64);
        let pm = PageMapper::create(&phys, &mut alloc).unwrap();

        let va = VirtualAddress::new(0x0000_0000_4000_0000);
        let p1 = PhysicalAddress::new(0x0001_0000);
        let p2 = PhysicalAddress::new(0x0002_0000);

        pm.map_page(&mut alloc, va, p1, RW, AccessMode::User).unwrap();
        assert_eq!(pm.translate(va), Some(p1));

        pm.map_page(&mut alloc, va, p2, RW, AccessMode::User).unwrap();
        assert_eq!(pm.translate(va), Some(p2));
    }

    #[test]
    fn intermediate_permissions_widen() {
        let (phys, mut alloc) = setup(64);
        let pm = PageMapper::create(&phys, &mut alloc).unwrap();

        // Supervisor read-only first; the shared PML4 entry starts narrow.
        let va1 = VirtualAddress::new(0x0000_0000_0000_1000);
        pm.map_page(
            &mut alloc,
            va1,
            PhysicalAddress::new(0x0001_0000),
            AccessFlags::READ,
            AccessMode::Supervisor,
        )
        .unwrap();

        let root = pm.table_mut(pm.root());
        let e4 = root.get(0);
        assert!(!e4.writable());
        assert!(!e4.user());

        // A user-writable-executable mapping below the same root entry
        // must widen it.
        let va2 = VirtualAddress::new(0x0000_0000_0020_0000);
        pm.map_page(
            &mut alloc,
            va2,
            PhysicalAddress::new(0x0002_0000),
            AccessFlags::READ | AccessFlags::WRITE | AccessFlags::EXECUTE,
            AccessMode::User,
        )
        .unwrap();

        let e4 = root.get(0);
        assert!(e4.writable());
        assert!(e4.user());
        assert!(!e4.no_execute());
    }

    #[test]
    fn map_region_advances_both_addresses() {
        let (phys, mut alloc) = setup(64);
        let pm = PageMapper::create(&phys, &mut alloc).unwrap();

        let va = VirtualAddress::new(0xFFFF_8000_0040_0000);
        let pa = PhysicalAddress::new(0x0010_0000);
        pm.map_region(&mut alloc, va, pa, 8, RW, AccessMode::Supervisor)
            .unwrap();

        for i in 0..8u64 {
            assert_eq!(
                pm.translate(va + i * FRAME_SIZE),
                Some(pa + i * FRAME_SIZE)
            );
        }
    }

    #[test]
    fn identity_map_translates_to_itself() {
        let (phys, mut alloc) = setup(64);
        let pm = PageMapper::create(&phys, &mut alloc).unwrap();

        let pa = PhysicalAddress::new(0x0008_0000);
        pm.identity_map_region(&mut alloc, pa, 4, RW, AccessMode::Supervisor)
            .unwrap();
        assert_eq!(pm.translate(VirtualAddress::new(pa.as_u64())), Some(pa));
    }

    #[test]
    fn unmap_clears_leaves_but_keeps_tables() {
        let (phys, mut alloc) = setup(64);
        let pm = PageMapper::create(&phys, &mut alloc).unwrap();

        let va = VirtualAddress::new(0xFFFF_8000_0000_0000);
        let pa = PhysicalAddress::new(0x0003_0000);
        pm.map_region(&mut alloc, va, pa, 2, RW, AccessMode::Supervisor)
            .unwrap();
        pm.unmap_region(va, 2).unwrap();

        assert_eq!(pm.translate(va), None);
        // The intermediate chain is still present (tables are not
        // reclaimed), so remapping consumes no new frames.
        let before = alloc.next;
        pm.map_page(&mut alloc, va, pa, RW, AccessMode::Supervisor).unwrap();
        assert_eq!(alloc.next, before);
    }

    #[test]
    fn unmap_of_absent_mapping_fails() {
        let (phys, mut alloc) = setup(64);
        let pm = PageMapper::create(&phys, &mut alloc).unwrap();

        let va = VirtualAddress::new(0x0000_0000_5000_0000);
        assert_eq!(pm.unmap_region(va, 1), Err(UnmapError::NotMapped(va)));
    }

    #[test]
    fn map_fails_when_provider_is_exhausted() {
        // Room for the root plus one intermediate table only.
        let (phys, _alloc) = setup(64);
        let mut tiny = BumpFrames::new(0, 2 * FRAME_SIZE);
        let pm = PageMapper::create(&phys, &mut tiny).unwrap();

        let va = VirtualAddress::new(0xFFFF_8000_0000_0000);
        let err = pm.map_page(
            &mut tiny,
            va,
            PhysicalAddress::new(0x0003_0000),
            RW,
            AccessMode::Supervisor,
        );
        assert_eq!(err, Err(MapError::OutOfFrames));
    }

    #[test]
    fn recursive_entry_resolves_covering_tables() {
        // Scenario: with the recursive entry installed, the synthetic
        // address {R, L4(V), L3(V), L2(V)} translates to the physical base
        // of the page table covering V.
        let (phys, mut alloc) = setup(64);
        let pm = PageMapper::create(&phys, &mut alloc).unwrap();
        recursive::install_recursive_entry(&phys, pm.root());

        let va = VirtualAddress::new(0xFFFF_8000_1234_5000);
        let pa = PhysicalAddress::new(0x0003_0000);
        pm.map_page(&mut alloc, va, pa, RW, AccessMode::Supervisor)
            .unwrap();

        // Walk down by hand to find the PT and PD frames.
        let (i4, i3, i2, _) = split_indices(va);
        let e4 = pm.table_mut(pm.root()).get(i4.as_usize());
        let e3 = pm.table_mut(e4.frame()).get(i3.as_usize());
        let e2 = pm.table_mut(e3.frame()).get(i2.as_usize());
        let pd_frame = e3.frame();
        let pt_frame = e2.frame();

        let pt_va = recursive::table_address(TableLevel::Pt, va);
        assert_eq!(pm.translate(pt_va), Some(pt_frame.base()));

        let pd_va = recursive::table_address(TableLevel::Pd, va);
        assert_eq!(pm.translate(pd_va), Some(pd_frame.base()));

        let pdpt_va = recursive::table_address(TableLevel::Pdpt, va);
        assert_eq!(pm.translate(pdpt_va), Some(e4.frame().base()));

        let root_va = recursive::table_address(TableLevel::Pml4, va);
        assert_eq!(pm.translate(root_va), Some(pm.root().base()));
    }
}
