//! Region allocation and bootstrap against a simulated physical memory.
//!
//! Physical addresses in these tests are offsets into a 4 KiB-aligned
//! buffer; a `DirectMapper` based at the buffer turns them into usable
//! pointers, the same way the kernel's physical window does on hardware.

use kernel_addresses::{FRAME_SIZE, PhysicalAddress, VirtualAddress};
use kernel_bootinfo::{MemoryMapEntry, RegionKind, layout};
use kernel_paging::recursive::{self, TableLevel};
use kernel_paging::{AccessFlags, AccessMode, PageMapper};
use kernel_pmm::{DirectMapper, PhysicalMemoryManager};
use kernel_vmm::bootstrap::{self, KernelMemory};
use kernel_vmm::{AddressSpace, RegionAllocError};

struct TestRam {
    frames: Vec<Frame>,
}

#[repr(align(4096))]
struct Frame([u8; 4096]);

impl TestRam {
    fn with_frames(n: usize) -> Self {
        let mut frames = Vec::with_capacity(n);
        for _ in 0..n {
            frames.push(Frame([0u8; 4096]));
        }
        Self { frames }
    }

    fn mapper(&self) -> DirectMapper {
        DirectMapper::with_base(self.frames.as_ptr() as u64)
    }
}

fn pa(frame: u64) -> PhysicalAddress {
    PhysicalAddress::new(frame * FRAME_SIZE)
}

fn free_entry(start_frame: u64, frame_count: u64) -> MemoryMapEntry {
    MemoryMapEntry::new(pa(start_frame), frame_count, RegionKind::Free)
}

const RW: AccessFlags = AccessFlags::READ.union(AccessFlags::WRITE);
const KERNEL_BASE: u64 = 0xFFFF_8000_0000_0000;

/// A PMM over one free run plus an address space rooted in it.
fn setup(
    ram: &TestRam,
    frames: u64,
) -> (PhysicalMemoryManager<DirectMapper>, AddressSpace) {
    let mapper = ram.mapper();
    let mut pmm = PhysicalMemoryManager::init(mapper, &[free_entry(0, frames)]).unwrap();
    let tables = PageMapper::create(&mapper, &mut pmm).unwrap();
    let space = AddressSpace::with_range(
        tables.root(),
        VirtualAddress::new(KERNEL_BASE),
        VirtualAddress::new(KERNEL_BASE + (1 << 30)),
        AccessMode::Supervisor,
    );
    (pmm, space)
}

#[test]
fn regions_allocate_first_fit_and_are_mapped() {
    let ram = TestRam::with_frames(128);
    let (mut pmm, mut space) = setup(&ram, 128);
    let mapper = ram.mapper();

    let a = space.allocate_region(&mut pmm, &mapper, 4, RW).unwrap();
    let b = space.allocate_region(&mut pmm, &mapper, 2, RW).unwrap();
    assert_eq!(a.as_u64(), KERNEL_BASE);
    assert_eq!(b.as_u64(), KERNEL_BASE + 4 * FRAME_SIZE);

    // Every page of both regions is mapped, each region to one
    // physically contiguous run.
    let tables = PageMapper::new(&mapper, space.root());
    let base_a = tables.translate(a).unwrap();
    for i in 0..4 {
        assert_eq!(tables.translate(a + i * FRAME_SIZE), Some(base_a + i * FRAME_SIZE));
    }
    assert!(tables.translate(b).is_some());

    let starts: Vec<u64> = space.regions().iter().map(|r| r.start.as_u64()).collect();
    assert_eq!(starts, vec![a.as_u64(), b.as_u64()]);
}

#[test]
fn allocation_skips_registered_regions() {
    let ram = TestRam::with_frames(128);
    let (mut pmm, mut space) = setup(&ram, 128);
    let mapper = ram.mapper();

    // A pre-existing region two pages in leaves a two-page hole at the
    // bottom of the range.
    space
        .add_existing_region(VirtualAddress::new(KERNEL_BASE + 2 * FRAME_SIZE), 4, RW)
        .unwrap();

    // Too big for the hole: placed after the registered region.
    let big = space.allocate_region(&mut pmm, &mapper, 3, RW).unwrap();
    assert_eq!(big.as_u64(), KERNEL_BASE + 6 * FRAME_SIZE);

    // Fits the hole: first fit takes it.
    let small = space.allocate_region(&mut pmm, &mapper, 2, RW).unwrap();
    assert_eq!(small.as_u64(), KERNEL_BASE);

    let starts: Vec<u64> = space.regions().iter().map(|r| r.start.as_u64()).collect();
    assert!(starts.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn failed_mapping_leaves_no_partial_region() {
    // 517 frames: 1 root + a 513-frame backing run + 3 intermediate
    // tables. The 513th page starts a second page table, and that
    // allocation is the one that fails.
    let ram = TestRam::with_frames(517);
    let (mut pmm, mut space) = setup(&ram, 517);
    let mapper = ram.mapper();

    let err = space
        .allocate_region(&mut pmm, &mapper, 513, RW)
        .unwrap_err();
    assert!(matches!(err, RegionAllocError::MapFailed(_)));

    // No region was recorded and the backing run came back; only the
    // root and the tables grown during the attempt stay allocated.
    assert!(space.regions().is_empty());
    assert_eq!(pmm.stats().allocated_frames, 4);
    assert_eq!(pmm.stats().free_frames, 513);

    let tables = PageMapper::new(&mapper, space.root());
    assert_eq!(tables.translate(VirtualAddress::new(KERNEL_BASE)), None);

    // The tables grown during the failed attempt are still in the tree,
    // so a smaller allocation now succeeds without them.
    let va = space.allocate_region(&mut pmm, &mapper, 8, RW).unwrap();
    assert_eq!(va.as_u64(), KERNEL_BASE);
    assert!(tables.translate(va).is_some());
}

#[test]
fn exhausted_virtual_space_costs_no_frames() {
    let ram = TestRam::with_frames(64);
    let mapper = ram.mapper();
    let mut pmm = PhysicalMemoryManager::init(mapper, &[free_entry(0, 64)]).unwrap();
    let tables = PageMapper::create(&mapper, &mut pmm).unwrap();

    // A space of exactly four pages.
    let mut space = AddressSpace::with_range(
        tables.root(),
        VirtualAddress::new(KERNEL_BASE),
        VirtualAddress::new(KERNEL_BASE + 4 * FRAME_SIZE),
        AccessMode::Supervisor,
    );
    space.allocate_region(&mut pmm, &mapper, 4, RW).unwrap();

    let before = pmm.stats();
    let err = space.allocate_region(&mut pmm, &mapper, 1, RW).unwrap_err();
    assert_eq!(err, RegionAllocError::NoVirtualSpace { page_count: 1 });
    assert_eq!(pmm.stats(), before);
}

#[test]
fn user_space_starts_above_the_null_guard() {
    let ram = TestRam::with_frames(64);
    let mapper = ram.mapper();
    let mut pmm = PhysicalMemoryManager::init(mapper, &[free_entry(0, 64)]).unwrap();
    let tables = PageMapper::create(&mapper, &mut pmm).unwrap();

    let mut space = AddressSpace::user(tables.root());
    let va = space
        .allocate_region(&mut pmm, &mapper, 2, RW)
        .unwrap();
    assert_eq!(va.as_u64(), layout::USER_SPACE_BASE);
    assert!(PageMapper::new(&mapper, space.root()).translate(va).is_some());
}

/// Memory map of a small machine: low conventional memory, a firmware
/// hole, the kernel image at 1 MiB, then more conventional memory.
fn boot_map() -> [MemoryMapEntry; 6] {
    let image = layout::KERNEL_IMAGE_PHYS / FRAME_SIZE;
    [
        free_entry(0, 64),
        MemoryMapEntry::new(pa(64), 16, RegionKind::Reserved),
        MemoryMapEntry::new(pa(image), 2, RegionKind::KernelCode),
        MemoryMapEntry::new(pa(image + 2), 2, RegionKind::KernelData),
        MemoryMapEntry::new(pa(image + 4), 2, RegionKind::KernelStack),
        free_entry(image + 6, 58),
    ]
}

fn boot(ram: &TestRam) -> KernelMemory<DirectMapper> {
    bootstrap::init_kernel_memory(ram.mapper(), &boot_map()).unwrap()
}

#[test]
fn bootstrap_maps_the_kernel_image() {
    let image = layout::KERNEL_IMAGE_PHYS / FRAME_SIZE;
    let ram = TestRam::with_frames((image + 64) as usize);
    let mem = boot(&ram);
    let mapper = ram.mapper();

    let tables = PageMapper::new(&mapper, mem.kernel_space.root());
    // Code, data, and stack sit at the image window, offset by their
    // physical distance from the load address.
    for i in 0..6 {
        assert_eq!(
            tables.translate(VirtualAddress::new(layout::KERNEL_IMAGE_BASE + i * FRAME_SIZE)),
            Some(pa(image + i))
        );
    }
}

#[test]
fn bootstrap_maps_the_physical_window() {
    let image = layout::KERNEL_IMAGE_PHYS / FRAME_SIZE;
    let ram = TestRam::with_frames((image + 64) as usize);
    let mem = boot(&ram);
    let mapper = ram.mapper();

    let tables = PageMapper::new(&mapper, mem.kernel_space.root());
    for frame in [0, 63, image, image + 63] {
        assert_eq!(
            tables.translate(VirtualAddress::new(
                layout::PHYS_WINDOW_BASE + frame * FRAME_SIZE
            )),
            Some(pa(frame))
        );
    }
}

#[test]
fn bootstrap_installs_the_recursive_entry() {
    let image = layout::KERNEL_IMAGE_PHYS / FRAME_SIZE;
    let ram = TestRam::with_frames((image + 64) as usize);
    let mem = boot(&ram);
    let mapper = ram.mapper();

    let tables = PageMapper::new(&mapper, mem.kernel_space.root());
    let probe = VirtualAddress::new(layout::KERNEL_IMAGE_BASE);
    let root_va = recursive::table_address(TableLevel::Pml4, probe);
    assert_eq!(tables.translate(root_va), Some(mem.kernel_space.root().base()));
}

#[test]
fn bootstrap_registers_what_it_maps() {
    let image = layout::KERNEL_IMAGE_PHYS / FRAME_SIZE;
    let ram = TestRam::with_frames((image + 64) as usize);
    let mut mem = boot(&ram);
    let mapper = ram.mapper();

    // Image (3 entries), physical window, recursive window.
    assert_eq!(mem.kernel_space.regions().len(), 5);
    let starts: Vec<u64> = mem
        .kernel_space
        .regions()
        .iter()
        .map(|r| r.start.as_u64())
        .collect();
    assert!(starts.windows(2).all(|w| w[0] < w[1]));
    assert!(starts.contains(&layout::PHYS_WINDOW_BASE));
    assert!(starts.contains(&layout::KERNEL_IMAGE_BASE));

    // Later allocations land below every bootstrap window.
    let va = mem
        .kernel_space
        .allocate_region(&mut mem.pmm, &mapper, 4, RW)
        .unwrap();
    assert_eq!(va.as_u64(), layout::KERNEL_SPACE_BASE);

    // The frame ledger still balances after the whole dance.
    let s = mem.pmm.stats();
    assert_eq!(s.free_frames + s.allocated_frames + s.reserved_frames, s.total_frames);
}
