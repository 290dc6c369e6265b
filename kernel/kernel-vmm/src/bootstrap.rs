//! One-shot construction of the kernel's memory subsystem.
//!
//! Runs once, early in boot, while the firmware identity mapping is still
//! active: builds the frame allocator from the platform memory map, grows
//! a fresh table tree with the kernel image, the physical window and the
//! recursive entry, and registers everything mapped along the way in the
//! kernel's [`AddressSpace`] so later allocations steer around it.
//!
//! The actual switch — loading the new root and rebasing the allocator's
//! physical window — is split out into [`enter_virtual_addressing`]
//! because it is irreversible and only meaningful on real hardware.

use crate::{AddressSpace, RegionError};
use kernel_addresses::{FRAME_SIZE, PhysMapper, PhysicalAddress, VirtualAddress};
use kernel_bootinfo::{MemoryMapEntry, RegionKind, layout};
use kernel_paging::recursive::{
    RECURSIVE_WINDOW_BASE, RECURSIVE_WINDOW_PAGES, install_recursive_entry,
};
use kernel_paging::{AccessFlags, AccessMode, MapError, PageMapper};
use kernel_pmm::{InitError, PhysicalMemoryManager};

/// Everything the kernel needs to manage memory after bootstrap.
pub struct KernelMemory<M: PhysMapper> {
    /// The frame allocator, owning all free physical memory.
    pub pmm: PhysicalMemoryManager<M>,
    /// The kernel's address space; its root is the tree built here.
    pub kernel_space: AddressSpace,
}

/// Bootstrap cannot continue; the machine has no usable memory subsystem.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum BootstrapError {
    #[error("frame allocator init failed: {0}")]
    Pmm(#[from] InitError),
    #[error("building the kernel table tree failed: {0}")]
    Map(#[from] MapError),
    #[error("registering a bootstrap region failed: {0}")]
    Region(#[from] RegionError),
}

/// Permissions a memory-map kind gets when mapped into the kernel image
/// window; `None` for kinds the kernel space does not map.
fn image_access(kind: RegionKind) -> Option<AccessFlags> {
    match kind {
        RegionKind::KernelCode => Some(AccessFlags::READ | AccessFlags::EXECUTE),
        RegionKind::KernelData | RegionKind::KernelStack => {
            Some(AccessFlags::READ | AccessFlags::WRITE)
        }
        RegionKind::Free | RegionKind::Reserved | RegionKind::UserCode => None,
    }
}

/// Build the physical allocator and the kernel address space from the
/// platform memory map.
///
/// On return the new table tree maps:
/// - each kernel image entry (code read-execute, data and stack
///   read-write) at `KERNEL_IMAGE_BASE + (pa − KERNEL_IMAGE_PHYS)`,
/// - all tracked physical memory read-write at `PHYS_WINDOW_BASE + pa`,
/// - the recursive entry at its root slot.
///
/// Nothing is activated; the firmware mapping stays live until
/// [`enter_virtual_addressing`].
///
/// # Errors
/// Any [`BootstrapError`] is fatal: a kernel without a frame allocator or
/// a complete table tree cannot run.
pub fn init_kernel_memory<M: PhysMapper + Copy>(
    mapper: M,
    map: &[MemoryMapEntry],
) -> Result<KernelMemory<M>, BootstrapError> {
    let mut pmm = PhysicalMemoryManager::init(mapper, map)?;
    let tables = PageMapper::create(&mapper, &mut pmm)?;
    let mut kernel_space = AddressSpace::kernel(tables.root());

    for entry in map {
        let Some(access) = image_access(entry.kind) else {
            continue;
        };
        debug_assert!(entry.start.as_u64() >= layout::KERNEL_IMAGE_PHYS);
        let va = VirtualAddress::new(
            layout::KERNEL_IMAGE_BASE + (entry.start.as_u64() - layout::KERNEL_IMAGE_PHYS),
        );
        tables.map_region(
            &mut pmm,
            va,
            entry.start,
            entry.frame_count,
            access,
            AccessMode::Supervisor,
        )?;
        kernel_space.add_existing_region(va, entry.frame_count, access)?;
    }

    // Physical window: every tracked frame at a fixed offset. This is what
    // keeps free-list headers and page tables reachable once the firmware
    // identity mapping is gone.
    let window_pages = pmm.max_physical_address().as_u64() / FRAME_SIZE;
    let rw = AccessFlags::READ | AccessFlags::WRITE;
    tables.map_region(
        &mut pmm,
        VirtualAddress::new(layout::PHYS_WINDOW_BASE),
        PhysicalAddress::zero(),
        window_pages,
        rw,
        AccessMode::Supervisor,
    )?;
    kernel_space.add_existing_region(
        VirtualAddress::new(layout::PHYS_WINDOW_BASE),
        window_pages,
        rw,
    )?;

    install_recursive_entry(&mapper, tables.root());
    kernel_space.add_existing_region(RECURSIVE_WINDOW_BASE, RECURSIVE_WINDOW_PAGES, rw)?;

    let stats = pmm.stats();
    log::info!(
        "memory subsystem up: root {}, {} regions registered, {} of {} frames free",
        kernel_space.root(),
        kernel_space.regions().len(),
        stats.free_frames,
        stats.total_frames,
    );
    Ok(KernelMemory { pmm, kernel_space })
}

/// Switch to the bootstrap table tree and rebase the allocator onto the
/// physical window.
///
/// Irreversible. After this the firmware identity mapping is dead: every
/// physical access goes through `PHYS_WINDOW_BASE + pa`.
///
/// # Safety
/// The tree rooted at `mem.kernel_space.root()` must map the currently
/// executing code, the stack, and the physical window exactly as
/// [`init_kernel_memory`] built them.
#[cfg(target_arch = "x86_64")]
pub unsafe fn enter_virtual_addressing(mem: &mut KernelMemory<kernel_pmm::DirectMapper>) {
    // SAFETY: forwarded to the caller.
    unsafe { kernel_paging::activate(mem.kernel_space.root()) };
    mem.pmm.set_physical_window_base(layout::PHYS_WINDOW_BASE);
}
