//! Recursive self-mapping of the page-table tree.
//!
//! Early in boot there is no general physical→virtual mapping, yet the
//! intermediate tables of the tree being built are named by physical frame
//! and must be read and written through virtual addresses. Reserving one
//! root index `R` and pointing it back at the root itself turns the
//! translation hardware into a table accessor: a synthetic address whose
//! top index is `R` short-circuits one level of the walk, so the "frame"
//! the hardware finally lands on *is* a page table.
//!
//! Per target depth the formula differs — `R` appears once to reach the PT
//! covering an address, twice for the PD, three times for the PDPT, four
//! times for the root itself:
//!
//! ```text
//! PT   of V:  [ R, L4(V), L3(V), L2(V) ]
//! PD   of V:  [ R,     R, L4(V), L3(V) ]
//! PDPT of V:  [ R,     R,     R, L4(V) ]
//! root     :  [ R,     R,     R,     R ]
//! ```
//!
//! This gives O(1), allocation-free access to any table at any depth, at
//! the permanent cost of one root slot (index [`RECURSIVE_INDEX`]): the
//! 512 GiB of virtual space under it can never hold ordinary mappings.
//! Address-space bookkeeping must keep that window off limits.

use crate::entry::PageEntry;
use crate::table::{PageTable, split_indices};
use kernel_addresses::{PhysMapper, PhysicalFrame, VirtualAddress};

/// Root-table slot permanently reserved for the self-reference.
///
/// Index 510 keeps the top slot (511, the kernel image half) and the rest
/// of the upper half usable.
pub const RECURSIVE_INDEX: u16 = 510;

/// Base of the virtual window consumed by the self-reference.
pub const RECURSIVE_WINDOW_BASE: VirtualAddress =
    VirtualAddress::canonical((RECURSIVE_INDEX as u64) << 39);

/// Pages covered by the self-reference window (512 GiB worth).
pub const RECURSIVE_WINDOW_PAGES: u64 = 1 << 27;

/// Depth of the table a synthetic address resolves to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TableLevel {
    /// The root table itself.
    Pml4,
    /// The L3 table covering an address.
    Pdpt,
    /// The L2 table covering an address.
    Pd,
    /// The L1 table covering an address.
    Pt,
}

/// Point `root[RECURSIVE_INDEX]` at `root` itself.
///
/// The entry is supervisor-only, writable, and no-execute: table memory is
/// data, never code. Call once per address space, before the first
/// recursive access.
pub fn install_recursive_entry<M: PhysMapper>(mapper: &M, root: PhysicalFrame) {
    // SAFETY: `root` is a live table frame owned by the caller's tree.
    let table = unsafe { mapper.phys_to_mut::<PageTable>(root.base()) };
    let mut e = PageEntry::new()
        .with_present(true)
        .with_writable(true)
        .with_no_execute(true);
    e.set_physical_address(root.base());
    table.set(RECURSIVE_INDEX as usize, e);
}

/// The synthetic virtual address that translates to the base of the table
/// at `level` covering `va`.
#[must_use]
pub const fn table_address(level: TableLevel, va: VirtualAddress) -> VirtualAddress {
    let r = RECURSIVE_INDEX as u64;
    let (i4, i3, i2, _) = split_indices(va);
    let (i4, i3, i2) = (i4.as_usize() as u64, i3.as_usize() as u64, i2.as_usize() as u64);

    let (a, b, c, d) = match level {
        TableLevel::Pt => (r, i4, i3, i2),
        TableLevel::Pd => (r, r, i4, i3),
        TableLevel::Pdpt => (r, r, r, i4),
        TableLevel::Pml4 => (r, r, r, r),
    };
    VirtualAddress::canonical((a << 39) | (b << 30) | (c << 21) | (d << 12))
}

/// The synthetic virtual address of the *entry* for `va` within the table
/// at `level` — [`table_address`] plus the in-table byte offset of the
/// relevant 8-byte entry.
#[must_use]
pub const fn entry_address(level: TableLevel, va: VirtualAddress) -> VirtualAddress {
    let (i4, i3, i2, i1) = split_indices(va);
    let index = match level {
        TableLevel::Pt => i1.as_usize(),
        TableLevel::Pd => i2.as_usize(),
        TableLevel::Pdpt => i3.as_usize(),
        TableLevel::Pml4 => i4.as_usize(),
    };
    VirtualAddress::new(table_address(level, va).as_u64() + (index as u64) * 8)
}
