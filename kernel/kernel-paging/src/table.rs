//! Page tables and per-level index types.
//!
//! The four index newtypes keep levels from being mixed up at compile time;
//! each extracts its own 9-bit field from a canonical virtual address.

use crate::entry::PageEntry;
use kernel_addresses::VirtualAddress;

/// Entries per table at every level.
pub const ENTRY_COUNT: usize = 512;

macro_rules! level_index {
    ($name:ident, $shift:expr, $doc:expr) => {
        #[doc = $doc]
        #[repr(transparent)]
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
        pub struct $name(u16);

        impl $name {
            /// Extract the index from a canonical virtual address.
            #[inline]
            #[must_use]
            pub const fn from(va: VirtualAddress) -> Self {
                Self::new(((va.as_u64() >> $shift) & 0x1FF) as u16)
            }

            /// Construct from a raw value; asserts `v < 512` in debug builds.
            #[inline]
            #[must_use]
            pub const fn new(v: u16) -> Self {
                debug_assert!(v < 512);
                Self(v)
            }

            /// The index as `usize` for table access.
            #[inline]
            #[must_use]
            pub const fn as_usize(self) -> usize {
                self.0 as usize
            }
        }
    };
}

level_index!(L4Index, 39, "Index into the root table (PML4), VA bits `[47:39]`.");
level_index!(L3Index, 30, "Index into a PDPT, VA bits `[38:30]`.");
level_index!(L2Index, 21, "Index into a page directory, VA bits `[29:21]`.");
level_index!(L1Index, 12, "Index into a page table, VA bits `[20:12]`.");

/// Split a virtual address into its four level indices (root to leaf).
#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (L4Index, L3Index, L2Index, L1Index) {
    (
        L4Index::from(va),
        L3Index::from(va),
        L2Index::from(va),
        L1Index::from(va),
    )
}

/// One page table: 512 entries, exactly one 4 KiB frame, frame-aligned.
///
/// The same layout serves all four levels; which level a table belongs to
/// is a property of where the walk found it, not of the type.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; ENTRY_COUNT],
}

impl PageTable {
    /// A fully zeroed table (all entries non-present).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageEntry::new(); ENTRY_COUNT],
        }
    }

    /// Clear every entry.
    #[inline]
    pub fn zero(&mut self) {
        self.entries = [PageEntry::new(); ENTRY_COUNT];
    }

    /// Read the entry at `index`.
    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> PageEntry {
        self.entries[index]
    }

    /// Write the entry at `index`.
    ///
    /// Plain store; TLB maintenance for active mappings is the caller's
    /// concern.
    #[inline]
    pub const fn set(&mut self, index: usize, e: PageEntry) {
        self.entries[index] = e;
    }
}

const _: () = {
    assert!(size_of::<PageTable>() == 4096);
    assert!(align_of::<PageTable>() == 4096);
    assert!(size_of::<PageEntry>() == 8);
};
