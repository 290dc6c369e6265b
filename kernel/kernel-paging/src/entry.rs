//! Page-table entry layout.
//!
//! One entry format serves all four levels: the PS bit (bit 7) is never
//! set because this kernel maps 4 KiB leaves only, and at the PT level the
//! same bit position would be PAT, which is likewise left clear.

use crate::{AccessFlags, AccessMode};
use bitfield_struct::bitfield;
use kernel_addresses::{PhysicalAddress, PhysicalFrame};

/// A 64-bit page-table entry, at any level.
///
/// - Bits 0‒8 are the hardware permission/status bits.
/// - Bits 51:12 hold the 40-bit frame number of the next-level table
///   (non-leaf) or of the mapped frame (PT leaf).
/// - Bit 63 is no-execute; it participates in permission intersection
///   across the walk, so non-leaf entries only set it when nothing below
///   executes.
#[bitfield(u64)]
pub struct PageEntry {
    /// Present (bit 0): the entry is valid.
    pub present: bool,

    /// Writable (bit 1): intersects with lower-level permissions.
    pub writable: bool,

    /// User/Supervisor (bit 2): ring-3 access allowed if set.
    pub user: bool,

    /// Page Write-Through (bit 3).
    pub write_through: bool,

    /// Page Cache Disable (bit 4).
    pub cache_disable: bool,

    /// Accessed (bit 5): set by the CPU on first access.
    pub accessed: bool,

    /// Dirty (bit 6): set by the CPU on first write (leaf only).
    pub dirty: bool,

    /// PS at L3/L2, PAT at L1. Always 0 here: 4 KiB leaves only.
    #[bits(1)]
    __ps_must_be_0: u8,

    /// Global (bit 8): TLB entry survives CR3 reload (leaf only).
    pub global: bool,

    /// OS-available (bits 9..11): not interpreted by hardware.
    #[bits(3)]
    pub os_available_low: u8,

    /// Frame number (bits 12..51): 4 KiB-aligned physical base >> 12.
    #[bits(40)]
    frame_51_12: u64,

    /// OS-available (bits 52..62): not interpreted by hardware.
    #[bits(11)]
    pub os_available_high: u16,

    /// No-Execute (bit 63): instruction fetch disallowed if set.
    pub no_execute: bool,
}

impl PageEntry {
    /// Physical base stored in the entry (4 KiB-aligned).
    #[inline]
    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_51_12() << 12)
    }

    /// The frame stored in the entry.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalFrame {
        PhysicalFrame::from_addr(self.physical_address())
    }

    /// Store a frame-aligned physical base.
    #[inline]
    pub const fn set_physical_address(&mut self, pa: PhysicalAddress) {
        debug_assert!(pa.is_frame_aligned());
        self.set_frame_51_12(pa.as_u64() >> 12);
    }

    /// A present leaf mapping `frame` with the given rights.
    ///
    /// `READ` is implied by presence; absence of `EXECUTE` sets NX.
    #[must_use]
    pub fn leaf(frame: PhysicalFrame, access: AccessFlags, mode: AccessMode) -> Self {
        let mut e = Self::new()
            .with_present(true)
            .with_writable(access.contains(AccessFlags::WRITE))
            .with_user(matches!(mode, AccessMode::User))
            .with_no_execute(!access.contains(AccessFlags::EXECUTE));
        e.set_physical_address(frame.base());
        e
    }

    /// A present non-leaf entry pointing at `table`.
    ///
    /// Permission bits start as exactly what the mapping being installed
    /// needs; later mappings through the same entry widen them via
    /// [`widened_for`](Self::widened_for), keeping every intermediate level
    /// the least-restrictive union of everything below it.
    #[must_use]
    pub fn non_leaf(table: PhysicalFrame, access: AccessFlags, mode: AccessMode) -> Self {
        // Same bit policy as a leaf; PS stays 0.
        Self::leaf(table, access, mode)
    }

    /// Widen a non-leaf entry so it permits a new mapping below it.
    ///
    /// Never narrows: bits only become more permissive.
    #[must_use]
    pub fn widened_for(self, access: AccessFlags, mode: AccessMode) -> Self {
        let mut e = self;
        if access.contains(AccessFlags::WRITE) {
            e.set_writable(true);
        }
        if matches!(mode, AccessMode::User) {
            e.set_user(true);
        }
        if access.contains(AccessFlags::EXECUTE) {
            e.set_no_execute(false);
        }
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_addresses::PhysicalAddress;

    fn frame(pa: u64) -> PhysicalFrame {
        PhysicalFrame::from_addr(PhysicalAddress::new(pa))
    }

    #[test]
    fn leaf_encodes_rights_and_address() {
        let e = PageEntry::leaf(
            frame(0x5555_0000),
            AccessFlags::READ | AccessFlags::WRITE,
            AccessMode::User,
        );
        assert!(e.present());
        assert!(e.writable());
        assert!(e.user());
        assert!(e.no_execute());
        assert_eq!(e.physical_address().as_u64(), 0x5555_0000);
    }

    #[test]
    fn executable_leaf_clears_nx() {
        let e = PageEntry::leaf(
            frame(0x1000),
            AccessFlags::READ | AccessFlags::EXECUTE,
            AccessMode::Supervisor,
        );
        assert!(!e.no_execute());
        assert!(!e.writable());
        assert!(!e.user());
    }

    #[test]
    fn widening_is_monotonic() {
        let e = PageEntry::non_leaf(frame(0x2000), AccessFlags::READ, AccessMode::Supervisor);
        assert!(!e.writable());
        assert!(e.no_execute());

        let w = e.widened_for(
            AccessFlags::WRITE | AccessFlags::EXECUTE,
            AccessMode::User,
        );
        assert!(w.writable());
        assert!(w.user());
        assert!(!w.no_execute());
        assert_eq!(w.physical_address(), e.physical_address());

        // Widening with a weaker requirement changes nothing.
        let again = w.widened_for(AccessFlags::READ, AccessMode::Supervisor);
        assert_eq!(again.into_bits(), w.into_bits());
    }
}
