//! Offset-based physical→virtual translation.

use kernel_addresses::{PhysMapper, PhysicalAddress};

/// [`PhysMapper`] that adds a fixed base offset to every physical address.
///
/// Two phases of the same mapping strategy:
/// - **Early boot** (base 0): firmware identity-maps memory, physical
///   addresses are directly dereferenceable.
/// - **After paging** ([`set_base`](Self::set_base) with the kernel's
///   physical-window base): every physical address is reachable at
///   `base + pa`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DirectMapper {
    base: u64,
}

impl DirectMapper {
    /// Identity translation (early boot, firmware mappings still active).
    #[inline]
    #[must_use]
    pub const fn identity() -> Self {
        Self { base: 0 }
    }

    /// Translation through a window mapped at `base`.
    #[inline]
    #[must_use]
    pub const fn with_base(base: u64) -> Self {
        Self { base }
    }

    /// Current window base.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// Rebase the window. All subsequent physical accesses translate
    /// through `base + pa`; the window must already be mapped.
    #[inline]
    pub const fn set_base(&mut self, base: u64) {
        self.base = base;
    }
}

impl PhysMapper for DirectMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = self.base.wrapping_add(pa.as_u64()) as *mut T;
        // SAFETY: the caller guarantees `pa` is mapped at `base + pa`.
        unsafe { &mut *va }
    }
}
