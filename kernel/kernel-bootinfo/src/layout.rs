//! # Virtual Memory Layout
//!
//! Fixed virtual-address layout of the kernel. The canonical 48-bit address
//! space splits into a lower (user) and upper (supervisor) half; within the
//! upper half a handful of windows are carved out at link time.
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │ (unmapped guard, incl. null)    │
//! USER_SPACE_BASE       ├─────────────────────────────────┤
//!                       │ User space                      │
//! USER_SPACE_END        ├─────────────────────────────────┤
//!                       │ Non-canonical hole              │
//! KERNEL_SPACE_BASE     ├─────────────────────────────────┤
//!                       │ Kernel allocations              │
//!                       │ (incl. PHYS_WINDOW_BASE direct  │
//!                       │  map of physical memory)        │
//! KERNEL_IMAGE_BASE     ├─────────────────────────────────┤
//!                       │ Kernel image                    │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```

/// First allocatable user-space address. The low 64 KiB stay unmapped so
/// null and small-integer dereferences fault.
pub const USER_SPACE_BASE: u64 = 0x0000_0000_0001_0000;

/// Exclusive end of the canonical lower half.
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// Start of the canonical upper half; first supervisor address.
pub const KERNEL_SPACE_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Exclusive end of the kernel allocation window. Kept one frame short of
/// the address-space top so region end computations cannot wrap.
pub const KERNEL_SPACE_END: u64 = 0xFFFF_FFFF_FFFF_0000;

/// Base of the direct map of physical memory ("physical window"). Anything
/// mapped at `PHYS_WINDOW_BASE + pa` lets the kernel reach physical frame
/// `pa` through a fixed offset once paging is enabled.
pub const PHYS_WINDOW_BASE: u64 = 0xFFFF_8880_0000_0000;

/// Where the kernel image executes (VMA); matches the linker script.
pub const KERNEL_IMAGE_BASE: u64 = 0xFFFF_FFFF_8000_0000;

/// Where the loader places the kernel image in physical memory (LMA).
pub const KERNEL_IMAGE_PHYS: u64 = 0x0010_0000; // 1 MiB

const _: () = {
    assert!(USER_SPACE_BASE < USER_SPACE_END);
    assert!(KERNEL_SPACE_BASE >= USER_SPACE_END);
    assert!(PHYS_WINDOW_BASE >= KERNEL_SPACE_BASE);
    assert!(KERNEL_IMAGE_BASE > PHYS_WINDOW_BASE);
    assert!(KERNEL_IMAGE_BASE < KERNEL_SPACE_END);
    assert!(USER_SPACE_BASE.is_multiple_of(4096));
    assert!(KERNEL_SPACE_END.is_multiple_of(4096));
};
