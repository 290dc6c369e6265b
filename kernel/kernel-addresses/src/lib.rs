//! # Physical and Virtual Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses and 4 KiB frame/page
//! bases used throughout the memory subsystem.
//!
//! The core idea is to prevent mixing physical and virtual addresses at
//! compile time while remaining zero-cost wrappers around `u64` values:
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A raw address in physical memory (RAM / MMIO). |
//! | [`VirtualAddress`] | A raw address translated through the page tables. |
//! | [`PhysicalFrame`] | A 4 KiB-aligned physical frame base. |
//! | [`VirtualPage`] | A 4 KiB-aligned virtual page base. |
//!
//! All region boundaries in the memory subsystem are frame-aligned; the
//! frame/page wrappers make that explicit instead of relying on callers to
//! mask low bits correctly.
//!
//! The crate also hosts the [`PhysMapper`] seam: physical memory can only be
//! touched through virtual addresses once paging is on, so every component
//! that reads or writes physical frames (free-list headers, page tables)
//! goes through this trait. The production implementation adds the kernel's
//! physical-window base; tests substitute a buffer-backed mapper.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

use core::fmt;
use core::ops::{Add, AddAssign};

/// Size of one physical frame / virtual page in bytes.
pub const FRAME_SIZE: u64 = 4096;

/// log2 of [`FRAME_SIZE`]; number of low bits used for the in-page offset.
pub const FRAME_SHIFT: u32 = 12;

/// Align `x` down to the nearest multiple of `a` (`a` must be a power of two).
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a` (`a` must be a power of two).
///
/// `x + (a - 1)` must not overflow `u64`.
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

/// Physical memory address.
///
/// A thin `u64` wrapper that denotes **physical** addresses and prevents
/// accidental VA↔PA mix-ups. Page-table entries and free-list links store
/// these; they are never dereferenced directly — see [`PhysMapper`].
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    /// The highest representable physical address.
    ///
    /// Used as a list terminator where `0` is a legal address.
    pub const MAX: Self = Self(u64::MAX);

    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// `true` if the address is a multiple of `align` (power of two).
    #[inline]
    #[must_use]
    pub const fn is_aligned_to(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    /// `true` if the address is frame-aligned.
    #[inline]
    #[must_use]
    pub const fn is_frame_aligned(self) -> bool {
        self.is_aligned_to(FRAME_SIZE)
    }

    /// The frame containing this address.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalFrame {
        PhysicalFrame(Self(align_down(self.0, FRAME_SIZE)))
    }

    /// Byte offset within the containing frame.
    #[inline]
    #[must_use]
    pub const fn frame_offset(self) -> u64 {
        self.0 & (FRAME_SIZE - 1)
    }

    /// Checked byte addition.
    #[inline]
    #[must_use]
    pub const fn checked_add(self, bytes: u64) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Virtual memory address.
///
/// On x86-64 only the low 48 bits participate in translation; the high bits
/// must be sign-extended copies of bit 47 ("canonical form"). This type does
/// not enforce canonicality on construction — [`VirtualAddress::canonical`]
/// produces the canonical form of a 48-bit value.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Sign-extend bit 47 into bits 63:48.
    #[inline]
    #[must_use]
    pub const fn canonical(v: u64) -> Self {
        if v & (1 << 47) != 0 {
            Self(v | 0xFFFF_0000_0000_0000)
        } else {
            Self(v & 0x0000_FFFF_FFFF_FFFF)
        }
    }

    /// `true` if the high bits are sign-extended copies of bit 47.
    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        Self::canonical(self.0).0 == self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned_to(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.is_aligned_to(FRAME_SIZE)
    }

    /// The page containing this address.
    #[inline]
    #[must_use]
    pub const fn page(self) -> VirtualPage {
        VirtualPage(Self(align_down(self.0, FRAME_SIZE)))
    }

    /// Byte offset within the containing page.
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & (FRAME_SIZE - 1)
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, bytes: u64) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// A 4 KiB-aligned physical frame base.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalFrame(PhysicalAddress);

impl PhysicalFrame {
    /// Wrap a frame-aligned physical address.
    ///
    /// Alignment is asserted in debug builds.
    #[inline]
    #[must_use]
    pub const fn from_addr(addr: PhysicalAddress) -> Self {
        debug_assert!(addr.is_frame_aligned());
        Self(addr)
    }

    /// The frame containing `addr` (low bits masked off).
    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        addr.frame()
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        self.0
    }

    /// The frame `count` frames above this one.
    #[inline]
    #[must_use]
    pub const fn add_frames(self, count: u64) -> Self {
        Self(PhysicalAddress(self.0.0 + count * FRAME_SIZE))
    }
}

impl fmt::Debug for PhysicalFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame(0x{:016X})", self.0.as_u64())
    }
}

impl fmt::Display for PhysicalFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A 4 KiB-aligned virtual page base.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(VirtualAddress);

impl VirtualPage {
    /// Wrap a page-aligned virtual address.
    ///
    /// Alignment is asserted in debug builds.
    #[inline]
    #[must_use]
    pub const fn from_addr(addr: VirtualAddress) -> Self {
        debug_assert!(addr.is_page_aligned());
        Self(addr)
    }

    /// The page containing `addr` (low bits masked off).
    #[inline]
    #[must_use]
    pub const fn containing(addr: VirtualAddress) -> Self {
        addr.page()
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        self.0
    }

    /// The page `count` pages above this one.
    #[inline]
    #[must_use]
    pub const fn add_pages(self, count: u64) -> Self {
        Self(VirtualAddress(self.0.0 + count * FRAME_SIZE))
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page(0x{:016X})", self.0.as_u64())
    }
}

impl fmt::Display for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Converts physical addresses to usable pointers in the current virtual
/// address space.
///
/// Typical patterns:
/// - **Early boot**: firmware identity-maps low memory; physical addresses
///   are directly usable.
/// - **Kernel**: a fixed physical-window offset maps all of physical memory
///   into the upper half; add the window base before dereferencing.
///
/// # Safety
/// - `pa` must be mapped (writable, for `&mut T`) in the current page
///   tables for as long as the returned borrow lives.
/// - `T` must match the bytes at `pa` (no aliasing UB).
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference in the
    /// current address space.
    ///
    /// # Safety
    /// See the trait-level contract; the caller vouches for mapping validity
    /// and type correctness.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}
