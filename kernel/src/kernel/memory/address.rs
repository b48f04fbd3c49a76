//! Typed physical and virtual addresses
//!
//! Page-table descriptors hold physical addresses while the kernel can only
//! dereference virtual ones. Keeping the two apart in the type system means
//! every crossing goes through a [`LinearWindow`].

use core::fmt;
use core::ops::{Add, Sub};

use crate::config::{KERNEL_VA_BASE, PAGE_SIZE};

/// A physical (bus) address.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(u64);

/// A virtual address, in either the kernel or a task's user half.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(u64);

macro_rules! address_common {
    ($name:ident) => {
        impl $name {
            #[inline]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            #[inline]
            pub const fn is_null(self) -> bool {
                self.0 == 0
            }

            #[inline]
            pub const fn is_page_aligned(self) -> bool {
                self.0 & (PAGE_SIZE as u64 - 1) == 0
            }

            #[inline]
            #[must_use]
            pub const fn page_align_down(self) -> Self {
                Self(self.0 & !(PAGE_SIZE as u64 - 1))
            }

            #[inline]
            pub const fn page_offset(self) -> usize {
                (self.0 & (PAGE_SIZE as u64 - 1)) as usize
            }

            #[inline]
            #[must_use]
            pub const fn offset(self, bytes: u64) -> Self {
                Self(self.0.wrapping_add(bytes))
            }
        }

        impl Add<u64> for $name {
            type Output = Self;

            fn add(self, rhs: u64) -> Self {
                self.offset(rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = u64;

            fn sub(self, rhs: $name) -> u64 {
                self.0.wrapping_sub(rhs.0)
            }
        }

        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

address_common!(PhysAddr);
address_common!(VirtAddr);

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA({:#x})", self.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA({:#x})", self.0)
    }
}

impl VirtAddr {
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u64)
    }

    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as usize as *const T
    }

    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }

    /// Index into the translation table at `level` (0 = PGD .. 3 = PTE).
    #[inline]
    pub const fn table_index(self, level: usize) -> usize {
        ((self.0 >> (39 - 9 * level)) & 0x1ff) as usize
    }

    /// True for addresses translated through TTBR1.
    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 >= KERNEL_VA_BASE
    }
}

/// Fixed offset between a physical address and where the kernel sees it.
///
/// On hardware the offset is `KERNEL_VA_BASE`; host tests use a window onto
/// a heap buffer standing in for RAM. Conversions wrap instead of failing, so
/// they are total over the whole address range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinearWindow {
    offset: u64,
}

impl LinearWindow {
    /// The window set up by the boot code.
    pub const KERNEL: LinearWindow = LinearWindow { offset: KERNEL_VA_BASE };

    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub const fn to_virt(&self, pa: PhysAddr) -> VirtAddr {
        VirtAddr(pa.0.wrapping_add(self.offset))
    }

    #[inline]
    pub const fn to_phys(&self, va: VirtAddr) -> PhysAddr {
        PhysAddr(va.0.wrapping_sub(self.offset))
    }
}
