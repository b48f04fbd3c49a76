//! Hardware drivers for the Raspberry Pi 3 (BCM2837)

pub mod timer;
pub mod uart;

pub use uart::Uart;

use crate::config::{KERNEL_VA_BASE, LOCAL_PERIPHERAL_BASE, PERIPHERAL_BASE};

/// Kernel address of a register in the BCM2837 peripheral window.
pub const fn peripheral(offset: usize) -> usize {
    (KERNEL_VA_BASE + PERIPHERAL_BASE) as usize + offset
}

/// Kernel address of a register in the ARM local peripheral window.
pub const fn local_peripheral(offset: usize) -> usize {
    (KERNEL_VA_BASE + LOCAL_PERIPHERAL_BASE) as usize + offset
}
