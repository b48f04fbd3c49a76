//! ╔═══════════════════════════════════════════════════════════════════════════╗
//! ║                      PI KERNEL - LIBRARY ROOT                             ║
//! ║            Tasks, Address Spaces and a Round-Robin Scheduler              ║
//! ╚═══════════════════════════════════════════════════════════════════════════╝
//!
//! Everything except the boot entry lives here so the scheduler, the mapper
//! and the launcher can be unit tested on the host. The binary entry point
//! is in main.rs.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

// ═══════════════════════════════════════════════════════════════════════════════
// PUBLIC MODULES
// ═══════════════════════════════════════════════════════════════════════════════

pub mod arch;
pub mod config;
pub mod drivers;
pub mod dtb;
pub mod fs;
pub mod kernel;

#[cfg(any(test, feature = "test_mocks"))]
pub mod testing;

// ═══════════════════════════════════════════════════════════════════════════════
// MACROS
// ═══════════════════════════════════════════════════════════════════════════════

#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::drivers::uart::print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kprintln {
    () => { $crate::kprint!("\n") };
    ($($arg:tt)*) => {
        $crate::kprint!("{}\n", format_args!($($arg)*))
    };
}
