//! Kernel configuration constants
//!
//! Everything the task layout, the mapper and the boot path agree on lives
//! here so the assembly stubs, the linker script and the Rust code cannot
//! drift apart silently.

/// Translation granule.
pub const PAGE_SIZE: usize = 4096;

/// Base of the kernel linear window (TTBR1). Physical `p` is visible at
/// `KERNEL_VA_BASE + p`.
pub const KERNEL_VA_BASE: u64 = 0xffff_0000_0000_0000;

/// Peripheral windows (physical).
pub const PERIPHERAL_BASE: u64 = 0x3f00_0000;
pub const LOCAL_PERIPHERAL_BASE: u64 = 0x4000_0000;

/// Boot page tables built by `_start` and refined by `init_kernel_tables`.
pub const BOOT_PUD: u64 = 0x2000;
pub const BOOT_PMD_LOW: u64 = 0x3000;
pub const BOOT_PMD_HIGH: u64 = 0x4000;
/// Physical range kept away from the frame allocator (spin table + boot tables).
pub const BOOT_RESERVED_END: u64 = 0x5000;

// ───────────────────────────────────────────────────────────────────────────
// Task layout
// ───────────────────────────────────────────────────────────────────────────

pub const THREAD_STACK_SIZE: usize = 4096;
pub const USER_STACK_SIZE: usize = 3 * THREAD_STACK_SIZE;

/// Where each task sees its user stack.
pub const USER_STACK_WINDOW: u64 = 0xffff_ffff_b000;
/// Where each task sees its own kernel stack in its user table.
pub const KERNEL_STACK_WINDOW: u64 = 0xffff_ffff_e000;
/// Program images are mapped at the bottom of the user half.
pub const IMAGE_BASE: u64 = 0;
/// ABI red zone left above the initial stack pointer.
pub const STACK_TOP_RESERVE: u64 = 0x10;
/// Page holding the signal return trampoline in every task that installs a handler.
pub const SIGRETURN_TRAMPOLINE_VA: u64 = 0xffff_ffff_a000;

pub const DEFAULT_PRIORITY: u32 = 1;

/// Initial user stack pointer, identical for every task.
pub const fn initial_user_sp() -> u64 {
    USER_STACK_WINDOW + USER_STACK_SIZE as u64 - STACK_TOP_RESERVE
}

// ───────────────────────────────────────────────────────────────────────────
// Scheduling
// ───────────────────────────────────────────────────────────────────────────

/// The preemption tick fires every `timer_frequency >> TICK_SHIFT` counts (1/32 s).
pub const TICK_SHIFT: u32 = 5;

/// Number of signal slots per task.
pub const SIG_NUM: usize = 32;

/// Program launched by `kernel_main` once the scheduler is up.
pub const INIT_PROGRAM: &str = "vm.img";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_stack_pointer() {
        assert_eq!(initial_user_sp(), 0xffff_ffff_b000 + 0x3000 - 0x10);
        assert_eq!(initial_user_sp() % 16, 0);
    }

    #[test]
    fn test_windows_do_not_overlap() {
        let user_end = USER_STACK_WINDOW + USER_STACK_SIZE as u64;
        assert!(user_end <= KERNEL_STACK_WINDOW);
        assert!(SIGRETURN_TRAMPOLINE_VA + PAGE_SIZE as u64 <= USER_STACK_WINDOW);
    }
}
