//! Architecture-specific code for ARM64 (AArch64)
//!
//! Bare-metal builds talk to the CPU through inline assembly and the stubs
//! in [`boot`]. Host builds (unit and scenario tests) get inert mocks with
//! the same signatures.

use crate::kernel::memory::PhysAddr;

#[cfg(target_os = "none")]
pub mod boot;

#[cfg(target_os = "none")]
mod real {
    use core::arch::asm;

    use crate::kernel::task::Context;

    extern "C" {
        #[link_name = "switch_to"]
        fn switch_to_asm(prev: *mut Context, next: *const Context);
        #[link_name = "enter_el0"]
        fn enter_el0_asm(entry: u64, user_sp: u64, kernel_sp: u64) -> !;
    }

    pub unsafe fn enable_interrupts() {
        asm!("msr daifclr, #2", options(nostack));
    }

    pub unsafe fn disable_interrupts() -> u64 {
        let daif: u64;
        asm!("mrs {}, daif", "msr daifset, #2", out(reg) daif, options(nostack));
        daif
    }

    pub unsafe fn restore_interrupts(state: u64) {
        asm!("msr daif, {}", in(reg) state, options(nostack));
    }

    pub unsafe fn wait_for_interrupt() {
        asm!("wfi", options(nomem, nostack));
    }

    pub unsafe fn halt_core() -> ! {
        loop {
            asm!("wfe", options(nomem, nostack));
        }
    }

    pub unsafe fn read_timer_freq() -> u64 {
        let value: u64;
        asm!("mrs {}, cntfrq_el0", out(reg) value, options(nomem, nostack));
        value
    }

    pub unsafe fn set_timer_tval(ticks: u64) {
        asm!("msr cntp_tval_el0, {}", in(reg) ticks, options(nomem, nostack));
    }

    pub unsafe fn set_timer_ctl(value: u64) {
        asm!("msr cntp_ctl_el0, {}", in(reg) value, options(nomem, nostack));
    }

    pub unsafe fn set_ttbr0(root: u64) {
        asm!(
            "dsb ish",
            "msr ttbr0_el1, {}",
            "tlbi vmalle1is",
            "dsb ish",
            "isb",
            in(reg) root,
            options(nostack)
        );
    }

    pub unsafe fn get_ttbr0() -> u64 {
        let value: u64;
        asm!("mrs {}, ttbr0_el1", out(reg) value, options(nomem, nostack));
        value
    }

    pub unsafe fn tlb_invalidate_all() {
        asm!("dsb ishst", "tlbi vmalle1is", "dsb ish", "isb", options(nostack));
    }

    pub unsafe fn read_esr() -> u64 {
        let value: u64;
        asm!("mrs {}, esr_el1", out(reg) value, options(nomem, nostack));
        value
    }

    pub unsafe fn read_far() -> u64 {
        let value: u64;
        asm!("mrs {}, far_el1", out(reg) value, options(nomem, nostack));
        value
    }

    pub unsafe fn switch_to(prev: *mut Context, next: *const Context) {
        switch_to_asm(prev, next)
    }

    pub unsafe fn enter_el0(entry: u64, user_sp: u64, kernel_sp: u64) -> ! {
        enter_el0_asm(entry, user_sp, kernel_sp)
    }
}

#[cfg(not(target_os = "none"))]
mod mocks {
    use core::sync::atomic::{AtomicU64, Ordering};

    use crate::kernel::task::Context;

    const DAIF_I: u64 = 1 << 7;

    static MOCK_DAIF: AtomicU64 = AtomicU64::new(0);
    static MOCK_TTBR0: AtomicU64 = AtomicU64::new(0);

    pub unsafe fn enable_interrupts() {
        MOCK_DAIF.store(0, Ordering::Relaxed);
    }

    pub unsafe fn disable_interrupts() -> u64 {
        MOCK_DAIF.swap(DAIF_I, Ordering::Relaxed)
    }

    pub unsafe fn restore_interrupts(state: u64) {
        MOCK_DAIF.store(state, Ordering::Relaxed);
    }

    pub unsafe fn wait_for_interrupt() {}

    pub unsafe fn halt_core() -> ! {
        panic!("core halted")
    }

    pub unsafe fn read_timer_freq() -> u64 {
        1_000_000 // 1 MHz for simple math
    }

    pub unsafe fn set_timer_tval(_ticks: u64) {}

    pub unsafe fn set_timer_ctl(_value: u64) {}

    pub unsafe fn set_ttbr0(root: u64) {
        MOCK_TTBR0.store(root, Ordering::Relaxed);
    }

    pub unsafe fn get_ttbr0() -> u64 {
        MOCK_TTBR0.load(Ordering::Relaxed)
    }

    pub unsafe fn tlb_invalidate_all() {}

    pub unsafe fn read_esr() -> u64 {
        0
    }

    pub unsafe fn read_far() -> u64 {
        0
    }

    pub unsafe fn switch_to(_prev: *mut Context, _next: *const Context) {}

    pub unsafe fn enter_el0(_entry: u64, _user_sp: u64, _kernel_sp: u64) -> ! {
        panic!("EL0 is not reachable on the host")
    }
}

#[cfg(target_os = "none")]
pub use real::*;

#[cfg(not(target_os = "none"))]
pub use mocks::*;

// ═══════════════════════════════════════════════════════════════════════════════
// SAFE WRAPPERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Wait for interrupt (low power)
#[inline]
pub fn wfi() {
    unsafe { wait_for_interrupt() }
}

/// Halt this core forever
#[inline]
pub fn halt() -> ! {
    unsafe { halt_core() }
}

#[inline]
pub fn timer_frequency() -> u64 {
    unsafe { read_timer_freq() }
}

// ═══════════════════════════════════════════════════════════════════════════════
// INTERRUPT CONTROL
// ═══════════════════════════════════════════════════════════════════════════════

/// Enable IRQ interrupts
#[inline]
pub fn irq_enable() {
    unsafe { enable_interrupts() }
}

/// Disable IRQ interrupts, return previous state
#[inline]
pub fn irq_disable() -> u64 {
    unsafe { disable_interrupts() }
}

/// Restore interrupt state
#[inline]
pub fn irq_restore(state: u64) {
    unsafe { restore_interrupts(state) }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SPIN LOCK
// ═══════════════════════════════════════════════════════════════════════════════

/// Spin lock that also masks IRQs while held, so an interrupt handler can
/// never spin on a lock its own core holds.
pub struct SpinLock<T: ?Sized> {
    lock: core::sync::atomic::AtomicBool,
    data: core::cell::UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        SpinLock {
            lock: core::sync::atomic::AtomicBool::new(false),
            data: core::cell::UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        use core::sync::atomic::Ordering;

        let saved_int_state = irq_disable();

        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.lock.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
        SpinLockGuard {
            lock: self,
            saved_int_state,
        }
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        use core::sync::atomic::Ordering;

        let saved_int_state = irq_disable();

        if self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard {
                lock: self,
                saved_int_state,
            })
        } else {
            irq_restore(saved_int_state);
            None
        }
    }

    fn unlock(&self) {
        self.lock.store(false, core::sync::atomic::Ordering::Release);
    }
}

/// RAII guard for SpinLock
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    saved_int_state: u64,
}

impl<'a, T: ?Sized> core::ops::Deref for SpinLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> core::ops::DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
        irq_restore(self.saved_int_state);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REGISTER ACCESS
// ═══════════════════════════════════════════════════════════════════════════════

/// Read a 32-bit value from a memory-mapped register
#[inline]
#[cfg(target_os = "none")]
pub unsafe fn read32(addr: usize) -> u32 {
    core::ptr::read_volatile(addr as *const u32)
}

#[inline]
#[cfg(not(target_os = "none"))]
pub unsafe fn read32(_addr: usize) -> u32 {
    0
}

/// Write a 32-bit value to a memory-mapped register
#[inline]
#[cfg(target_os = "none")]
pub unsafe fn write32(addr: usize, value: u32) {
    core::ptr::write_volatile(addr as *mut u32, value);
}

#[inline]
#[cfg(not(target_os = "none"))]
pub unsafe fn write32(_addr: usize, _value: u32) {}

// ═══════════════════════════════════════════════════════════════════════════════
// PLATFORM SEAM
// ═══════════════════════════════════════════════════════════════════════════════

/// The hardware effects the scheduler and launcher need.
///
/// Scheduler code is written against this trait so tests can observe the
/// interrupt and page-table traffic without a CPU.
pub trait Platform {
    /// Mask IRQs, returning the previous mask state.
    fn irq_disable(&mut self) -> u64;
    fn irq_restore(&mut self, state: u64);
    fn timer_irq_enable(&mut self);
    fn timer_irq_disable(&mut self);
    /// Install a task's root table in TTBR0 and flush stale translations.
    fn set_page_table(&mut self, root: PhysAddr);
    fn active_page_table(&self) -> PhysAddr;
}

/// The Raspberry Pi this kernel runs on.
#[derive(Clone, Copy, Debug, Default)]
pub struct Board;

impl Platform for Board {
    fn irq_disable(&mut self) -> u64 {
        irq_disable()
    }

    fn irq_restore(&mut self, state: u64) {
        irq_restore(state)
    }

    fn timer_irq_enable(&mut self) {
        crate::drivers::timer::enable_interrupt();
    }

    fn timer_irq_disable(&mut self) {
        crate::drivers::timer::disable_interrupt();
    }

    fn set_page_table(&mut self, root: PhysAddr) {
        unsafe { set_ttbr0(root.as_u64()) }
    }

    fn active_page_table(&self) -> PhysAddr {
        PhysAddr::new(unsafe { get_ttbr0() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spinlock_guards_data() {
        let lock = SpinLock::new(5);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(lock.try_lock().is_none());
        }
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn test_mock_page_table_register() {
        let mut board = Board;
        board.set_page_table(PhysAddr::new(0x8000));
        assert_eq!(board.active_page_table(), PhysAddr::new(0x8000));
    }
}
