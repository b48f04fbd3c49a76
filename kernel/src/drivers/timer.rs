//! Preemption Timer for Raspberry Pi 3
//!
//! Uses the EL1 physical generic timer (CNTP). Its interrupt reaches core 0
//! through the ARM local peripheral block, which is where the scheduler's
//! timer gate lives.

use crate::arch;
use crate::config::TICK_SHIFT;
use crate::drivers::local_peripheral;
use core::sync::atomic::{AtomicU64, Ordering};

// ═══════════════════════════════════════════════════════════════════════════════
// LOCAL PERIPHERAL REGISTERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Core 0 timer interrupt control.
const CORE0_TIMER_IRQCNTL: usize = 0x40;
/// Core 0 IRQ source.
const CORE0_IRQ_SOURCE: usize = 0x60;

/// CNTPNSIRQ routed to IRQ (control) and pending (source).
const CNTPNS_IRQ: u32 = 1 << 1;

const CNTP_CTL_ENABLE: u64 = 1;

// ═══════════════════════════════════════════════════════════════════════════════
// TIMER STATE
// ═══════════════════════════════════════════════════════════════════════════════

static TIMER_FREQ: AtomicU64 = AtomicU64::new(0);

/// Initialize the timer subsystem
pub fn init() {
    TIMER_FREQ.store(arch::timer_frequency(), Ordering::SeqCst);
}

/// Get timer frequency in Hz
pub fn frequency() -> u64 {
    match TIMER_FREQ.load(Ordering::Relaxed) {
        // The Pi 3 firmware programs CNTFRQ to 19.2 MHz
        0 => 19_200_000,
        freq => freq,
    }
}

/// Counter ticks between two preemption interrupts.
pub fn tick_interval() -> u64 {
    frequency() >> TICK_SHIFT
}

// ═══════════════════════════════════════════════════════════════════════════════
// INTERRUPT SUPPORT
// ═══════════════════════════════════════════════════════════════════════════════

/// Program the first tick and start the counter comparator.
pub fn init_tick() {
    init();
    rearm_tick();
    unsafe { arch::set_timer_ctl(CNTP_CTL_ENABLE) }
}

/// Schedule the next tick one interval from now. Also acknowledges the
/// current one.
pub fn rearm_tick() {
    unsafe { arch::set_timer_tval(tick_interval()) }
}

/// Let the timer interrupt reach core 0.
pub fn enable_interrupt() {
    unsafe { arch::write32(local_peripheral(CORE0_TIMER_IRQCNTL), CNTPNS_IRQ) }
}

/// Gate the timer interrupt off at the local controller.
pub fn disable_interrupt() {
    unsafe { arch::write32(local_peripheral(CORE0_TIMER_IRQCNTL), 0) }
}

/// Whether the pending IRQ on core 0 is the timer.
pub fn irq_pending() -> bool {
    unsafe { arch::read32(local_peripheral(CORE0_IRQ_SOURCE)) & CNTPNS_IRQ != 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_addresses() {
        assert_eq!(local_peripheral(CORE0_TIMER_IRQCNTL), 0xffff_0000_4000_0040);
        assert_eq!(local_peripheral(CORE0_IRQ_SOURCE), 0xffff_0000_4000_0060);
    }

    #[test]
    fn test_tick_interval() {
        init();
        // The host mock counter runs at 1 MHz
        assert_eq!(frequency(), 1_000_000);
        assert_eq!(tick_interval(), 1_000_000 >> TICK_SHIFT);
    }
}
