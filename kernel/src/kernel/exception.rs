//! Exception Handling and Crash Reporting
//!
//! Entry points called from the vector table in `arch::boot`. SVCs from EL0
//! become system calls, other EL0 faults kill the faulting task, IRQs drive
//! the preemption tick and anything taken at EL1 is fatal.

use static_assertions::{assert_eq_size, const_assert_eq};

use crate::arch;
use crate::drivers;
use crate::kernel::scheduler::{self, SCHEDULER};
use crate::kernel::signal::Delivery;
use crate::kernel::syscall;

// ═══════════════════════════════════════════════════════════════════════════════
// TRAP FRAME
// ═══════════════════════════════════════════════════════════════════════════════

/// Register state pushed by `save_frame` in the vector stubs.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrapFrame {
    /// x0-x30
    pub x: [u64; 31],
    pub sp_el0: u64,
    pub elr: u64,
    pub spsr: u64,
}

assert_eq_size!(TrapFrame, [u64; 34]);
const_assert_eq!(core::mem::offset_of!(TrapFrame, sp_el0), 248);
const_assert_eq!(core::mem::offset_of!(TrapFrame, elr), 256);
const_assert_eq!(core::mem::offset_of!(TrapFrame, spsr), 264);

impl TrapFrame {
    pub fn dump(&self) {
        crate::kprintln!("Register dump:");
        for pair in (0..30).step_by(2) {
            crate::kprintln!(
                "  x{:<2}: {:#018x}  x{:<2}: {:#018x}",
                pair,
                self.x[pair],
                pair + 1,
                self.x[pair + 1]
            );
        }
        crate::kprintln!("  x30: {:#018x}", self.x[30]);
        crate::kprintln!("  SP_EL0: {:#018x}", self.sp_el0);
        crate::kprintln!("  ELR: {:#018x}", self.elr);
        crate::kprintln!("  SPSR:{:#018x}", self.spsr);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ESR DECODING
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExceptionClass {
    Unknown,
    TrappedWFI,
    IllegalState,
    SVC,
    InstrAbortLower,
    InstrAbortSame,
    PCAlignment,
    DataAbortLower,
    DataAbortSame,
    SPAlignment,
    SError,
    BRK,
}

impl From<u64> for ExceptionClass {
    fn from(esr: u64) -> Self {
        match (esr >> 26) & 0x3f {
            0b000001 => ExceptionClass::TrappedWFI,
            0b001110 => ExceptionClass::IllegalState,
            0b010101 => ExceptionClass::SVC,
            0b100000 => ExceptionClass::InstrAbortLower,
            0b100001 => ExceptionClass::InstrAbortSame,
            0b100010 => ExceptionClass::PCAlignment,
            0b100100 => ExceptionClass::DataAbortLower,
            0b100101 => ExceptionClass::DataAbortSame,
            0b100110 => ExceptionClass::SPAlignment,
            0b101111 => ExceptionClass::SError,
            0b111100 => ExceptionClass::BRK,
            _ => ExceptionClass::Unknown,
        }
    }
}

impl ExceptionClass {
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            ExceptionClass::InstrAbortLower
                | ExceptionClass::InstrAbortSame
                | ExceptionClass::DataAbortLower
                | ExceptionClass::DataAbortSame
        )
    }
}

/// Fault status code of an abort (ISS bits 5:0).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultStatus {
    AddressSize(u8),
    Translation(u8),
    AccessFlag(u8),
    Permission(u8),
    Alignment,
    Other(u64),
}

impl From<u64> for FaultStatus {
    fn from(esr: u64) -> Self {
        let code = esr & 0x3f;
        let level = (code & 0b11) as u8;
        match code >> 2 {
            0b0000 => FaultStatus::AddressSize(level),
            0b0001 => FaultStatus::Translation(level),
            0b0010 => FaultStatus::AccessFlag(level),
            0b0011 => FaultStatus::Permission(level),
            _ if code == 0b100001 => FaultStatus::Alignment,
            _ => FaultStatus::Other(code),
        }
    }
}

/// Names for the `kind` argument of `unhandled_exception`, indexed by
/// vector slot.
const VECTOR_NAMES: [&str; 16] = [
    "SYNC_EL1t", "IRQ_EL1t", "FIQ_EL1t", "ERROR_EL1t",
    "SYNC_EL1h", "IRQ_EL1h", "FIQ_EL1h", "ERROR_EL1h",
    "SYNC_EL0_64", "IRQ_EL0_64", "FIQ_EL0_64", "ERROR_EL0_64",
    "SYNC_EL0_32", "IRQ_EL0_32", "FIQ_EL0_32", "ERROR_EL0_32",
];

pub fn vector_name(kind: u64) -> &'static str {
    VECTOR_NAMES.get(kind as usize).copied().unwrap_or("UNKNOWN")
}

fn report(esr: u64, elr: u64, far: u64) {
    let class = ExceptionClass::from(esr);
    crate::kprintln!("[TRAP] {:?} ESR={:#x} ELR={:#x} FAR={:#x}", class, esr, elr, far);
    if class.is_abort() {
        crate::kprintln!(
            "[TRAP]   {:?} on {}",
            FaultStatus::from(esr),
            if (esr >> 6) & 1 == 1 { "write" } else { "read" }
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Synchronous exception from EL0.
#[no_mangle]
pub extern "C" fn el0_sync_handler(frame: *mut TrapFrame) {
    let frame = unsafe { &mut *frame };
    let esr = unsafe { arch::read_esr() };

    if ExceptionClass::from(esr) == ExceptionClass::SVC {
        // ELR already points past the SVC
        syscall::dispatch(frame);
        return;
    }

    report(esr, frame.elr, unsafe { arch::read_far() });
    if let Some(id) = scheduler::current_id() {
        crate::kprintln!("[TRAP] Terminating task {}", id);
    }
    scheduler::exit();
}

/// Synchronous exception taken in the kernel itself.
#[no_mangle]
pub extern "C" fn el1_sync_handler(frame: *mut TrapFrame) {
    let frame = unsafe { &*frame };
    report(unsafe { arch::read_esr() }, frame.elr, unsafe { arch::read_far() });
    frame.dump();
    crate::kprintln!("[TRAP] Kernel fault, halting");
    arch::halt();
}

#[no_mangle]
pub extern "C" fn irq_handler(_frame: *mut TrapFrame) {
    if drivers::timer::irq_pending() {
        scheduler::tick();
    }
}

/// Last stop before `eret` to EL0: deliver one pending signal.
#[no_mangle]
pub extern "C" fn return_to_user(frame: *mut TrapFrame) {
    let frame = unsafe { &mut *frame };
    let delivery = {
        let mut sched = SCHEDULER.lock();
        match sched.current_task_mut() {
            Some(task) => task.signals.deliver(frame),
            None => Delivery::Nothing,
        }
    };

    match delivery {
        Delivery::Nothing => {}
        Delivery::Handler(signum) => {
            crate::kprintln!("[SIG] Entering handler for signal {} at {:#x}", signum, frame.elr);
        }
        Delivery::Terminate(signum) => {
            crate::kprintln!("[SIG] Signal {} terminates task", signum);
            scheduler::exit();
        }
    }
}

#[no_mangle]
pub extern "C" fn unhandled_exception(frame: *mut TrapFrame, kind: u64) {
    let frame = unsafe { &*frame };
    crate::kprintln!("[TRAP] Unhandled {}", vector_name(kind));
    report(unsafe { arch::read_esr() }, frame.elr, unsafe { arch::read_far() });
    frame.dump();
    arch::halt();
}
