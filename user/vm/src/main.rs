#![no_std]
#![no_main]

// ══════════════════════════════════════════════════════════════════════════════
// VM - FIRST USER PROGRAM
// ══════════════════════════════════════════════════════════════════════════════

use core::arch::asm;
use core::panic::PanicInfo;
use core::sync::atomic::{AtomicU32, Ordering};

const SYS_GETPID: u64 = 0;
const SYS_UART_READ: u64 = 1;
const SYS_UART_WRITE: u64 = 2;
const SYS_EXIT: u64 = 5;
const SYS_SIGNAL: u64 = 8;
const SYS_SIGKILL: u64 = 9;
const SYS_YIELD: u64 = 11;

const SIGUSR1: u64 = 10;
const ERROR: u64 = u64::MAX;

static SIGNALS_SEEN: AtomicU32 = AtomicU32::new(0);

#[no_mangle]
#[link_section = ".text.start"]
pub extern "C" fn _start() -> ! {
    print("\n[VM] Hello from EL0\n");

    let pid = unsafe { syscall(SYS_GETPID, 0, 0) };
    print("[VM] pid ");
    print_u64(pid);
    print("\n");

    // Post a signal to ourselves; it is delivered on the way back from the call
    let previous = unsafe { syscall(SYS_SIGNAL, SIGUSR1, on_signal as usize as u64) };
    if previous == ERROR {
        print("[VM] signal registration failed\n");
    }
    unsafe { syscall(SYS_SIGKILL, pid, SIGUSR1) };
    if SIGNALS_SEEN.load(Ordering::Relaxed) == 1 {
        print("[VM] back from the handler\n");
    }

    print("[VM] echoing, 'q' quits\n");
    echo();

    print("[VM] bye\n");
    exit();
}

extern "C" fn on_signal(signum: u64) {
    SIGNALS_SEEN.fetch_add(1, Ordering::Relaxed);
    print("[VM] caught signal ");
    print_u64(signum);
    print("\n");
}

/// The kernel fills the whole buffer before returning, so read a byte at a time.
fn echo() {
    let mut byte = [0u8; 1];
    loop {
        let n = unsafe { syscall(SYS_UART_READ, byte.as_mut_ptr() as u64, 1) };
        if n != 1 {
            unsafe { syscall(SYS_YIELD, 0, 0) };
            continue;
        }
        unsafe { syscall(SYS_UART_WRITE, byte.as_ptr() as u64, 1) };
        if byte[0] == b'q' {
            return;
        }
    }
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    print("[VM] PANIC\n");
    exit();
}

// Minimal syscall wrappers: number in x8, arguments in x0/x1, result in x0

unsafe fn syscall(nr: u64, a0: u64, a1: u64) -> u64 {
    let ret: u64;
    asm!(
        "svc #0",
        inlateout("x0") a0 => ret,
        in("x1") a1,
        in("x8") nr,
        options(nostack),
    );
    ret
}

fn print(s: &str) {
    unsafe { syscall(SYS_UART_WRITE, s.as_ptr() as u64, s.len() as u64) };
}

fn print_u64(mut n: u64) {
    let mut digits = [0u8; 20];
    let mut i = digits.len();
    loop {
        i -= 1;
        digits[i] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    unsafe { syscall(SYS_UART_WRITE, digits[i..].as_ptr() as u64, (digits.len() - i) as u64) };
}

fn exit() -> ! {
    unsafe { syscall(SYS_EXIT, 0, 0) };
    loop {
        unsafe { syscall(SYS_YIELD, 0, 0) };
    }
}
