//! PL011 UART Driver for Raspberry Pi 3
//!
//! The console for every `kprint!` line and the byte stream behind the
//! `uart_read` / `uart_write` system calls.

use crate::arch::{self, SpinLock};
use crate::drivers::peripheral;
use core::fmt::{self, Write};

// ═══════════════════════════════════════════════════════════════════════════════
// PL011 REGISTERS
// ═══════════════════════════════════════════════════════════════════════════════

const UART0_OFFSET: usize = 0x20_1000;

const DR: usize = 0x00;        // Data Register
const FR: usize = 0x18;        // Flag Register
const IBRD: usize = 0x24;      // Integer Baud Rate Divisor
const FBRD: usize = 0x28;      // Fractional Baud Rate Divisor
const LCRH: usize = 0x2C;      // Line Control Register
const CR: usize = 0x30;        // Control Register
const IMSC: usize = 0x38;      // Interrupt Mask Set/Clear
const ICR: usize = 0x44;       // Interrupt Clear Register

// Flag Register bits
const FR_TXFF: u32 = 1 << 5;   // Transmit FIFO full
const FR_RXFE: u32 = 1 << 4;   // Receive FIFO empty
const FR_BUSY: u32 = 1 << 3;   // UART busy

// Line Control Register bits
const LCRH_WLEN_8: u32 = 0b11 << 5; // 8-bit word length
const LCRH_FEN: u32 = 1 << 4;       // Enable FIFOs

// Control Register bits
const CR_RXE: u32 = 1 << 9;        // Receive enable
const CR_TXE: u32 = 1 << 8;        // Transmit enable
const CR_UARTEN: u32 = 1 << 0;     // UART enable

// GPIO pin muxing for TXD0/RXD0 on GPIO14/15
const GPFSEL1: usize = 0x20_0004;
const GPPUD: usize = 0x20_0094;
const GPPUDCLK0: usize = 0x20_0098;
const GPIO_ALT0: u32 = 0b100;

/// The firmware runs the UART reference clock at 48 MHz.
pub const UART_CLOCK: u32 = 48_000_000;
pub const BAUD_RATE: u32 = 115_200;

/// Integer and fractional baud divisors (6 fractional bits).
pub const fn divisors(clock: u32, baud: u32) -> (u32, u32) {
    let divisor = (clock * 4) / baud;
    (divisor >> 6, divisor & 0x3F)
}

// ═══════════════════════════════════════════════════════════════════════════════
// UART DRIVER
// ═══════════════════════════════════════════════════════════════════════════════

/// UART driver instance
pub struct Uart {
    base: usize,
}

impl Uart {
    pub const fn new() -> Self {
        Uart {
            base: peripheral(UART0_OFFSET),
        }
    }

    #[inline]
    fn read(&self, offset: usize) -> u32 {
        unsafe { arch::read32(self.base + offset) }
    }

    #[inline]
    fn write(&self, offset: usize, value: u32) {
        unsafe { arch::write32(self.base + offset, value) }
    }

    #[inline]
    fn wait_tx_ready(&self) {
        while self.read(FR) & FR_TXFF != 0 {
            core::hint::spin_loop();
        }
    }

    #[inline]
    fn wait_tx_complete(&self) {
        while self.read(FR) & FR_BUSY != 0 {
            core::hint::spin_loop();
        }
    }

    /// Route GPIO14/15 to the PL011 and turn their pulls off.
    fn mux_pins(&self) {
        unsafe {
            let fsel = peripheral(GPFSEL1);
            let mut selector = arch::read32(fsel);
            selector &= !((7 << 12) | (7 << 15));
            selector |= (GPIO_ALT0 << 12) | (GPIO_ALT0 << 15);
            arch::write32(fsel, selector);

            arch::write32(peripheral(GPPUD), 0);
            delay_cycles(150);
            arch::write32(peripheral(GPPUDCLK0), (1 << 14) | (1 << 15));
            delay_cycles(150);
            arch::write32(peripheral(GPPUDCLK0), 0);
        }
    }

    /// 115200 8N1, FIFOs on, interrupts masked.
    pub fn init(&mut self) {
        self.write(CR, 0);
        self.wait_tx_complete();
        self.mux_pins();

        self.write(ICR, 0x7FF);
        self.write(IMSC, 0);

        let (ibrd, fbrd) = divisors(UART_CLOCK, BAUD_RATE);
        self.write(IBRD, ibrd);
        self.write(FBRD, fbrd);
        self.write(LCRH, LCRH_FEN | LCRH_WLEN_8);
        self.write(CR, CR_UARTEN | CR_TXE | CR_RXE);
    }

    /// Send a single byte
    pub fn send(&self, byte: u8) {
        self.wait_tx_ready();
        self.write(DR, byte as u32);
    }

    /// Send a string, expanding `\n` to `\r\n`
    pub fn send_str(&self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.send(b'\r');
            }
            self.send(byte);
        }
    }

    /// Check if data is available
    pub fn has_data(&self) -> bool {
        self.read(FR) & FR_RXFE == 0
    }

    /// Receive a byte (blocking)
    pub fn receive(&self) -> u8 {
        while !self.has_data() {
            core::hint::spin_loop();
        }
        self.read(DR) as u8
    }
}

impl Default for Uart {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for Uart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.send_str(s);
        Ok(())
    }
}

fn delay_cycles(count: u32) {
    for _ in 0..count {
        core::hint::spin_loop();
    }
}

// SAFETY: Uart is just a wrapper around MMIO, safe to send across threads
unsafe impl Send for Uart {}

// ═══════════════════════════════════════════════════════════════════════════════
// GLOBAL UART INSTANCE
// ═══════════════════════════════════════════════════════════════════════════════

static UART0: SpinLock<Uart> = SpinLock::new(Uart::new());

pub fn init() {
    UART0.lock().init();
}

/// Fill `buf` from the receiver, blocking for every byte.
pub fn read_bytes(buf: &mut [u8]) -> usize {
    let uart = UART0.lock();
    for slot in buf.iter_mut() {
        *slot = uart.receive();
    }
    buf.len()
}

/// Write raw bytes (no newline translation).
pub fn write_bytes(bytes: &[u8]) -> usize {
    let uart = UART0.lock();
    for &byte in bytes {
        uart.send(byte);
    }
    bytes.len()
}

// ═══════════════════════════════════════════════════════════════════════════════
// PRINT MACROS
// ═══════════════════════════════════════════════════════════════════════════════

pub fn print(args: fmt::Arguments) {
    let mut uart = UART0.lock();
    let _ = uart.write_fmt(args);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_divisors_for_115200() {
        // 48 MHz / (16 * 115200) = 26.0416
        assert_eq!(divisors(UART_CLOCK, BAUD_RATE), (26, 2));
    }

    #[test]
    fn test_uart_window() {
        assert_eq!(Uart::new().base, 0xffff_0000_3f20_1000);
    }

    #[test]
    fn test_host_io_is_inert() {
        let mut buf = [0xAAu8; 4];
        assert_eq!(read_bytes(&mut buf), 4);
        assert_eq!(buf, [0; 4]);
        assert_eq!(write_bytes(b"hi"), 2);
    }
}
