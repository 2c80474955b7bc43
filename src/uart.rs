//! PL011 UART console and `log` backend
//!
//! Base address: `platform::UART_BASE` (QEMU virt). The UART is already
//! initialized by firmware, so only the data and flag registers are used.

use core::fmt::{self, Write};

use log::{LevelFilter, Log, Metadata, Record};

use crate::platform;

/// PL011 register offsets
const UART_DR: usize = 0x00; // Data Register
const UART_FR: usize = 0x18; // Flag Register

/// Flag Register bits
const UART_FR_TXFF: u32 = 1 << 5; // Transmit FIFO full

/// UART device structure
pub struct Uart {
    base: usize,
}

impl Uart {
    /// Create a UART handle for the PL011 at `base`.
    pub const fn new(base: usize) -> Self {
        Self { base }
    }

    /// Write a byte to the UART
    pub fn putc(&self, c: u8) {
        // Wait until TX FIFO is not full
        while self.read_reg(UART_FR) & UART_FR_TXFF != 0 {
            core::hint::spin_loop();
        }

        self.write_reg(UART_DR, c as u32);
    }

    /// Write a string to the UART, expanding `\n` to `\r\n`.
    pub fn puts(&self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.putc(b'\r');
            }
            self.putc(byte);
        }
    }

    #[inline]
    fn read_reg(&self, offset: usize) -> u32 {
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    #[inline]
    fn write_reg(&self, offset: usize, value: u32) {
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }
}

impl Write for Uart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.puts(s);
        Ok(())
    }
}

/// `log` backend printing `[LEVEL] target: message` lines on the UART.
pub struct UartLogger {
    base: usize,
}

impl UartLogger {
    pub const fn new(base: usize) -> Self {
        Self { base }
    }
}

impl Log for UartLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut uart = Uart::new(self.base);
        let _ = writeln!(uart, "[{}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: UartLogger = UartLogger::new(platform::UART_BASE);

/// Install the PL011 logger as the global `log` backend.
///
/// Only call this on the board: the logger writes straight to
/// `platform::UART_BASE`.
pub fn init_logger(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}
