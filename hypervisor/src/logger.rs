//! The module containing the serial-port logger.
//!
//! The hypervisor cannot call into the OS it is about to virtualize, so the
//! only observable output is the UART. The logger is installed once by the
//! singleton creator; when nothing listens on COM1 the writes are harmless
//! port I/O, and the VM-exit hot path never logs.

use crate::{
    config::LOGGING_LEVEL,
    x86_instructions::{inb, outb},
};
use core::{fmt, fmt::Write};
use spin::Mutex;

/// The COM1 I/O port base.
const UART_IO_PORT_BASE: u16 = 0x3f8;

const UART_OFFSET_TRANSMITTER_HOLDING_BUFFER: u16 = 0;
const UART_OFFSET_LINE_STATUS: u16 = 5;

/// Installs the UART logger. A repeated call does nothing.
pub(crate) fn init_uart_logger() {
    if log::set_logger(&UART_LOGGER).is_ok() {
        log::set_max_level(LOGGING_LEVEL);
    }
}

static UART_LOGGER: UartLogger = UartLogger {
    port: Mutex::new(Uart),
};

struct Uart;

impl Write for Uart {
    // Busy-waits for the transmitter and writes `string` byte by byte.
    fn write_str(&mut self, string: &str) -> Result<(), fmt::Error> {
        for byte in string.bytes() {
            while (inb(UART_IO_PORT_BASE + UART_OFFSET_LINE_STATUS) & 0x20) == 0 {}
            outb(UART_IO_PORT_BASE + UART_OFFSET_TRANSMITTER_HOLDING_BUFFER, byte);
        }
        Ok(())
    }
}

struct UartLogger {
    port: Mutex<Uart>,
}

impl log::Log for UartLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::Level::Trace
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            // Prefix with the APIC ID; the launches are per processor and
            // interleaved output would otherwise be unattributable.
            let _ = writeln!(
                self.port.lock(),
                "#{}:{}: {}",
                apic_id(),
                record.level(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Gets an APIC ID.
fn apic_id() -> u32 {
    // See: Table 3-8. Information Returned by CPUID Instruction
    x86::cpuid::cpuid!(0x1).ebx >> 24
}
