//! Serial port output for debug logging
//!
//! COM1 (0x3F8) through a 16550 UART. Host test builds print to stdout
//! instead of touching I/O ports.

use core::fmt;

#[cfg(all(not(test), target_arch = "x86_64"))]
use spin::Mutex;
#[cfg(all(not(test), target_arch = "x86_64"))]
use uart_16550::SerialPort;

/// COM1 base I/O port
#[cfg(all(not(test), target_arch = "x86_64"))]
const COM1: u16 = 0x3F8;

#[cfg(all(not(test), target_arch = "x86_64"))]
lazy_static::lazy_static! {
    /// Global serial port, initialised on first use
    static ref SERIAL1: Mutex<SerialPort> = {
        let mut port = unsafe { SerialPort::new(COM1) };
        port.init();
        Mutex::new(port)
    };
}

/// Print to serial port (internal use)
#[doc(hidden)]
#[cfg(all(not(test), target_arch = "x86_64"))]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    // Interrupts off so a handler that logs cannot deadlock on SERIAL1
    x86_64::instructions::interrupts::without_interrupts(|| {
        let _ = SERIAL1.lock().write_fmt(args);
    });
}

#[doc(hidden)]
#[cfg(all(not(test), not(target_arch = "x86_64")))]
pub fn _print(_args: fmt::Arguments) {}

#[doc(hidden)]
#[cfg(test)]
pub fn _print(args: fmt::Arguments) {
    print!("{}", args);
}

/// Print to serial port
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

/// Print to serial port with newline
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($fmt:expr) => ($crate::serial_print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::serial_print!(
        concat!($fmt, "\n"), $($arg)*
    ));
}
