// Print macros for kernel output

use core::fmt;

/// Formatted output to the foreground terminal.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::print::_print(format_args!($($arg)*)));
}

/// Formatted output to the foreground terminal, newline-terminated.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Formatted output straight to the serial log sink.
#[cfg(target_arch = "x86")]
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => ($crate::arch::x86::serial::_print(format_args!($($arg)*)));
}

#[cfg(target_arch = "x86")]
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}

struct ForegroundWriter;

impl fmt::Write for ForegroundWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        crate::terminal::write_bytes(crate::terminal::foreground_id(), s.as_bytes());
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    // Terminal writes cannot fail; write_str always returns Ok.
    let _ = ForegroundWriter.write_fmt(args);
}
