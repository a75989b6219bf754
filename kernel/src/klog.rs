//! Kernel logging: the `log` facade over the serial port.
//!
//! Log lines go to COM1 only, never to the terminals: the text frames
//! belong to user programs once the shells are up. On non-x86 builds the
//! records are discarded; the host test harness has no serial port.

use log::{LevelFilter, Metadata, Record};

struct SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        #[cfg(target_arch = "x86")]
        crate::arch::x86::serial::_print(format_args!(
            "[{:>5}] {}\n",
            record.level(),
            record.args()
        ));
        #[cfg(not(target_arch = "x86"))]
        let _ = record;
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Install the serial logger. Called once, before any log line.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}
