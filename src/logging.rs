//! Kernel logging facility
//!
//! Routes the `log` crate's records to COM1, one `[LEVEL] target: message`
//! line per record.

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::devices::serial;

/// Level used when booting without an explicit choice.
#[cfg(debug_assertions)]
pub const DEFAULT_LEVEL: LevelFilter = LevelFilter::Debug;
#[cfg(not(debug_assertions))]
pub const DEFAULT_LEVEL: LevelFilter = LevelFilter::Info;

static LOGGER: SerialLogger = SerialLogger;

struct SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            serial::write_line(format_args!(
                "[{}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

/// Installs the serial logger. Call once, before [`crate::memory::init`].
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}
