//! Asynchronous logging core: fixed front-end buffers, a rolling log
//! file, and the double-buffered [`AsyncLogging`] writer, plus a
//! bridge installing it behind the `log` facade.

use std::sync::Arc;

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

mod async_log;
mod buffer;
mod file;

pub use async_log::{AsyncLogging, Config};
pub use buffer::{FixedBuffer, LARGE_BUFFER_SIZE};
pub use file::{LogFile, DEFAULT_CHECK_EVERY_N, DEFAULT_FLUSH_INTERVAL};

/// Routes `log` records into an [`AsyncLogging`] sink, one stamped
/// line per record.
pub struct LogBridge {
    sink: Arc<AsyncLogging>,
    max_level: LevelFilter,
}

impl LogBridge {
    pub fn new(sink: Arc<AsyncLogging>, max_level: LevelFilter) -> LogBridge {
        LogBridge { sink, max_level }
    }
}

impl Log for LogBridge {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "{} {:<5} {} - {}\n",
            file::format_utc_now_micros(),
            record.level(),
            record.target(),
            record.args()
        );
        self.sink.append(line.as_bytes());
    }

    fn flush(&self) {}
}

/// Install `sink` as the process-wide `log` backend.
pub fn init(sink: Arc<AsyncLogging>, max_level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_boxed_logger(Box::new(LogBridge::new(sink, max_level)))?;
    log::set_max_level(max_level);
    Ok(())
}
