//! Asynchronous logging back end.
//!
//! [`AsyncLogging`] is the producer/consumer sink, [`LogFile`] the
//! rolling file under it, and [`Logger`] bridges the `log` crate facade
//! into the sink so `info!`/`warn!` all over a program (this crate
//! included) land in the log files.

mod async_logging;
mod log_file;

pub use async_logging::AsyncLogging;
pub use log_file::LogFile;

use chrono::Local;
use log::{LevelFilter, Metadata, Record, SetLoggerError};

/// `log::Log` implementation writing into an [`AsyncLogging`] sink.
///
/// One line per record: timestamp, level, target, message.
pub struct Logger {
    sink: AsyncLogging,
}

impl Logger {
    pub fn new(sink: AsyncLogging) -> Logger {
        Logger { sink }
    }
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "{} {:<5} {} - {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.6f"),
            record.level(),
            record.target(),
            record.args(),
        );
        self.sink.append(line.as_bytes());
    }

    fn flush(&self) {}
}

/// Install `sink` as the process-wide logger. The sink should already
/// be started (or be started soon after); records appended before the
/// writer runs are buffered.
pub fn init(sink: AsyncLogging, level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_boxed_logger(Box::new(Logger::new(sink)))?;
    log::set_max_level(level);
    Ok(())
}
