use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use chrono::Utc;

use crate::sys;

const WRITE_BUFFER_SIZE: usize = 64 * 1024;
const ROLL_PER_SECONDS: i64 = 60 * 60 * 24;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(3);
const DEFAULT_CHECK_EVERY_N: u32 = 1024;

/// Rolling, periodically flushed append-only log file.
///
/// A new file is started whenever `roll_size` bytes have been written
/// or a UTC day boundary passes; the day check and the time-based flush
/// only run every `check_every_n` appends to keep the append path
/// cheap. File names look like
/// `<basename>.20260801-120000.<hostname>.<pid>.log`.
///
/// Not internally locked: the async logging back end is the single
/// writer by construction.
pub struct LogFile {
    basename: String,
    roll_size: u64,
    flush_interval: Duration,
    check_every_n: u32,
    count: u32,
    file: BufWriter<File>,
    written: u64,
    start_of_period: i64,
    last_roll: i64,
    last_flush: i64,
}

impl LogFile {
    pub fn new(basename: impl Into<String>, roll_size: u64) -> io::Result<LogFile> {
        Self::with_options(
            basename,
            roll_size,
            DEFAULT_FLUSH_INTERVAL,
            DEFAULT_CHECK_EVERY_N,
        )
    }

    pub fn with_options(
        basename: impl Into<String>,
        roll_size: u64,
        flush_interval: Duration,
        check_every_n: u32,
    ) -> io::Result<LogFile> {
        let basename = basename.into();
        let now = Utc::now().timestamp();
        let file = open_log_file(&basename, now)?;
        Ok(LogFile {
            basename,
            roll_size,
            flush_interval,
            check_every_n,
            count: 0,
            file,
            written: 0,
            start_of_period: period_of(now),
            last_roll: now,
            last_flush: now,
        })
    }

    pub fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.written += data.len() as u64;

        if self.written > self.roll_size {
            self.roll()?;
        } else {
            self.count += 1;
            if self.count >= self.check_every_n {
                self.count = 0;
                let now = Utc::now().timestamp();
                if period_of(now) != self.start_of_period {
                    self.roll()?;
                } else if now - self.last_flush > self.flush_interval.as_secs() as i64 {
                    self.last_flush = now;
                    self.file.flush()?;
                }
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    /// Switch to a fresh file. No-op within the same second, so a burst
    /// of appends past the roll size cannot spray one file per record.
    pub fn roll(&mut self) -> io::Result<()> {
        let now = Utc::now().timestamp();
        if now > self.last_roll {
            self.last_roll = now;
            self.last_flush = now;
            self.start_of_period = period_of(now);
            self.file.flush()?;
            self.file = open_log_file(&self.basename, now)?;
            self.written = 0;
        }
        Ok(())
    }
}

impl Drop for LogFile {
    fn drop(&mut self) {
        let _ = self.file.flush();
    }
}

fn period_of(now: i64) -> i64 {
    now / ROLL_PER_SECONDS * ROLL_PER_SECONDS
}

pub(crate) fn log_file_name(basename: &str, now: i64) -> PathBuf {
    let timestamp = chrono::DateTime::from_timestamp(now, 0)
        .map(|when| when.format("%Y%m%d-%H%M%S").to_string())
        .unwrap_or_else(|| now.to_string());
    PathBuf::from(format!(
        "{}.{}.{}.{}.log",
        basename,
        timestamp,
        sys::hostname(),
        process::id(),
    ))
}

fn open_log_file(basename: &str, now: i64) -> io::Result<BufWriter<File>> {
    let path = log_file_name(basename, now);
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::with_capacity(WRITE_BUFFER_SIZE, file))
}

#[cfg(test)]
mod tests {
    use super::log_file_name;

    #[test]
    fn file_name_shape() {
        let name = log_file_name("/tmp/basename", 1_700_000_000);
        let name = name.to_string_lossy().into_owned();
        assert!(name.starts_with("/tmp/basename."), "{}", name);
        assert!(name.ends_with(".log"), "{}", name);
        assert!(name.contains(&format!(".{}.", std::process::id())), "{}", name);
    }
}
