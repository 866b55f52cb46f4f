//! Append-only, time-rotated file of received payloads, one per line.

use clap::ValueEnum;
use std::io::Write;
use std::path::Path;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use crate::errors::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogRotation {
    #[default]
    Minutely,
    Hourly,
    Daily,
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Minutely => Rotation::MINUTELY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Lines are handed to a background writer thread; dropping the log flushes it.
pub struct PayloadLog {
    writer: NonBlocking,
    _guard: WorkerGuard,
}

impl PayloadLog {
    pub fn open(dir: &Path, prefix: &str, rotation: LogRotation) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let appender = RollingFileAppender::builder()
            .rotation(rotation.into())
            .filename_prefix(prefix)
            .build(dir)
            .map_err(|e| Error::PayloadLog(e.to_string()))?;
        let (writer, guard) = tracing_appender::non_blocking(appender);
        Ok(Self {
            writer,
            _guard: guard,
        })
    }

    pub fn append(&mut self, payload: &[u8]) -> Result<()> {
        let mut line = String::from_utf8_lossy(payload).into_owned();
        line.push('\n');
        self.writer.write_all(line.as_bytes())?;
        Ok(())
    }
}

/// Concatenated contents of every rotated file in `dir`.
#[cfg(test)]
pub(crate) fn read_all(dir: &Path) -> String {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    files.sort();
    files
        .iter()
        .map(|path| std::fs::read_to_string(path).unwrap())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_are_flushed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = PayloadLog::open(dir.path(), "telemetry", LogRotation::Never).unwrap();
        log.append(br#"{"tmp":20.5}"#).unwrap();
        log.append(br#"{"tmp":20.6}"#).unwrap();
        drop(log);

        assert_eq!(read_all(dir.path()), "{\"tmp\":20.5}\n{\"tmp\":20.6}\n");
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = PayloadLog::open(dir.path(), "telemetry", LogRotation::Never).unwrap();
        log.append(&[b'o', 0xff, b'k']).unwrap();
        drop(log);

        assert_eq!(read_all(dir.path()), "o\u{fffd}k\n");
    }
}
