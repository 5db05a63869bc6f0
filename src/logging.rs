// ABOUTME: Size-rotated file sink with a fixed, stable log line shape
// ABOUTME: The line shape and anomaly tokens are an external contract the metrics scanner parses

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::Subscriber;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::error::{ProxyError, ProxyResult};

/// A `std::io::Write` sink that rotates the underlying file once it exceeds
/// `max_bytes`, keeping up to `backup_count` numbered backups
/// (`<path>.1`, `<path>.2`, ...).
struct SizeRotatingFile {
    path: PathBuf,
    max_bytes: u64,
    backup_count: usize,
    file: File,
    written: u64,
}

impl SizeRotatingFile {
    fn open(path: impl AsRef<Path>, max_bytes: u64, backup_count: usize) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self { path, max_bytes, backup_count, file, written })
    }

    fn rotate(&mut self) -> io::Result<()> {
        if self.backup_count == 0 {
            // Nothing to keep; just truncate in place.
            self.file = OpenOptions::new().create(true).write(true).truncate(true).open(&self.path)?;
            self.written = 0;
            return Ok(());
        }

        for i in (1..self.backup_count).rev() {
            let from = self.backup_path(i);
            let to = self.backup_path(i + 1);
            if from.exists() {
                let _ = std::fs::rename(&from, &to);
            }
        }
        let _ = std::fs::rename(&self.path, self.backup_path(1));

        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.written = 0;
        Ok(())
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }
}

impl Write for SizeRotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written >= self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Wraps [`SizeRotatingFile`] behind a `Mutex` so it can implement
/// `MakeWriter` for `tracing_subscriber::fmt`; logging is best-effort and
/// never blocks the data path (writes go through `tracing_appender`'s
/// non-blocking background thread, see [`init`]).
#[derive(Clone)]
struct SharedRotatingFile(std::sync::Arc<Mutex<SizeRotatingFile>>);

impl Write for SharedRotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.lock() {
            Ok(mut inner) => inner.write(buf),
            Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.0.lock() {
            Ok(mut inner) => inner.flush(),
            Err(_) => Ok(()),
        }
    }
}

/// Formats records as `<ISO-date> <ISO-time> <LEVEL> [<name>] <message>`,
/// matching the literal shape the log metrics scanner and external dashboard
/// depend on.
pub struct ProxyLogFormat;

impl<S, N> FormatEvent<S, N> for ProxyLogFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Local::now();
        write!(
            writer,
            "{} {} {:<5} [{}] ",
            now.format("%Y-%m-%d"),
            now.format("%H:%M:%S"),
            event.metadata().level(),
            event.metadata().target(),
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Initialize the global `tracing` subscriber. Must be called exactly once,
/// at process startup. Returns the `WorkerGuard` that must be held for the
/// lifetime of the process — dropping it flushes and stops the background
/// writer thread.
pub fn init(cfg: &Config) -> ProxyResult<tracing_appender::non_blocking::WorkerGuard> {
    let rotating = SizeRotatingFile::open(&cfg.log_file, cfg.log_max_bytes, cfg.log_backup_count)
        .map_err(|source| ProxyError::LogInit { path: cfg.log_file.clone(), source })?;
    let shared = SharedRotatingFile(std::sync::Arc::new(Mutex::new(rotating)));
    let (non_blocking, guard) = tracing_appender::non_blocking(shared);

    let filter = EnvFilter::try_new(&cfg.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(ProxyLogFormat)
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn rotates_once_max_bytes_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.log");
        let mut rotating = SizeRotatingFile::open(&path, 10, 2).unwrap();
        rotating.write_all(b"0123456789").unwrap();
        rotating.write_all(b"more-data-after-threshold").unwrap();
        rotating.flush().unwrap();

        let backup_path = dir.path().join("proxy.log.1");
        assert!(backup_path.exists());
        let mut backup = String::new();
        File::open(&backup_path).unwrap().read_to_string(&mut backup).unwrap();
        assert_eq!(backup, "0123456789");

        let mut current = String::new();
        File::open(&path).unwrap().read_to_string(&mut current).unwrap();
        assert_eq!(current, "more-data-after-threshold");
    }

    #[test]
    fn keeps_at_most_backup_count_rotations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.log");
        let mut rotating = SizeRotatingFile::open(&path, 1, 2).unwrap();
        for _ in 0..5 {
            rotating.write_all(b"x").unwrap();
        }
        assert!(dir.path().join("proxy.log.1").exists());
        assert!(dir.path().join("proxy.log.2").exists());
        assert!(!dir.path().join("proxy.log.3").exists());
    }
}
