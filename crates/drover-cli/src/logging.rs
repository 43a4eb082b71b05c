//! Logging setup: level filter, text or JSON output, and an optional
//! size-rotated log file.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

use crate::config::LogSection;

/// Install the global tracing subscriber per the `[log]` section.
///
/// `RUST_LOG` takes precedence over the configured level. When a filename
/// is set, output goes through a [`RotatingFileWriter`] honoring
/// `max_bytes` / `backup_count`; otherwise to stderr.
pub fn setup(log: &LogSection) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log.level.clone()));
    let json = log.format.eq_ignore_ascii_case("json");

    if log.filename.is_empty() {
        if json {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        } else {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        return Ok(());
    }

    let writer = RotatingFileWriter::open(
        PathBuf::from(&log.filename),
        log.max_bytes,
        log.backup_count,
    )?;

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Rotating file writer
// ---------------------------------------------------------------------------

/// Log-file writer with size-based rotation.
///
/// Before every write the current file size is checked; once it has
/// reached `max_bytes` the chain shifts `file -> file.1 -> file.2 -> ...`
/// (keeping `backup_count` old files) and a fresh file takes over. The
/// check runs for the life of the process, so a long `drover run` rotates
/// mid-run rather than growing without bound.
pub struct RotatingFileWriter {
    path: PathBuf,
    max_bytes: u64,
    backup_count: u32,
    file: Mutex<File>,
}

impl RotatingFileWriter {
    /// Open (or create) the log file, creating parent directories as
    /// needed.
    pub fn open(path: PathBuf, max_bytes: u64, backup_count: u32) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).with_context(|| {
                    format!("failed to create log directory {}", dir.display())
                })?;
            }
        }
        let file = open_append(&path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        Ok(Self {
            path,
            max_bytes,
            backup_count,
            file: Mutex::new(file),
        })
    }

    /// Shift the backup chain and swap in a fresh file. Best-effort: on
    /// any failure the current handle keeps receiving writes.
    fn rotate(&self, file: &mut File) {
        let _ = file.flush();
        if shift_backups(&self.path, self.backup_count).is_err() {
            return;
        }
        if let Ok(fresh) = open_append(&self.path) {
            *file = fresh;
        }
    }
}

impl<'a> MakeWriter<'a> for RotatingFileWriter {
    type Writer = RollingWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        let mut file = self.file.lock().expect("log writer lock poisoned");
        if self.max_bytes > 0 {
            let size = file.metadata().map(|m| m.len()).unwrap_or(0);
            if size >= self.max_bytes {
                self.rotate(&mut file);
            }
        }
        RollingWriter(file)
    }
}

/// Write guard handed to the subscriber for a single event.
pub struct RollingWriter<'a>(MutexGuard<'a, File>);

impl Write for RollingWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Shift `file -> file.1 -> file.2 -> ...`, discarding anything past
/// `backup_count`. With a zero count the file is simply removed.
fn shift_backups(path: &Path, backup_count: u32) -> io::Result<()> {
    let name = path.display();
    for i in (1..backup_count).rev() {
        let from = format!("{name}.{i}");
        let to = format!("{name}.{}", i + 1);
        if Path::new(&from).exists() {
            std::fs::rename(&from, &to)?;
        }
    }
    if backup_count > 0 {
        std::fs::rename(path, format!("{name}.1"))?;
    } else {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_leaves_small_file_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.log");
        let writer = RotatingFileWriter::open(path.clone(), 1024, 3).expect("open");

        for _ in 0..2 {
            let mut w = writer.make_writer();
            w.write_all(b"short line\n").expect("write");
            w.flush().expect("flush");
        }

        assert!(path.exists());
        assert!(!dir.path().join("app.log.1").exists());
    }

    #[test]
    fn writer_rotates_mid_stream() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.log");
        let writer = RotatingFileWriter::open(path.clone(), 64, 3).expect("open");

        {
            let mut w = writer.make_writer();
            w.write_all(&[b'a'; 100]).expect("write");
            w.flush().expect("flush");
        }
        // The previous write pushed the file past the limit, so the next
        // event lands in a fresh file.
        {
            let mut w = writer.make_writer();
            w.write_all(b"fresh line\n").expect("write");
            w.flush().expect("flush");
        }

        let rotated = std::fs::read(dir.path().join("app.log.1")).expect("rotated file");
        assert_eq!(rotated.len(), 100);
        let current = std::fs::read_to_string(&path).expect("current file");
        assert_eq!(current, "fresh line\n");
    }

    #[test]
    fn writer_picks_up_preexisting_oversized_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.log");
        std::fs::write(&path, vec![b'x'; 128]).expect("write");

        let writer = RotatingFileWriter::open(path.clone(), 64, 3).expect("open");
        let mut w = writer.make_writer();
        w.write_all(b"after restart\n").expect("write");
        w.flush().expect("flush");
        drop(w);

        assert_eq!(
            std::fs::read(dir.path().join("app.log.1")).expect("rotated").len(),
            128
        );
        assert_eq!(
            std::fs::read_to_string(&path).expect("current"),
            "after restart\n"
        );
    }

    #[test]
    fn rotation_shifts_existing_backups() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.log");
        std::fs::write(&path, vec![b'x'; 128]).expect("write");
        std::fs::write(dir.path().join("app.log.1"), "old-1").expect("write");
        std::fs::write(dir.path().join("app.log.2"), "old-2").expect("write");

        shift_backups(&path, 3).expect("shift");

        let shifted_1 = std::fs::read_to_string(dir.path().join("app.log.1")).expect("read");
        let shifted_2 = std::fs::read_to_string(dir.path().join("app.log.2")).expect("read");
        let shifted_3 = std::fs::read_to_string(dir.path().join("app.log.3")).expect("read");
        assert_eq!(shifted_1.len(), 128);
        assert_eq!(shifted_2, "old-1");
        assert_eq!(shifted_3, "old-2");
    }

    #[test]
    fn backups_past_the_count_are_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.log");
        std::fs::write(&path, vec![b'x'; 128]).expect("write");
        std::fs::write(dir.path().join("app.log.1"), "old-1").expect("write");
        std::fs::write(dir.path().join("app.log.2"), "old-2").expect("write");

        shift_backups(&path, 2).expect("shift");

        // old-2 fell off the end of the chain.
        assert_eq!(
            std::fs::read_to_string(dir.path().join("app.log.2")).expect("read"),
            "old-1"
        );
        assert!(!dir.path().join("app.log.3").exists());
    }

    #[test]
    fn zero_backup_count_truncates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.log");
        let writer = RotatingFileWriter::open(path.clone(), 16, 0).expect("open");

        {
            let mut w = writer.make_writer();
            w.write_all(&[b'a'; 32]).expect("write");
            w.flush().expect("flush");
        }
        {
            let mut w = writer.make_writer();
            w.write_all(b"new\n").expect("write");
            w.flush().expect("flush");
        }

        assert_eq!(std::fs::read_to_string(&path).expect("current"), "new\n");
        assert!(!dir.path().join("app.log.1").exists());
    }
}
