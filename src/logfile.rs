/// Concurrent, crash-safe log file writer.
///
/// Any number of watcher processes may append to the same file. Each write is
/// one exclusive-lock critical section: acquire, position, header if the file
/// is logically empty, row, truncate to the end of the row, release. A write
/// that fails partway is cut back to where it started, so the file only ever
/// holds whole rows.
use crate::snapshot::InvocationRecord;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::Duration;

/// Where the row goes in an existing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Replace whatever the file held.
    Overwrite,
    Append,
}

/// What one write went through; lets callers observe contention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReport {
    /// Lock attempts, including the successful one.
    pub lock_attempts: u32,
    pub header_written: bool,
    pub bytes_written: u64,
}

#[derive(Debug)]
pub enum LogError {
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Gave up after the configured number of attempts.
    LockTimeout { path: PathBuf, attempts: u32 },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogError::Open { path, source } => {
                write!(f, "failed to open log file {}: {}", path.display(), source)
            }
            LogError::Lock { path, source } => {
                write!(f, "failed to lock log file {}: {}", path.display(), source)
            }
            LogError::LockTimeout { path, attempts } => write!(
                f,
                "log file {} still locked after {} attempts",
                path.display(),
                attempts
            ),
            LogError::Write { path, source } => {
                write!(f, "failed to write log file {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for LogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LogError::Open { source, .. }
            | LogError::Lock { source, .. }
            | LogError::Write { source, .. } => Some(source),
            LogError::LockTimeout { .. } => None,
        }
    }
}

/// Default pause between lock attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct LogWriter {
    path: PathBuf,
    mode: OpenMode,
    separator: char,
    retry_interval: Duration,
    /// `None` retries forever.
    max_attempts: Option<u32>,
}

impl LogWriter {
    pub fn new(path: impl Into<PathBuf>, mode: OpenMode) -> Self {
        Self {
            path: path.into(),
            mode,
            separator: '\t',
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_attempts: None,
        }
    }

    pub fn with_separator(mut self, separator: char) -> Self {
        self.separator = separator;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    /// Write `record` as one row.
    pub fn append(&self, record: &InvocationRecord) -> Result<WriteReport, LogError> {
        self.append_row(
            &InvocationRecord::header(self.separator),
            &record.row(self.separator),
        )
    }

    /// Write `row`, preceded by `header` when the file is logically empty.
    /// Neither string carries its line terminator.
    pub fn append_row(&self, header: &str, row: &str) -> Result<WriteReport, LogError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|source| LogError::Open {
                path: self.path.clone(),
                source,
            })?;

        let lock_attempts = self.lock(&file)?;
        let result = self.write_locked(&file, header, row);
        self.unlock(&file);

        let (header_written, bytes_written) = result?;
        tracing::debug!(
            path = %self.path.display(),
            attempts = lock_attempts,
            header = header_written,
            bytes = bytes_written,
            "log row written"
        );
        Ok(WriteReport {
            lock_attempts,
            header_written,
            bytes_written,
        })
    }

    fn lock(&self, file: &File) -> Result<u32, LogError> {
        let contended = fs2::lock_contended_error().raw_os_error();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(attempts),
                Err(e) if e.raw_os_error() == contended => {
                    if self.max_attempts.is_some_and(|max| attempts >= max) {
                        return Err(LogError::LockTimeout {
                            path: self.path.clone(),
                            attempts,
                        });
                    }
                    tracing::trace!(path = %self.path.display(), attempts, "log file busy");
                    std::thread::sleep(self.retry_interval);
                }
                Err(source) => {
                    return Err(LogError::Lock {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
        }
    }

    /// Runs under the lock. The file ends at a row boundary afterwards: just
    /// past the new row on success, back at the start position on failure.
    fn write_locked(&self, mut file: &File, header: &str, row: &str) -> Result<(bool, u64), LogError> {
        let write_err = |source| LogError::Write {
            path: self.path.clone(),
            source,
        };
        let start = match self.mode {
            OpenMode::Overwrite => file.seek(SeekFrom::Start(0)),
            OpenMode::Append => file.seek(SeekFrom::End(0)),
        }
        .map_err(write_err)?;

        let header_written = start == 0;
        let mut text = String::with_capacity(header.len() + row.len() + 2);
        if header_written {
            text.push_str(header);
            text.push('\n');
        }
        text.push_str(row);
        text.push('\n');

        if let Err(source) = file.write_all(text.as_bytes()) {
            // drop the partial row
            self.truncate(file, start);
            return Err(write_err(source));
        }
        let end = start + text.len() as u64;
        self.truncate(file, end);
        Ok((header_written, text.len() as u64))
    }

    /// Failures here never lose a row already written.
    fn truncate(&self, file: &File, len: u64) {
        if let Err(e) = file.set_len(len) {
            tracing::warn!(path = %self.path.display(), len, error = %e, "could not truncate log file");
        }
    }

    fn unlock(&self, file: &File) {
        if let Err(e) = FileExt::unlock(file) {
            tracing::warn!(path = %self.path.display(), error = %e, "could not unlock log file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::tempdir;

    fn lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_header_written_once_in_append_mode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.tsv");
        let writer = LogWriter::new(&path, OpenMode::Append);

        let first = writer.append_row("h1\th2", "a\tb").unwrap();
        let second = writer.append_row("h1\th2", "c\td").unwrap();

        assert!(first.header_written);
        assert!(!second.header_written);
        assert_eq!(second.lock_attempts, 1);
        assert_eq!(lines(&path), vec!["h1\th2", "a\tb", "c\td"]);
    }

    #[test]
    fn test_overwrite_drops_longer_previous_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.tsv");
        LogWriter::new(&path, OpenMode::Append)
            .append_row("h", "a much longer previous row than the next one")
            .unwrap();
        LogWriter::new(&path, OpenMode::Append)
            .append_row("h", "another row")
            .unwrap();

        let report = LogWriter::new(&path, OpenMode::Overwrite)
            .append_row("h", "short")
            .unwrap();

        assert!(report.header_written);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "h\nshort\n");
        assert_eq!(report.bytes_written, "h\nshort\n".len() as u64);
    }

    #[test]
    fn test_existing_empty_file_gets_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.tsv");
        std::fs::write(&path, b"").unwrap();
        let report = LogWriter::new(&path, OpenMode::Append)
            .append_row("h", "r")
            .unwrap();
        assert!(report.header_written);
        assert_eq!(lines(&path), vec!["h", "r"]);
    }

    #[test]
    fn test_lock_timeout_when_held_elsewhere() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.tsv");
        let holder = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .unwrap();
        holder.lock_exclusive().unwrap();

        let err = LogWriter::new(&path, OpenMode::Append)
            .with_retry_interval(Duration::from_millis(1))
            .with_max_attempts(3)
            .append_row("h", "r")
            .unwrap_err();
        assert!(matches!(err, LogError::LockTimeout { attempts: 3, .. }));

        FileExt::unlock(&holder).unwrap();
        let report = LogWriter::new(&path, OpenMode::Append)
            .append_row("h", "r")
            .unwrap();
        assert_eq!(report.lock_attempts, 1);
    }

    #[test]
    fn test_waits_for_lock_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.tsv");
        let holder = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .unwrap();
        holder.lock_exclusive().unwrap();

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            FileExt::unlock(&holder).unwrap();
        });
        let report = LogWriter::new(&path, OpenMode::Append)
            .with_retry_interval(Duration::from_millis(5))
            .append_row("h", "r")
            .unwrap();
        releaser.join().unwrap();

        assert!(report.lock_attempts > 1);
        assert_eq!(lines(&path), vec!["h", "r"]);
    }

    #[test]
    fn test_open_failure_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("log.tsv");
        let err = LogWriter::new(&path, OpenMode::Append)
            .append_row("h", "r")
            .unwrap_err();
        assert!(matches!(err, LogError::Open { .. }));
    }
}
