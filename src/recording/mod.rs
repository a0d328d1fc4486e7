//! Audit log files
//!
//! A `.rec` file multiplexes several logical byte streams of one channel
//! (terminal input and output) as a sequence of frames:
//!
//! ```text
//! [tag: u8][len: u16 big-endian][payload: len bytes]
//! ```
//!
//! A frame never carries more than 65535 payload bytes. When the last writer
//! of a file closes, an empty frame with tag `0x00` is appended so that live
//! readers know the recording is complete.
//!
//! Files live under `<logdir>/<YYYYMMDD>/<id>.<ext>` where the date is the
//! start date of the connection record and `id` the channel's sub-record id.
//! They are always created exclusively; an existing file is an error.

pub mod logger;
pub mod reader;

pub use logger::{Logger, SubLogger};
pub use reader::LogReader;

use crate::error::Result;
use crate::relay::Tap;
use chrono::NaiveDate;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Marks the end of a recording
pub const TAG_TRAILER: u8 = 0x00;

/// Client to server bytes (keystrokes)
pub const TAG_INPUT: u8 = 0x01;

/// Server to client bytes (terminal output)
pub const TAG_OUTPUT: u8 = 0x02;

/// Largest payload a single frame can carry
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Default write batching window and replay pace
pub const DEFAULT_QUANTUM: Duration = Duration::from_millis(200);

/// Path of a recording file
pub fn record_path(base: &Path, date: NaiveDate, id: i64, ext: &str) -> PathBuf {
    base.join(date.format("%Y%m%d").to_string())
        .join(format!("{}.{}", id, ext))
}

/// Create `<base>/<YYYYMMDD>/<id>.<ext>`, failing if it already exists
pub fn create_exclusive(base: &Path, date: NaiveDate, id: i64, ext: &str) -> Result<(PathBuf, File)> {
    let path = record_path(base, date, id, ext);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let file = options.open(&path)?;
    Ok((path, file))
}

/// Raw single-stream capture, written as-is to `<id>.out`
pub struct FlatLog {
    file: Option<File>,
    path: PathBuf,
}

impl FlatLog {
    pub fn create(base: &Path, date: NaiveDate, id: i64) -> Result<Self> {
        let (path, file) = create_exclusive(base, date, id, "out")?;
        tracing::debug!(path = %path.display(), "flat capture created");
        Ok(Self {
            file: Some(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Tap for FlatLog {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(data),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "capture closed")),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(mut file) => file.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()
    }

    #[test]
    fn test_record_path() {
        let path = record_path(Path::new("/var/log/sshproxy"), date(), 42, "rec");
        assert_eq!(path, PathBuf::from("/var/log/sshproxy/20240309/42.rec"));
    }

    #[test]
    fn test_create_exclusive_rejects_existing() {
        let dir = TempDir::new().unwrap();
        let (path, _file) = create_exclusive(dir.path(), date(), 7, "out").unwrap();
        assert!(path.exists());
        assert!(create_exclusive(dir.path(), date(), 7, "out").is_err());
    }

    #[test]
    fn test_flat_log_writes_raw_bytes() {
        let dir = TempDir::new().unwrap();
        let mut log = FlatLog::create(dir.path(), date(), 3).unwrap();
        log.write(b"$ ls\r\n").unwrap();
        log.write(b"a b c\r\n").unwrap();
        log.close().unwrap();
        assert!(log.write(b"late").is_err());

        let content = std::fs::read(log.path()).unwrap();
        assert_eq!(content, b"$ ls\r\na b c\r\n");
    }
}
