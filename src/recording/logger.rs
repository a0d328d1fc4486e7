//! Write side of the multiplexed audit log

use super::{MAX_FRAME_LEN, TAG_TRAILER, create_exclusive};
use crate::error::Result;
use crate::relay::Tap;
use chrono::NaiveDate;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

struct LoggerInner {
    path: PathBuf,
    file: Mutex<Option<File>>,
    /// Open sub-loggers
    refs: AtomicUsize,
}

impl LoggerInner {
    /// Write `data` as one or more frames, holding the file lock per frame
    fn write_frames(&self, tag: u8, data: &[u8]) -> io::Result<()> {
        for chunk in data.chunks(MAX_FRAME_LEN) {
            let mut header = [0u8; 3];
            header[0] = tag;
            header[1..].copy_from_slice(&(chunk.len() as u16).to_be_bytes());

            let mut guard = self.file.lock().map_err(|_| poisoned())?;
            let file = guard
                .as_mut()
                .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "log file closed"))?;
            file.write_all(&header)?;
            file.write_all(chunk)?;
        }
        Ok(())
    }

    /// Drop one reference; the last one writes the trailer and closes the file
    fn release(&self) -> io::Result<()> {
        if self.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return Ok(());
        }
        let mut guard = self.file.lock().map_err(|_| poisoned())?;
        if let Some(mut file) = guard.take() {
            file.write_all(&[TAG_TRAILER, 0, 0])?;
            file.flush()?;
            debug!(path = %self.path.display(), "recording closed");
        }
        Ok(())
    }
}

fn poisoned() -> io::Error {
    io::Error::other("lock poisoned")
}

/// One `.rec` file shared by the sub-streams of a channel
#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

impl Logger {
    /// Create `<base>/<YYYYMMDD>/<id>.rec`
    pub fn create(base: &Path, date: NaiveDate, id: i64) -> Result<Self> {
        let (path, file) = create_exclusive(base, date, id, "rec")?;
        debug!(path = %path.display(), "recording created");
        Ok(Self {
            inner: Arc::new(LoggerInner {
                path,
                file: Mutex::new(Some(file)),
                refs: AtomicUsize::new(0),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Open a tagged sub-stream batching writes over `quantum`
    pub fn sub_logger(&self, tag: u8, quantum: Duration) -> SubLogger {
        self.inner.refs.fetch_add(1, Ordering::AcqRel);
        SubLogger {
            shared: Arc::new(SubShared {
                logger: Arc::clone(&self.inner),
                tag,
                quantum,
                state: Mutex::new(SubState {
                    buf: Vec::new(),
                    deadline: None,
                    timer_armed: false,
                    closed: false,
                }),
            }),
        }
    }
}

struct SubShared {
    logger: Arc<LoggerInner>,
    tag: u8,
    quantum: Duration,
    state: Mutex<SubState>,
}

struct SubState {
    buf: Vec<u8>,
    /// Writes before this instant are buffered
    deadline: Option<Instant>,
    timer_armed: bool,
    closed: bool,
}

impl SubShared {
    fn flush_locked(&self, state: &mut SubState) -> io::Result<()> {
        if state.buf.is_empty() {
            return Ok(());
        }
        let buf = std::mem::take(&mut state.buf);
        self.logger.write_frames(self.tag, &buf)
    }
}

/// Tagged writer into a [`Logger`]
///
/// The first write after a quiet period goes straight to disk and opens a
/// window of one quantum; writes inside the window are buffered and flushed
/// when it expires, on the next write after it, or on close.
pub struct SubLogger {
    shared: Arc<SubShared>,
}

impl SubLogger {
    pub fn tag(&self) -> u8 {
        self.shared.tag
    }

    pub fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut state = self.shared.state.lock().map_err(|_| poisoned())?;
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "sub-logger closed"));
        }

        let now = Instant::now();
        if let Some(deadline) = state.deadline
            && now < deadline
        {
            state.buf.extend_from_slice(data);
            if !state.timer_armed {
                state.timer_armed = self.arm_timer(deadline);
            }
            return Ok(());
        }

        self.shared.flush_locked(&mut state)?;
        self.shared.logger.write_frames(self.shared.tag, data)?;
        state.deadline = Some(now + self.shared.quantum);
        Ok(())
    }

    /// Schedule a flush at `deadline`; needs a tokio runtime
    fn arm_timer(&self, deadline: Instant) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        let weak: Weak<SubShared> = Arc::downgrade(&self.shared);
        runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let Ok(mut state) = shared.state.lock() else {
                return;
            };
            state.timer_armed = false;
            if state.closed {
                return;
            }
            if let Err(e) = shared.flush_locked(&mut state) {
                warn!(error = %e, "failed to flush recording buffer");
            }
        });
        true
    }

    /// Flush pending bytes and release the file; idempotent
    pub fn close(&self) -> io::Result<()> {
        {
            let mut state = self.shared.state.lock().map_err(|_| poisoned())?;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            self.shared.flush_locked(&mut state)?;
        }
        self.shared.logger.release()
    }
}

impl Drop for SubLogger {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to close sub-logger");
        }
    }
}

impl Tap for SubLogger {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        SubLogger::write(self, data)
    }

    fn close(&mut self) -> io::Result<()> {
        SubLogger::close(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{TAG_INPUT, TAG_OUTPUT};
    use tempfile::TempDir;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()
    }

    fn frames(path: &Path) -> Vec<(u8, Vec<u8>)> {
        let data = std::fs::read(path).unwrap();
        let mut out = Vec::new();
        let mut pos = 0;
        while pos + 3 <= data.len() {
            let tag = data[pos];
            let len = u16::from_be_bytes([data[pos + 1], data[pos + 2]]) as usize;
            out.push((tag, data[pos + 3..pos + 3 + len].to_vec()));
            pos += 3 + len;
        }
        assert_eq!(pos, data.len(), "trailing partial frame");
        out
    }

    #[test]
    fn test_large_write_is_split() {
        let dir = TempDir::new().unwrap();
        let logger = Logger::create(dir.path(), date(), 1).unwrap();
        let out = logger.sub_logger(TAG_OUTPUT, Duration::ZERO);

        let data: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
        out.write(&data).unwrap();
        out.close().unwrap();

        let frames = frames(logger.path());
        let payload: Vec<u8> = frames
            .iter()
            .filter(|(tag, _)| *tag == TAG_OUTPUT)
            .flat_map(|(_, p)| p.clone())
            .collect();
        assert!(frames.iter().all(|(_, p)| p.len() <= MAX_FRAME_LEN));
        assert_eq!(frames.len(), 4); // 65535 + 65535 + 18930 + trailer
        assert_eq!(payload, data);
    }

    #[test]
    fn test_trailer_after_last_sub_logger() {
        let dir = TempDir::new().unwrap();
        let logger = Logger::create(dir.path(), date(), 2).unwrap();
        let input = logger.sub_logger(TAG_INPUT, Duration::ZERO);
        let output = logger.sub_logger(TAG_OUTPUT, Duration::ZERO);

        input.write(b"ls\r").unwrap();
        output.write(b"ls\r\n").unwrap();
        input.close().unwrap();
        assert_ne!(frames(logger.path()).last().unwrap().0, TAG_TRAILER);

        output.write(b"file\r\n").unwrap();
        output.close().unwrap();

        let frames = frames(logger.path());
        assert_eq!(
            frames,
            vec![
                (TAG_INPUT, b"ls\r".to_vec()),
                (TAG_OUTPUT, b"ls\r\n".to_vec()),
                (TAG_OUTPUT, b"file\r\n".to_vec()),
                (TAG_TRAILER, Vec::new()),
            ]
        );
    }

    #[test]
    fn test_writes_inside_quantum_are_batched() {
        let dir = TempDir::new().unwrap();
        let logger = Logger::create(dir.path(), date(), 3).unwrap();
        let out = logger.sub_logger(TAG_OUTPUT, Duration::from_secs(3600));

        out.write(b"a").unwrap();
        out.write(b"b").unwrap();
        out.write(b"c").unwrap();
        assert_eq!(frames(logger.path()).len(), 1);

        out.close().unwrap();
        let frames = frames(logger.path());
        assert_eq!(frames[0], (TAG_OUTPUT, b"a".to_vec()));
        assert_eq!(frames[1], (TAG_OUTPUT, b"bc".to_vec()));
        assert_eq!(frames[2], (TAG_TRAILER, Vec::new()));
    }

    #[tokio::test]
    async fn test_buffer_flushed_when_quantum_expires() {
        let dir = TempDir::new().unwrap();
        let logger = Logger::create(dir.path(), date(), 4).unwrap();
        let out = logger.sub_logger(TAG_OUTPUT, Duration::from_millis(30));

        out.write(b"first").unwrap();
        out.write(b"second").unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let frames = frames(logger.path());
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], (TAG_OUTPUT, b"second".to_vec()));
        out.close().unwrap();
    }

    #[test]
    fn test_close_is_idempotent_and_write_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let logger = Logger::create(dir.path(), date(), 5).unwrap();
        let out = logger.sub_logger(TAG_OUTPUT, Duration::ZERO);
        out.close().unwrap();
        out.close().unwrap();
        assert!(out.write(b"x").is_err());
        assert_eq!(frames(logger.path()), vec![(TAG_TRAILER, Vec::new())]);
    }

    #[test]
    fn test_drop_closes() {
        let dir = TempDir::new().unwrap();
        let logger = Logger::create(dir.path(), date(), 6).unwrap();
        {
            let out = logger.sub_logger(TAG_OUTPUT, Duration::from_secs(60));
            out.write(b"1").unwrap();
            out.write(b"2").unwrap();
        }
        assert_eq!(
            frames(logger.path()),
            vec![
                (TAG_OUTPUT, b"1".to_vec()),
                (TAG_OUTPUT, b"2".to_vec()),
                (TAG_TRAILER, Vec::new()),
            ]
        );
    }
}
