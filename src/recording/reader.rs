//! Read side of the multiplexed audit log: filtered, paced replay

use super::TAG_TRAILER;
use crate::error::Result;
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::Instant;
use tracing::debug;

/// How often a following reader polls for appended frames
const FOLLOW_POLL: Duration = Duration::from_millis(100);

/// Replays the payloads of one tag from a `.rec` file
///
/// Matching frames are delivered at most once per `pace`, so a reviewer sees
/// output at roughly the cadence it was recorded with. In follow mode the
/// reader waits at end of file for the writer to append more frames and
/// stops only at the trailer frame.
pub struct LogReader {
    path: PathBuf,
    file: File,
    tag: u8,
    pace: Duration,
    follow: bool,
    /// Offset of the next unread frame
    pos: u64,
    next_at: Option<Instant>,
    finished: bool,
}

impl LogReader {
    pub async fn open(path: impl AsRef<Path>, tag: u8, pace: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        debug!(path = %path.display(), tag, "recording opened for replay");
        Ok(Self {
            path,
            file,
            tag,
            pace,
            follow: false,
            pos: 0,
            next_at: None,
            finished: false,
        })
    }

    /// Keep waiting at end of file until the trailer frame shows up
    pub fn follow(mut self, follow: bool) -> Self {
        self.follow = follow;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the trailer frame was reached
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next payload with the selected tag, `None` at the end of the recording
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }
        if let Some(at) = self.next_at {
            tokio::time::sleep_until(at).await;
        }

        loop {
            match self.read_frame().await? {
                Some((TAG_TRAILER, payload)) if payload.is_empty() => {
                    self.finished = true;
                    return Ok(None);
                }
                Some((tag, payload)) if tag == self.tag => {
                    if !self.pace.is_zero() {
                        self.next_at = Some(Instant::now() + self.pace);
                    }
                    return Ok(Some(payload));
                }
                Some(_) => continue,
                None if self.follow => tokio::time::sleep(FOLLOW_POLL).await,
                None => return Ok(None),
            }
        }
    }

    /// Read the frame at `pos`; `None` if it is not completely written yet
    async fn read_frame(&mut self) -> Result<Option<(u8, Bytes)>> {
        self.file.seek(SeekFrom::Start(self.pos)).await?;

        let mut header = [0u8; 3];
        if read_full(&mut self.file, &mut header).await? < header.len() {
            return Ok(None);
        }
        let len = u16::from_be_bytes([header[1], header[2]]) as usize;
        let mut payload = vec![0u8; len];
        if read_full(&mut self.file, &mut payload).await? < len {
            return Ok(None);
        }

        self.pos += (header.len() + len) as u64;
        Ok(Some((header[0], Bytes::from(payload))))
    }
}

/// Fill `buf` unless end of file comes first; returns bytes read
async fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{Logger, TAG_INPUT, TAG_OUTPUT};
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 6).unwrap()
    }

    #[tokio::test]
    async fn test_reader_filters_by_tag() {
        let dir = TempDir::new().unwrap();
        let logger = Logger::create(dir.path(), date(), 10).unwrap();
        let input = logger.sub_logger(TAG_INPUT, Duration::ZERO);
        let output = logger.sub_logger(TAG_OUTPUT, Duration::ZERO);
        input.write(b"i1").unwrap();
        output.write(b"o1").unwrap();
        input.write(b"i2").unwrap();
        output.write(b"o2").unwrap();
        input.close().unwrap();
        output.close().unwrap();

        let mut reader = LogReader::open(logger.path(), TAG_OUTPUT, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), &b"o1"[..]);
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), &b"o2"[..]);
        assert!(reader.next_frame().await.unwrap().is_none());
        assert!(reader.is_finished());
    }

    #[tokio::test]
    async fn test_reader_without_trailer_stops_at_eof() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.rec");
        std::fs::write(&path, [TAG_OUTPUT, 0, 2, b'h', b'i', TAG_OUTPUT, 0, 9, b'x']).unwrap();

        let mut reader = LogReader::open(&path, TAG_OUTPUT, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), &b"hi"[..]);
        assert!(reader.next_frame().await.unwrap().is_none());
        assert!(!reader.is_finished());
    }

    #[tokio::test]
    async fn test_reader_paces_frames() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("paced.rec");
        std::fs::write(&path, [TAG_OUTPUT, 0, 1, b'a', TAG_OUTPUT, 0, 1, b'b']).unwrap();

        let mut reader = LogReader::open(&path, TAG_OUTPUT, Duration::from_millis(50))
            .await
            .unwrap();
        let start = std::time::Instant::now();
        reader.next_frame().await.unwrap();
        reader.next_frame().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_follow_waits_for_writer() {
        let dir = TempDir::new().unwrap();
        let logger = Logger::create(dir.path(), date(), 11).unwrap();
        let output = logger.sub_logger(TAG_OUTPUT, Duration::ZERO);
        output.write(b"before").unwrap();

        let mut reader = LogReader::open(logger.path(), TAG_OUTPUT, Duration::ZERO)
            .await
            .unwrap()
            .follow(true);
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), &b"before"[..]);

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            output.write(b"after").unwrap();
            output.close().unwrap();
        });

        assert_eq!(reader.next_frame().await.unwrap().unwrap(), &b"after"[..]);
        assert!(reader.next_frame().await.unwrap().is_none());
        writer.await.unwrap();
    }
}
