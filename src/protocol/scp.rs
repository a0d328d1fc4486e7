//! Passive interpreter for the SCP sub-protocol
//!
//! `scp -t` (sink) and `scp -f` (source) exchange newline-terminated control
//! records followed by raw file contents:
//!
//! ```text
//! C0644 1024 file.bin\n   file header: mode, size, name
//! <1024 bytes>            file contents
//! \0                      acknowledgement
//! ```
//!
//! Recursive and time-preserving transfers add `D` (enter directory), `E`
//! (leave directory) and `T` (timestamps) records, and either side may send
//! `\x01` / `\x02` warning and error lines. The interpreter sees a copy of
//! the stream and never alters it.

use crate::error::{Error, Result};
use crate::relay::Tap;
use std::io;
use tracing::{debug, warn};

/// Longest control record accepted before the stream is considered garbage
const MAX_HEADER_LEN: usize = 4096;

/// Receives file events from an [`ScpStream`]
pub trait TransferRecorder: Send {
    /// A file header was seen; `size` bytes of content follow
    fn on_file_transmit(&mut self, filename: &str, size: u64) -> Result<()>;

    /// A chunk of the current file's content
    fn on_file_data(&mut self, chunk: &[u8]) -> Result<()>;
}

#[derive(Debug)]
enum State {
    /// Expecting a control record; holds the partial line seen so far
    Header(Vec<u8>),
    /// Inside file contents; bytes still to come
    Payload(u64),
}

/// Write-side SCP filter
pub struct ScpStream<R> {
    recorder: R,
    state: State,
    files: u64,
}

impl<R: TransferRecorder> ScpStream<R> {
    pub fn new(recorder: R) -> Self {
        Self {
            recorder,
            state: State::Header(Vec::new()),
            files: 0,
        }
    }

    /// Content bytes the current file still expects
    pub fn pending(&self) -> u64 {
        match self.state {
            State::Payload(remaining) => remaining,
            State::Header(_) => 0,
        }
    }

    /// Number of file headers seen so far
    pub fn files(&self) -> u64 {
        self.files
    }

    pub fn recorder(&self) -> &R {
        &self.recorder
    }

    /// Feed a chunk of the stream
    pub fn feed(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            match &mut self.state {
                State::Payload(remaining) => {
                    let n = usize::try_from(*remaining)
                        .map_or(data.len(), |r| r.min(data.len()));
                    self.recorder.on_file_data(&data[..n])?;
                    *remaining -= n as u64;
                    if *remaining == 0 {
                        self.state = State::Header(Vec::new());
                    }
                    data = &data[n..];
                }
                State::Header(line) => {
                    if line.is_empty() {
                        match data[0] {
                            0 => {
                                data = &data[1..];
                                continue;
                            }
                            b'C' | b'D' | b'E' | b'T' | 0x01 | 0x02 => {}
                            other => {
                                return Err(Error::ScpStreamIllegal(format!(
                                    "unexpected byte 0x{:02x} where a control record was expected",
                                    other
                                )));
                            }
                        }
                    }

                    match data.iter().position(|&b| b == b'\n') {
                        Some(i) => {
                            line.extend_from_slice(&data[..i]);
                            data = &data[i + 1..];
                            let record = std::mem::take(line);
                            self.on_record(&record)?;
                        }
                        None => {
                            line.extend_from_slice(data);
                            data = &[];
                        }
                    }

                    if let State::Header(line) = &self.state
                        && line.len() > MAX_HEADER_LEN
                    {
                        return Err(Error::ScpStreamIllegal(format!(
                            "control record longer than {} bytes",
                            MAX_HEADER_LEN
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn on_record(&mut self, record: &[u8]) -> Result<()> {
        let text = String::from_utf8_lossy(record);
        let text = text.trim_end_matches('\r');
        match record.first() {
            Some(b'C') => {
                let (size, name) = parse_file_header(&text[1..])?;
                debug!(filename = %name, size, "scp file header");
                self.files += 1;
                self.recorder.on_file_transmit(name, size)?;
                if size > 0 {
                    self.state = State::Payload(size);
                }
            }
            Some(b'D') => debug!(record = %text, "scp enter directory"),
            Some(b'E') => debug!("scp leave directory"),
            Some(b'T') => debug!(record = %text, "scp timestamps"),
            Some(0x01) | Some(0x02) => warn!(message = %&text[1..], "scp peer reported a problem"),
            _ => {
                return Err(Error::ScpStreamIllegal(format!(
                    "malformed control record: {:?}",
                    text
                )));
            }
        }
        Ok(())
    }
}

/// Parse `<mode> <size> <name>` (the part after the `C`)
fn parse_file_header(header: &str) -> Result<(u64, &str)> {
    let mut parts = header.splitn(3, ' ');
    let mode = parts.next().unwrap_or_default();
    let size = parts.next().unwrap_or_default();
    let name = parts.next().unwrap_or_default();

    if mode.is_empty() || !mode.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
        return Err(Error::ScpStreamIllegal(format!(
            "invalid file mode in header: {:?}",
            header
        )));
    }
    let size: u64 = size.parse().map_err(|_| {
        Error::ScpStreamIllegal(format!("invalid file size in header: {:?}", header))
    })?;
    if name.is_empty() {
        return Err(Error::ScpStreamIllegal(format!(
            "missing file name in header: {:?}",
            header
        )));
    }
    Ok((size, name))
}

impl<R: TransferRecorder> Tap for ScpStream<R> {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.feed(data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn close(&mut self) -> io::Result<()> {
        if self.pending() > 0 {
            warn!(
                missing = self.pending(),
                "scp stream ended in the middle of a file"
            );
        }
        Ok(())
    }
}
