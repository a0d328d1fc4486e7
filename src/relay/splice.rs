//! One-directional byte relay with audit taps

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

/// Relay buffer size; matches the usual SSH maximum packet payload
const BUF_SIZE: usize = 32 * 1024;

/// Passive observer of a relayed byte stream
///
/// Taps see every chunk after it has been read from the source and before
/// it is written to the destination. They are synchronous on purpose: a tap
/// must not apply back-pressure beyond the cost of recording a chunk.
pub trait Tap: Send {
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Called exactly once when the relay ends
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Summary of a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes: u64,
    /// The relay ended on an error rather than end-of-stream
    pub failed: bool,
}

/// Copy `source` into `dest` and every tap until end-of-stream or error
///
/// On return the source has been dropped, the destination shut down and
/// dropped, and every tap closed, each exactly once. End-of-stream is not
/// an error; any other read, write or tap error is logged and ends this
/// direction only.
pub async fn relay<R, W>(source: R, dest: W, mut taps: Vec<Box<dyn Tap>>, label: &str) -> RelayStats
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut source = source;
    let mut dest = dest;
    let mut buf = vec![0u8; BUF_SIZE];
    let mut stats = RelayStats::default();

    let result: io::Result<()> = async {
        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            let chunk = &buf[..n];
            for tap in taps.iter_mut() {
                tap.write(chunk)?;
            }
            dest.write_all(chunk).await?;
            stats.bytes += n as u64;
        }
    }
    .await;

    if let Err(e) = result {
        stats.failed = true;
        warn!(relay = label, error = %e, "relay ended with error");
    }

    drop(source);
    if let Err(e) = dest.shutdown().await {
        debug!(relay = label, error = %e, "failed to shut down relay destination");
    }
    drop(dest);
    for tap in taps.iter_mut() {
        if let Err(e) = tap.close() {
            warn!(relay = label, error = %e, "failed to close relay tap");
        }
    }

    debug!(relay = label, bytes = stats.bytes, "relay finished");
    stats
}

/// Tap that traces every chunk; used on port-forward and agent channels
pub struct DebugSink {
    name: String,
}

impl DebugSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Tap for DebugSink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        trace!(sink = %self.name, len = data.len(), data = ?data, "relay chunk");
        Ok(())
    }
}
