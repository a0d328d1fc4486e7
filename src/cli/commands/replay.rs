//! Replay command - print one sub-stream of a recording

use anyhow::{Context, Result, bail};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::cli::args::ReplayArgs;
use crate::recording::{DEFAULT_QUANTUM, LogReader, TAG_TRAILER};

/// Execute the replay command
pub async fn execute(args: ReplayArgs) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    replay(&args, &mut stdout).await
}

/// Copy the selected frames of `args.file` into `out`
pub async fn replay<W: AsyncWrite + Unpin>(args: &ReplayArgs, out: &mut W) -> Result<()> {
    if args.tag == TAG_TRAILER {
        bail!("tag {} is reserved for the end-of-recording marker", TAG_TRAILER);
    }
    let pace = if args.no_pace { Duration::ZERO } else { DEFAULT_QUANTUM };
    let mut reader = LogReader::open(&args.file, args.tag, pace)
        .await
        .with_context(|| format!("Failed to open recording: {}", args.file.display()))?
        .follow(args.follow);

    let mut total = 0usize;
    while let Some(frame) = reader.next_frame().await? {
        total += frame.len();
        out.write_all(&frame).await?;
        out.flush().await?;
    }
    debug!(
        path = %reader.path().display(),
        bytes = total,
        finished = reader.is_finished(),
        "replay done"
    );
    Ok(())
}
