//! Live review of a recorded channel

use super::RelaySettings;
use crate::backend::{AccountStore, Identity};
use crate::error::{Error, Result};
use crate::logging::{EventLog, LogEvent, LogEventKind};
use crate::protocol::ChannelRequest;
use crate::recording::{LogReader, TAG_OUTPUT, record_path};
use crate::transport::{Channel, Connection, RejectReason};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Keys that end a review: `q` and Ctrl-C
const STOP_KEYS: [u8; 2] = [b'q', 0x03];

/// Replays a recording into the reviewer's session channels
#[derive(Debug)]
pub struct ReviewSession {
    client: String,
    username: String,
    record_log_id: i64,
    path: PathBuf,
    quantum: Duration,
    events: EventLog,
}

impl ReviewSession {
    /// Check that `identity` may review `record_log_id` and locate the file
    pub async fn create(
        store: &dyn AccountStore,
        client: String,
        identity: &Identity,
        record_log_id: i64,
        settings: &RelaySettings,
        events: EventLog,
    ) -> Result<Self> {
        let grant = store
            .review_access(&identity.username, record_log_id)
            .await?;
        if !grant.access {
            return Err(Error::NoPermission);
        }
        let path = record_path(&settings.log_dir, grant.time.date(), record_log_id, "rec");
        info!(
            client = %client,
            username = %identity.username,
            record_log_id,
            path = %path.display(),
            "review granted"
        );
        Ok(Self {
            client,
            username: identity.username.clone(),
            record_log_id,
            path,
            quantum: settings.audit.quantum,
            events,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_log_id(&self) -> i64 {
        self.record_log_id
    }

    /// Serve the reviewer's connection until it goes away
    pub async fn serve(self, inbound: Connection) {
        self.events.emit(
            &LogEvent::new(LogEventKind::Review)
                .with_client_id(&self.client)
                .with_username(&self.username)
                .with_context(serde_json::json!({ "recordlog": self.record_log_id })),
        );

        let Connection {
            handle,
            mut channels,
            mut requests,
        } = inbound;
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                offer = channels.recv() => match offer {
                    Some(new_channel) if new_channel.kind() == "session" => {
                        let channel = new_channel.accept();
                        tasks.spawn(replay(self.path.clone(), self.quantum, channel));
                    }
                    Some(new_channel) => {
                        debug!(channel = %new_channel.kind(), "review refuses channel");
                        new_channel.reject(
                            RejectReason::AdministrativelyProhibited,
                            "only session channels can review",
                        );
                    }
                    None => break,
                },
                Some(req) = requests.recv() => {
                    debug!(request = %req.kind, "review refuses global request");
                    req.reject();
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "review task failed");
                    }
                }
            }
        }

        tasks.abort_all();
        handle.disconnect().await;
        info!(record_log_id = self.record_log_id, "review finished");
    }
}

/// Stream the output sub-stream of `path` into `channel`
async fn replay(path: PathBuf, quantum: Duration, channel: Channel) {
    let Channel {
        mut reader,
        mut writer,
        handle,
        mut requests,
        ..
    } = channel;

    // Frames are read in their own task; the loop below stays responsive
    let (tx, mut frames) = mpsc::channel::<Bytes>(16);
    let reader_task = tokio::spawn(async move {
        let mut log = match LogReader::open(&path, TAG_OUTPUT, quantum).await {
            Ok(log) => log.follow(true),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot open recording");
                return;
            }
        };
        loop {
            match log.next_frame().await {
                Ok(Some(frame)) => {
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(path = %log.path().display(), error = %e, "failed to read recording");
                    break;
                }
            }
        }
    });

    let mut input = [0u8; 64];
    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => {
                    if writer.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            n = reader.read(&mut input) => match n {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if input[..n].iter().any(|b| STOP_KEYS.contains(b)) {
                        break;
                    }
                }
            },
            Some(req) = requests.recv() => req.accept(),
        }
    }

    reader_task.abort();
    let _ = writer.shutdown().await;
    let status = ChannelRequest::ExitStatus { code: 0 }.encode();
    let _ = handle.send_request("exit-status", false, status).await;
    handle.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::Logger;
    use crate::transport::channel_pair;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_replay_until_trailer() {
        let dir = TempDir::new().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let logger = Logger::create(dir.path(), date, 5).unwrap();
        let output = logger.sub_logger(TAG_OUTPUT, Duration::ZERO);
        output.write(b"hello ").unwrap();
        output.write(b"world").unwrap();
        output.close().unwrap();

        let (channel, mut driver) = channel_pair("session");
        let task = tokio::spawn(replay(logger.path().to_path_buf(), Duration::ZERO, channel));

        let mut seen = Vec::new();
        driver.data_out.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen, b"hello world");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_replay_stops_on_q() {
        let dir = TempDir::new().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let logger = Logger::create(dir.path(), date, 6).unwrap();
        // Never closed: the review would follow forever
        let output = logger.sub_logger(TAG_OUTPUT, Duration::ZERO);
        output.write(b"live").unwrap();

        let (channel, mut driver) = channel_pair("session");
        let task = tokio::spawn(replay(logger.path().to_path_buf(), Duration::ZERO, channel));

        driver.data_in.write_all(b"q").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        drop(output);
    }
}
