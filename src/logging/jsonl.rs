//! JSONL (JSON Lines) logging for structured audit events
//!
//! Each event is written as a single JSON object on one line. The stream
//! complements the audit records kept by the account service: it is local,
//! append-only and easy to ship to a log collector.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

/// Log event kinds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogEventKind {
    /// Server started
    ServerStart,
    /// Server stopped
    ServerStop,
    /// TCP connection accepted
    ClientConnect,
    /// Public key accepted
    AuthSuccess,
    /// Public key or username rejected
    AuthFailure,
    /// Proxied connection established
    SessionStart,
    /// Proxied connection finished
    SessionEnd,
    /// Channel mirrored to the peer
    ChannelOpen,
    /// Channel open refused
    ChannelRejected,
    /// Channel classified by its first meaningful request
    ChannelClassified,
    /// File seen in an SCP stream
    FileTransmit,
    /// Port forward requested or opened
    PortForward,
    /// Recording review started
    Review,
    /// Error occurred
    Error,
}

impl std::fmt::Display for LogEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogEventKind::ServerStart => write!(f, "server_start"),
            LogEventKind::ServerStop => write!(f, "server_stop"),
            LogEventKind::ClientConnect => write!(f, "client_connect"),
            LogEventKind::AuthSuccess => write!(f, "auth_success"),
            LogEventKind::AuthFailure => write!(f, "auth_failure"),
            LogEventKind::SessionStart => write!(f, "session_start"),
            LogEventKind::SessionEnd => write!(f, "session_end"),
            LogEventKind::ChannelOpen => write!(f, "channel_open"),
            LogEventKind::ChannelRejected => write!(f, "channel_rejected"),
            LogEventKind::ChannelClassified => write!(f, "channel_classified"),
            LogEventKind::FileTransmit => write!(f, "file_transmit"),
            LogEventKind::PortForward => write!(f, "port_forward"),
            LogEventKind::Review => write!(f, "review"),
            LogEventKind::Error => write!(f, "error"),
        }
    }
}

/// A structured log event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    /// Timestamp of the event
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    /// Kind of event
    pub kind: LogEventKind,

    /// Client identifier (peer address)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Principal resolved from the public key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Target account
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,

    /// Target host
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Audit record id of the connection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<i64>,

    /// Channel type (`session`, `direct-tcpip`, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Channel classification (`shell`, `scpto`, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,

    /// File name or forwarded destination
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,

    /// File size or forwarded port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    /// Reason for the decision or action
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Error message (for error events)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Additional context as key-value pairs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl LogEvent {
    /// Create a new log event with the current timestamp
    pub fn new(kind: LogEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            client_id: None,
            username: None,
            account: None,
            host: None,
            record_id: None,
            channel: None,
            class: None,
            filename: None,
            size: None,
            reason: None,
            error: None,
            context: None,
        }
    }

    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set account and host together
    pub fn with_target(mut self, account: impl Into<String>, host: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self.host = Some(host.into());
        self
    }

    pub fn with_record_id(mut self, id: i64) -> Self {
        self.record_id = Some(id);
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Create a server start event
    pub fn server_start(listen: impl Into<String>) -> Self {
        Self::new(LogEventKind::ServerStart).with_context(serde_json::json!({ "listen": listen.into() }))
    }

    /// Create a server stop event
    pub fn server_stop() -> Self {
        Self::new(LogEventKind::ServerStop)
    }

    /// Create a client connect event
    pub fn client_connect(client_id: impl Into<String>) -> Self {
        Self::new(LogEventKind::ClientConnect).with_client_id(client_id)
    }

    /// Create an authentication failure event
    pub fn auth_failure(client_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(LogEventKind::AuthFailure)
            .with_client_id(client_id)
            .with_reason(reason)
    }

    /// Create a file transmit event
    pub fn file_transmit(record_id: i64, class: &str, filename: impl Into<String>, size: u64) -> Self {
        Self::new(LogEventKind::FileTransmit)
            .with_record_id(record_id)
            .with_class(class)
            .with_filename(filename)
            .with_size(size)
    }

    /// Create an error event
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogEventKind::Error).with_error(message)
    }

    /// Serialize the event to a JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// JSONL file writer with thread-safe buffered output
pub struct JsonlWriter {
    writer: Mutex<BufWriter<File>>,
}

impl JsonlWriter {
    /// Create a new JSONL writer
    ///
    /// Opens the file for appending. Creates the file if it doesn't exist.
    pub fn new<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Write a log event to the file
    pub fn write(&self, event: &LogEvent) -> std::io::Result<()> {
        let json = event
            .to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| std::io::Error::other("Lock poisoned"))?;

        writeln!(writer, "{}", json)?;
        writer.flush()?;

        Ok(())
    }

    /// Flush any buffered data to the file
    pub fn flush(&self) -> std::io::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| std::io::Error::other("Lock poisoned"))?;

        writer.flush()
    }
}

impl Drop for JsonlWriter {
    fn drop(&mut self) {
        // Best effort flush on drop
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use tempfile::NamedTempFile;

    #[test]
    fn test_log_event_new() {
        let event = LogEvent::new(LogEventKind::ServerStart);
        assert_eq!(event.kind, LogEventKind::ServerStart);
        assert!(event.client_id.is_none());
    }

    #[test]
    fn test_log_event_builder() {
        let event = LogEvent::new(LogEventKind::SessionStart)
            .with_client_id("10.0.0.5:50022")
            .with_username("alice")
            .with_target("root", "web1")
            .with_record_id(42);

        assert_eq!(event.username.as_deref(), Some("alice"));
        assert_eq!(event.account.as_deref(), Some("root"));
        assert_eq!(event.host.as_deref(), Some("web1"));
        assert_eq!(event.record_id, Some(42));
    }

    #[test]
    fn test_log_event_serialize() {
        let event = LogEvent::file_transmit(7, "scpto", "file.bin", 1024);
        let json = event.to_json().unwrap();

        assert!(json.contains("\"kind\":\"file_transmit\""));
        assert!(json.contains("\"filename\":\"file.bin\""));
        assert!(json.contains("\"size\":1024"));
        assert!(json.contains("\"timestamp\":"));
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn test_jsonl_writer() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_path_buf();

        {
            let writer = JsonlWriter::new(&path).unwrap();
            writer.write(&LogEvent::server_start("0.0.0.0:2022")).unwrap();
            writer.write(&LogEvent::client_connect("127.0.0.1:40000")).unwrap();
        }

        let file = File::open(&path).unwrap();
        let reader = BufReader::new(file);
        let lines: Vec<String> = reader.lines().map(|l| l.unwrap()).collect();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"kind\":\"server_start\""));
        assert!(lines[1].contains("\"kind\":\"client_connect\""));
    }

    #[test]
    fn test_log_event_kind_display() {
        assert_eq!(LogEventKind::ServerStart.to_string(), "server_start");
        assert_eq!(LogEventKind::ChannelClassified.to_string(), "channel_classified");
        assert_eq!(LogEventKind::PortForward.to_string(), "port_forward");
    }

    #[test]
    fn test_log_event_deserialize() {
        let event = LogEvent::auth_failure("10.0.0.9:1234", "illegal username: alice");

        let json = event.to_json().unwrap();
        let parsed: LogEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.kind, LogEventKind::AuthFailure);
        assert_eq!(parsed.reason.as_deref(), Some("illegal username: alice"));
    }
}
