//! The relay core
//!
//! Everything between an authenticated inbound connection and its outbound
//! counterpart: channel classification, request forwarding, byte splicing
//! and audit capture. Only [`crate::transport`] types are used here, never
//! a concrete SSH implementation.

mod channel;
mod connection;
mod review;
mod session;
mod splice;

pub use channel::{ChannelClass, ChannelSession, Origin, parse_scp};
pub use connection::{ConnectionSession, SessionInfo};
pub use review::ReviewSession;
pub use session::{Dialer, Login, REVIEW_HOST, Session};
pub use splice::{DebugSink, RelayStats, Tap, relay};

use crate::recording::DEFAULT_QUANTUM;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How shell and exec channels are captured
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capture {
    /// Multiplexed `.rec` file with input and output sub-streams
    #[default]
    Rec,
    /// Raw output only, `.out` file
    Flat,
}

/// Audit behaviour of the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditSettings {
    /// Write batching window, also the review pace
    pub quantum: Duration,
    /// Interpret SCP streams and log each file
    pub file_transfers: bool,
    pub capture: Capture,
    /// Trace every chunk on port-forward and agent channels
    pub debug_taps: bool,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            quantum: DEFAULT_QUANTUM,
            file_transfers: true,
            capture: Capture::Rec,
            debug_taps: false,
        }
    }
}

/// Settings shared by every session of a server
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Root of the audit files
    pub log_dir: PathBuf,
    pub audit: AuditSettings,
    /// How long channel tasks may run on after their connection ended
    pub drain_timeout: Duration,
}

impl RelaySettings {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            audit: AuditSettings::default(),
            drain_timeout: Duration::from_secs(10),
        }
    }
}
