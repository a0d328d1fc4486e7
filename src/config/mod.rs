//! Configuration module for sshproxy
//!
//! The account service provides the listen address, host key and log
//! directory; the TOML file points at the service and can override them,
//! and tunes auditing and limits.

mod file;

use crate::relay::{AuditSettings, Capture};
use crate::ssh::{Limits, ServerOptions};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub use file::{CONFIG_ENV, Candidate, ConfigFile, Source, candidates, discover, load, parse};

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Base URL of the account service
    #[serde(default = "default_backend_url")]
    pub backend_url: String,

    /// Timeout for account service requests
    /// Format: "10s", "500ms", etc.
    #[serde(default = "default_backend_timeout")]
    pub backend_timeout: String,

    /// Listen address, overriding the account service's
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,

    /// Root of the audit files, overriding the account service's
    /// Supports environment variable and tilde expansion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,

    /// Host key file, overriding the key from the account service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_path: Option<String>,

    /// Path of the JSONL event log
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub limits: LimitsConfig,
}

/// `[audit]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    /// Write batching window of recordings, also the review pace
    #[serde(default = "default_quantum")]
    pub quantum: String,

    /// Interpret SCP streams and log each transferred file
    #[serde(default = "default_true")]
    pub file_transfers: bool,

    /// "rec" (input and output) or "flat" (raw output)
    #[serde(default)]
    pub capture: Capture,

    /// Trace every chunk on port-forward and agent channels
    #[serde(default)]
    pub debug_taps: bool,
}

/// `[limits]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    #[serde(default = "default_protect_window")]
    pub protect_window: String,

    #[serde(default = "default_max_failed")]
    pub max_failed: usize,

    #[serde(default = "default_auth_rejection_time")]
    pub auth_rejection_time: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inactivity_timeout: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            backend_timeout: default_backend_timeout(),
            listen: None,
            log_dir: None,
            host_key_path: None,
            log_path: None,
            audit: AuditConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            quantum: default_quantum(),
            file_transfers: true,
            capture: Capture::default(),
            debug_taps: false,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            protect_window: default_protect_window(),
            max_failed: default_max_failed(),
            auth_rejection_time: default_auth_rejection_time(),
            connect_timeout: default_connect_timeout(),
            drain_timeout: default_drain_timeout(),
            inactivity_timeout: None,
        }
    }
}

fn default_backend_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_backend_timeout() -> String {
    "10s".to_string()
}

fn default_quantum() -> String {
    "200ms".to_string()
}

fn default_true() -> bool {
    true
}

fn default_protect_window() -> String {
    "300s".to_string()
}

fn default_max_failed() -> usize {
    3
}

fn default_auth_rejection_time() -> String {
    "1s".to_string()
}

fn default_connect_timeout() -> String {
    "30s".to_string()
}

fn default_drain_timeout() -> String {
    "10s".to_string()
}

impl Config {
    /// Expand paths and parse durations
    pub fn expand(&self) -> crate::Result<ExpandedConfig> {
        let expand = |p: &Option<String>| -> crate::Result<Option<PathBuf>> {
            p.as_deref().map(|p| expand_path(p).map(PathBuf::from)).transpose()
        };

        let audit = AuditSettings {
            quantum: parse_duration(&self.audit.quantum)?,
            file_transfers: self.audit.file_transfers,
            capture: self.audit.capture,
            debug_taps: self.audit.debug_taps,
        };
        let limits = Limits {
            protect_window: parse_duration(&self.limits.protect_window)?,
            max_failed: self.limits.max_failed,
            auth_rejection_time: parse_duration(&self.limits.auth_rejection_time)?,
            connect_timeout: parse_duration(&self.limits.connect_timeout)?,
            drain_timeout: parse_duration(&self.limits.drain_timeout)?,
            inactivity_timeout: self
                .limits
                .inactivity_timeout
                .as_deref()
                .map(parse_duration)
                .transpose()?,
        };

        Ok(ExpandedConfig {
            backend_url: self.backend_url.trim_end_matches('/').to_string(),
            backend_timeout: parse_duration(&self.backend_timeout)?,
            log_path: expand(&self.log_path)?,
            server: ServerOptions {
                listen: self.listen.clone(),
                host_key_path: expand(&self.host_key_path)?,
                log_dir: expand(&self.log_dir)?,
                audit,
                limits,
            },
        })
    }
}

/// Configuration with paths expanded and durations parsed
#[derive(Debug, Clone)]
pub struct ExpandedConfig {
    pub backend_url: String,
    pub backend_timeout: Duration,
    /// Resolved path of the JSONL event log
    pub log_path: Option<PathBuf>,
    /// Local overrides and tuning for the SSH server
    pub server: ServerOptions,
}

/// Expand environment variables and tilde in a path string
pub fn expand_path(path: &str) -> crate::Result<String> {
    // Use shellexpand for both env vars and tilde expansion
    shellexpand::full(path)
        .map(|s| s.into_owned())
        .map_err(|e| crate::Error::Config(format!("Failed to expand path '{}': {}", path, e)))
}

/// Parse a duration string like "1h", "30m", "10s", "200ms"
pub fn parse_duration(s: &str) -> crate::Result<std::time::Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::Config("Empty duration string".to_string()));
    }

    // Find the position where the numeric part ends
    let (num_str, unit) = s
        .char_indices()
        .find(|(_, c)| c.is_alphabetic())
        .map(|(i, _)| (&s[..i], &s[i..]))
        .unwrap_or((s, "s")); // Default to seconds if no unit

    let num: u64 = num_str.trim().parse().map_err(|e| {
        crate::Error::Config(format!("Invalid duration number '{}': {}", num_str, e))
    })?;

    let seconds = match unit.to_lowercase().as_str() {
        "ms" | "msec" | "millis" => return Ok(std::time::Duration::from_millis(num)),
        "s" | "sec" | "secs" | "second" | "seconds" => num,
        "m" | "min" | "mins" | "minute" | "minutes" => num * 60,
        "h" | "hr" | "hrs" | "hour" | "hours" => num * 60 * 60,
        "d" | "day" | "days" => num * 60 * 60 * 24,
        "w" | "week" | "weeks" => num * 60 * 60 * 24 * 7,
        "" => num, // Assume seconds if no unit
        _ => {
            return Err(crate::Error::Config(format!(
                "Unknown duration unit '{}' in '{}'",
                unit, s
            )));
        }
    };

    Ok(std::time::Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_seconds() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("30sec").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5").unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_duration_millis() {
        assert_eq!(parse_duration("200ms").unwrap(), Duration::from_millis(200));
        assert_eq!(parse_duration("0ms").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_duration_minutes_and_hours() {
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn test_expand_path_env_var() {
        // SAFETY: This test runs in isolation and SSHPROXY_TEST_VAR is not used elsewhere
        unsafe { std::env::set_var("SSHPROXY_TEST_VAR", "/test/path") };
        assert_eq!(
            expand_path("$SSHPROXY_TEST_VAR/events.jsonl").unwrap(),
            "/test/path/events.jsonl"
        );
        unsafe { std::env::remove_var("SSHPROXY_TEST_VAR") };
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.backend_url, "http://127.0.0.1:8080");
        assert!(config.listen.is_none());
        assert_eq!(config.audit.quantum, "200ms");
        assert!(config.audit.file_transfers);
        assert_eq!(config.audit.capture, Capture::Rec);
        assert_eq!(config.limits.max_failed, 3);
    }

    #[test]
    fn test_expand_defaults() {
        let expanded = Config::default().expand().unwrap();
        assert_eq!(expanded.backend_timeout, Duration::from_secs(10));
        assert_eq!(expanded.server.audit, AuditSettings::default());
        assert_eq!(expanded.server.limits, Limits::default());
        assert!(expanded.server.listen.is_none());
    }

    #[test]
    fn test_parse_config_toml() {
        let toml_str = r#"
backend_url = "http://accounts.internal:8080/"
listen = "0.0.0.0:2222"
log_dir = "/var/log/sshproxy"
log_path = "/var/log/sshproxy/events.jsonl"

[audit]
quantum = "500ms"
capture = "flat"
file_transfers = false

[limits]
max_failed = 5
inactivity_timeout = "1h"
"#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.audit.capture, Capture::Flat);

        let expanded = config.expand().unwrap();
        assert_eq!(expanded.backend_url, "http://accounts.internal:8080");
        assert_eq!(expanded.server.listen.as_deref(), Some("0.0.0.0:2222"));
        assert_eq!(expanded.server.log_dir, Some(PathBuf::from("/var/log/sshproxy")));
        assert_eq!(expanded.server.audit.quantum, Duration::from_millis(500));
        assert!(!expanded.server.audit.file_transfers);
        assert_eq!(expanded.server.limits.max_failed, 5);
        assert_eq!(expanded.server.limits.inactivity_timeout, Some(Duration::from_secs(3600)));
        assert_eq!(expanded.server.limits.protect_window, Duration::from_secs(300));
    }

    #[test]
    fn test_invalid_duration_in_config() {
        let config: Config = toml::from_str("[audit]\nquantum = \"fast\"\n").unwrap();
        assert!(matches!(config.expand(), Err(crate::Error::Config(_))));
    }
}
