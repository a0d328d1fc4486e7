//! Error types for sshproxy

use thiserror::Error;

/// Main error type for sshproxy
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("SSH key error: {0}")]
    SshKey(#[from] russh::keys::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The account service answered with an `errmsg` or an unusable body
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("illegal username: {0}")]
    IllegalUsername(String),

    #[error("unknown public key")]
    UnknownPublicKey,

    #[error("no permission")]
    NoPermission,

    #[error("host key not match")]
    HostKeyMismatch,

    #[error("authentication to {0} failed")]
    AuthFailed(String),

    #[error("channel type not supported: {0}")]
    ChannelTypeNotSupported(String),

    #[error("channel open failed: {0}")]
    ChannelOpen(String),

    #[error("scp stream illegal: {0}")]
    ScpStreamIllegal(String),

    #[error("proxy command failed: {0}")]
    ProxyCommand(String),

    #[error("banned because failed too many times")]
    TooManyFailures,

    #[error("connection closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;
