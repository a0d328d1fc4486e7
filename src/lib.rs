//! sshproxy - intercepting SSH proxy with an audit trail
//!
//! Users connect to the proxy with their own key and ask for `account@host`.
//! The proxy resolves the target through an account service, logs in with
//! the account's credentials and relays every channel and global request
//! between the two connections, recording terminal output, executed
//! commands, transferred files and forwarded ports along the way.

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod recording;
pub mod relay;
pub mod ssh;
pub mod transport;

pub use error::{Error, Result};

/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package name
pub const NAME: &str = env!("CARGO_PKG_NAME");
