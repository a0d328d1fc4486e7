//! Command implementations for sshproxy CLI

pub mod completion;
pub mod config;
pub mod replay;
pub mod run;
pub mod version;
