//! Wire-level helpers for the parts of the SSH connection protocol the
//! relay interprets
//!
//! - [`payload`]: RFC 4251 field codec used by channel and global requests
//! - [`requests`]: typed channel requests (`exec`, `pty-req`, ...)
//! - [`scp`]: passive SCP sub-protocol interpreter

pub mod payload;
pub mod requests;
pub mod scp;

pub use payload::{PayloadReader, PayloadWriter, TcpInfo, read_payloads};
pub use requests::{ChannelRequest, ForwardRequest};
pub use scp::{ScpStream, TransferRecorder};
