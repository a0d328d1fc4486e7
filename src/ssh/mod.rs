//! russh adapters
//!
//! Everything that touches russh lives here: the inbound server, outbound
//! dialing with proxy chaining, and the pumps that bridge russh channels
//! to [`crate::transport`] drivers.

mod chain;
mod client;
mod handler;
mod hostkey;
mod limiter;
mod pump;
mod server;

pub use chain::{CommandExit, DEFAULT_REMOTE_COMMAND, LocalCommandStream, RemoteCommandStream, render_proxy_command};
pub use client::{DEFAULT_CONNECT_TIMEOUT, OutboundHandler, SshDialer};
pub use handler::{InboundHandler, ServerContext};
pub use hostkey::{KnownHostKeys, wire_base64};
pub use limiter::{Counter, DEFAULT_MAX_FAILED, DEFAULT_PROTECT_WINDOW, Limiter};
pub use server::{Limits, Registry, Server, ServerOptions};
