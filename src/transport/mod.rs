//! Transport-neutral connections and channels
//!
//! The relay core only sees these types. The SSH adapters in [`crate::ssh`]
//! drive them from real sessions; tests drive them directly.

mod channel;
mod connection;
mod request;

pub use channel::{
    BoxReader, BoxWriter, Channel, ChannelDriver, ChannelHandle, ChannelOffer, Control,
    NewChannel, RejectReason, Rejection, RequestSender, channel_offer, channel_pair,
};
pub use connection::{ConnControl, ConnHandle, Connection, ConnectionDriver, PeerEvents, connection_pair};
pub use request::{PendingReply, Reply, Request};
