//! Connection-level view: channel opens and global requests

use super::channel::{Channel, ChannelDriver, NewChannel, Rejection, channel_offer};
use super::request::{Reply, Request};
use crate::error::{Error, Result};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

const CONTROL_QUEUE: usize = 32;

/// Instruction from the relay to a connection driver
#[derive(Debug)]
pub enum ConnControl {
    OpenChannel {
        kind: String,
        extra: Bytes,
        reply: oneshot::Sender<Result<Channel>>,
    },
    Request(Request),
    Disconnect,
}

/// Opens channels on the peer and sends global requests
#[derive(Debug, Clone)]
pub struct ConnHandle {
    tx: mpsc::Sender<ConnControl>,
}

impl ConnHandle {
    /// Open a channel on the peer; fails if the peer rejects it
    pub async fn open_channel(&self, kind: &str, extra: Bytes) -> Result<Channel> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ConnControl::OpenChannel {
                kind: kind.to_string(),
                extra,
                reply,
            })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    pub async fn send_request(&self, kind: &str, want_reply: bool, payload: Bytes) -> Result<Reply> {
        let (request, pending) = Request::new(kind, want_reply, payload);
        self.tx
            .send(ConnControl::Request(request))
            .await
            .map_err(|_| Error::Closed)?;
        if !want_reply {
            return Ok(Reply::failure());
        }
        Ok(pending.wait().await)
    }

    pub async fn disconnect(&self) {
        let _ = self.tx.send(ConnControl::Disconnect).await;
    }
}

/// The relay's view of one SSH connection
///
/// Both streams end when the underlying connection is gone.
#[derive(Debug)]
pub struct Connection {
    pub handle: ConnHandle,
    pub channels: mpsc::Receiver<NewChannel>,
    pub requests: mpsc::Receiver<Request>,
}

/// The wire side of a [`Connection`]
pub struct ConnectionDriver {
    pub control: mpsc::Receiver<ConnControl>,
    pub events: PeerEvents,
}

/// Delivers channel opens and global requests received from the wire
///
/// Once every clone is dropped the relay sees the connection end.
#[derive(Debug, Clone)]
pub struct PeerEvents {
    channels: mpsc::Sender<NewChannel>,
    requests: mpsc::Sender<Request>,
}

impl PeerEvents {
    /// Offer a channel to the relay and wait for its decision
    pub async fn offer_channel(&self, kind: &str, extra: Bytes) -> std::result::Result<ChannelDriver, Rejection> {
        let (new_channel, offer) = channel_offer(kind, extra);
        if self.channels.send(new_channel).await.is_err() {
            return Err(Rejection {
                reason: super::RejectReason::ResourceShortage,
                message: "connection closed".to_string(),
            });
        }
        offer.decided().await
    }

    /// Hand a global request to the relay and wait for its reply
    pub async fn request(&self, kind: &str, want_reply: bool, payload: Bytes) -> Reply {
        let (request, pending) = Request::new(kind, want_reply, payload);
        if self.requests.send(request).await.is_err() || !want_reply {
            return Reply::failure();
        }
        pending.wait().await
    }
}

/// Create both sides of a connection
pub fn connection_pair() -> (Connection, ConnectionDriver) {
    let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);
    let (channel_tx, channel_rx) = mpsc::channel(CONTROL_QUEUE);
    let (request_tx, request_rx) = mpsc::channel(CONTROL_QUEUE);
    let connection = Connection {
        handle: ConnHandle { tx: control_tx },
        channels: channel_rx,
        requests: request_rx,
    };
    let driver = ConnectionDriver {
        control: control_rx,
        events: PeerEvents {
            channels: channel_tx,
            requests: request_tx,
        },
    };
    (connection, driver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel_pair;

    #[tokio::test]
    async fn test_open_channel_through_driver() {
        let (conn, mut driver) = connection_pair();
        let peer = tokio::spawn(async move {
            match driver.control.recv().await {
                Some(ConnControl::OpenChannel { kind, reply, .. }) => {
                    let (channel, _driver) = channel_pair(&kind);
                    let _ = reply.send(Ok(channel));
                }
                other => panic!("unexpected control {other:?}"),
            }
        });
        let channel = conn.handle.open_channel("session", Bytes::new()).await.unwrap();
        assert_eq!(channel.kind, "session");
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_offer_reaches_relay() {
        let (mut conn, driver) = connection_pair();
        let relay = tokio::spawn(async move {
            let new_channel = conn.channels.recv().await.unwrap();
            assert_eq!(new_channel.kind(), "direct-tcpip");
            let _channel = new_channel.accept();
        });
        let accepted = driver.events.offer_channel("direct-tcpip", Bytes::new()).await;
        assert!(accepted.is_ok());
        relay.await.unwrap();
    }

    #[tokio::test]
    async fn test_streams_end_when_driver_dropped() {
        let (mut conn, driver) = connection_pair();
        drop(driver);
        assert!(conn.channels.recv().await.is_none());
        assert!(conn.requests.recv().await.is_none());
        assert!(conn.handle.open_channel("session", Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_global_request_without_reply() {
        let (mut conn, driver) = connection_pair();
        let reply = driver
            .events
            .request("keepalive@openssh.com", false, Bytes::new())
            .await;
        assert!(!reply.ok);
        let req = conn.requests.recv().await.unwrap();
        assert!(!req.want_reply);
    }
}
