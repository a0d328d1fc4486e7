//! Channels as seen by the relay
//!
//! A [`Channel`] is the relay's end: byte streams for data and extended
//! data, a handle to send requests to the peer and the stream of requests
//! the peer sent. The matching [`ChannelDriver`] is held by whatever moves
//! bytes to and from the wire (the SSH adapter or a test peer).

use super::request::{PendingReply, Reply, Request};
use crate::error::{Error, Result};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::{mpsc, oneshot};

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// In-memory buffer between a driver and the relay, per direction
const PIPE_SIZE: usize = 64 * 1024;

/// Queued requests per channel
const REQUEST_QUEUE: usize = 32;

/// Instruction from the relay to a channel driver
#[derive(Debug)]
pub enum Control {
    Request(Request),
    Close,
}

/// Sends requests to the peer and closes the channel
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    tx: mpsc::Sender<Control>,
}

impl ChannelHandle {
    /// Send a request; waits for the peer's answer when `want_reply` is set
    ///
    /// Without `want_reply` the returned reply is a failure, as the peer
    /// will not answer.
    pub async fn send_request(&self, kind: &str, want_reply: bool, payload: Bytes) -> Result<Reply> {
        let (request, pending) = Request::new(kind, want_reply, payload);
        self.tx
            .send(Control::Request(request))
            .await
            .map_err(|_| Error::Closed)?;
        if !want_reply {
            return Ok(Reply::failure());
        }
        Ok(pending.wait().await)
    }

    pub async fn close(&self) {
        let _ = self.tx.send(Control::Close).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The relay's end of an open channel
pub struct Channel {
    pub kind: String,
    pub reader: BoxReader,
    pub writer: BoxWriter,
    pub stderr_reader: BoxReader,
    pub stderr_writer: BoxWriter,
    pub handle: ChannelHandle,
    pub requests: mpsc::Receiver<Request>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("kind", &self.kind).finish()
    }
}

/// The wire end of an open channel
///
/// Bytes received from the peer are written to `data_in` / `stderr_in`;
/// bytes to send are read from `data_out` / `stderr_out`. Dropping
/// `data_in` signals end-of-stream to the relay.
pub struct ChannelDriver {
    pub kind: String,
    pub data_in: DuplexStream,
    pub data_out: DuplexStream,
    pub stderr_in: DuplexStream,
    pub stderr_out: DuplexStream,
    pub control: mpsc::Receiver<Control>,
    pub requests: RequestSender,
}

impl std::fmt::Debug for ChannelDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelDriver").field("kind", &self.kind).finish()
    }
}

/// Delivers requests received from the wire to the relay
#[derive(Debug, Clone)]
pub struct RequestSender {
    tx: mpsc::Sender<Request>,
}

impl RequestSender {
    /// Hand a request to the relay and wait for its reply
    pub async fn request(&self, kind: &str, want_reply: bool, payload: Bytes) -> Reply {
        match self.submit(kind, want_reply, payload).await {
            Some(pending) if want_reply => pending.wait().await,
            _ => Reply::failure(),
        }
    }

    /// Hand a request to the relay without waiting
    pub async fn submit(&self, kind: &str, want_reply: bool, payload: Bytes) -> Option<PendingReply> {
        let (request, pending) = Request::new(kind, want_reply, payload);
        self.tx.send(request).await.ok().map(|_| pending)
    }
}

/// Create both ends of a channel
pub fn channel_pair(kind: &str) -> (Channel, ChannelDriver) {
    let (data_in, reader) = tokio::io::duplex(PIPE_SIZE);
    let (writer, data_out) = tokio::io::duplex(PIPE_SIZE);
    let (stderr_in, stderr_reader) = tokio::io::duplex(PIPE_SIZE);
    let (stderr_writer, stderr_out) = tokio::io::duplex(PIPE_SIZE);
    let (control_tx, control_rx) = mpsc::channel(REQUEST_QUEUE);
    let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE);

    let channel = Channel {
        kind: kind.to_string(),
        reader: Box::new(reader),
        writer: Box::new(writer),
        stderr_reader: Box::new(stderr_reader),
        stderr_writer: Box::new(stderr_writer),
        handle: ChannelHandle { tx: control_tx },
        requests: request_rx,
    };
    let driver = ChannelDriver {
        kind: kind.to_string(),
        data_in,
        data_out,
        stderr_in,
        stderr_out,
        control: control_rx,
        requests: RequestSender { tx: request_tx },
    };
    (channel, driver)
}

/// Reason codes for refusing a channel (RFC 4254 section 5.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    AdministrativelyProhibited,
    ConnectFailed,
    UnknownChannelType,
    ResourceShortage,
}

impl RejectReason {
    pub fn code(self) -> u32 {
        match self {
            RejectReason::AdministrativelyProhibited => 1,
            RejectReason::ConnectFailed => 2,
            RejectReason::UnknownChannelType => 3,
            RejectReason::ResourceShortage => 4,
        }
    }
}

/// A refused channel open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: RejectReason,
    pub message: String,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:?})", self.message, self.reason)
    }
}

/// A channel the peer wants to open, waiting for accept or reject
pub struct NewChannel {
    kind: String,
    extra: Bytes,
    channel: Channel,
    decision: oneshot::Sender<std::result::Result<(), Rejection>>,
}

impl NewChannel {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Type-specific channel-open data
    pub fn extra(&self) -> &Bytes {
        &self.extra
    }

    pub fn accept(self) -> Channel {
        let _ = self.decision.send(Ok(()));
        self.channel
    }

    pub fn reject(self, reason: RejectReason, message: impl Into<String>) {
        let _ = self.decision.send(Err(Rejection {
            reason,
            message: message.into(),
        }));
    }
}

/// Driver side of a [`NewChannel`]
pub struct ChannelOffer {
    driver: ChannelDriver,
    decision: oneshot::Receiver<std::result::Result<(), Rejection>>,
}

impl ChannelOffer {
    /// Wait for the relay to accept or reject the channel
    pub async fn decided(self) -> std::result::Result<ChannelDriver, Rejection> {
        match self.decision.await {
            Ok(Ok(())) => Ok(self.driver),
            Ok(Err(rejection)) => Err(rejection),
            Err(_) => Err(Rejection {
                reason: RejectReason::ResourceShortage,
                message: "channel dropped".to_string(),
            }),
        }
    }
}

/// Create a pending channel offer
pub fn channel_offer(kind: &str, extra: Bytes) -> (NewChannel, ChannelOffer) {
    let (channel, driver) = channel_pair(kind);
    let (tx, rx) = oneshot::channel();
    let new_channel = NewChannel {
        kind: kind.to_string(),
        extra,
        channel,
        decision: tx,
    };
    (new_channel, ChannelOffer { driver, decision: rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_data_flows_between_ends() {
        let (mut channel, mut driver) = channel_pair("session");

        driver.data_in.write_all(b"from wire").await.unwrap();
        let mut buf = [0u8; 9];
        channel.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"from wire");

        channel.writer.write_all(b"to wire").await.unwrap();
        channel.writer.shutdown().await.unwrap();
        let mut out = Vec::new();
        driver.data_out.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"to wire");
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (mut channel, driver) = channel_pair("session");
        let peer = tokio::spawn(async move {
            let req = channel.requests.recv().await.unwrap();
            assert_eq!(req.kind, "shell");
            req.accept();
            channel
        });
        let reply = driver.requests.request("shell", true, Bytes::new()).await;
        assert!(reply.ok);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_close_reaches_driver() {
        let (channel, mut driver) = channel_pair("session");
        channel.handle.close().await;
        assert!(matches!(driver.control.recv().await, Some(Control::Close)));
    }

    #[tokio::test]
    async fn test_offer_rejected() {
        let (new_channel, offer) = channel_offer("x11", Bytes::new());
        assert_eq!(new_channel.kind(), "x11");
        new_channel.reject(RejectReason::UnknownChannelType, "nope");
        let rejection = offer.decided().await.unwrap_err();
        assert_eq!(rejection.reason, RejectReason::UnknownChannelType);
        assert_eq!(rejection.reason.code(), 3);
    }

    #[tokio::test]
    async fn test_offer_accepted_hands_out_driver() {
        let (new_channel, offer) = channel_offer("session", Bytes::new());
        let _channel = new_channel.accept();
        let driver = offer.decided().await.unwrap();
        assert_eq!(format!("{:?}", driver), "ChannelDriver { kind: \"session\" }");
    }

    #[tokio::test]
    async fn test_offer_dropped_counts_as_rejected() {
        let (new_channel, offer) = channel_offer("session", Bytes::new());
        drop(new_channel);
        assert!(offer.decided().await.is_err());
    }
}
