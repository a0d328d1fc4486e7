//! RPC-style requests with a single-use reply

use bytes::Bytes;
use tokio::sync::oneshot;

/// Answer to a [`Request`]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reply {
    pub ok: bool,
    pub payload: Bytes,
}

impl Reply {
    pub fn success() -> Self {
        Self {
            ok: true,
            payload: Bytes::new(),
        }
    }

    pub fn failure() -> Self {
        Self::default()
    }
}

/// A global or channel request received from a peer
///
/// Dropping a request without replying answers it with failure.
#[derive(Debug)]
pub struct Request {
    pub kind: String,
    pub want_reply: bool,
    pub payload: Bytes,
    responder: Option<oneshot::Sender<Reply>>,
}

impl Request {
    /// Build a request and the handle its sender waits on
    pub fn new(kind: impl Into<String>, want_reply: bool, payload: Bytes) -> (Self, PendingReply) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            kind: kind.into(),
            want_reply,
            payload,
            responder: Some(tx),
        };
        (request, PendingReply(rx))
    }

    pub fn reply(mut self, ok: bool, payload: Bytes) {
        if let Some(tx) = self.responder.take() {
            let _ = tx.send(Reply { ok, payload });
        }
    }

    pub fn accept(self) {
        self.reply(true, Bytes::new());
    }

    pub fn reject(self) {
        self.reply(false, Bytes::new());
    }
}

/// Receiving end of a [`Request`]'s reply
#[derive(Debug)]
pub struct PendingReply(oneshot::Receiver<Reply>);

impl PendingReply {
    /// Wait for the reply; a request dropped unanswered counts as failure
    pub async fn wait(self) -> Reply {
        self.0.await.unwrap_or_default()
    }
}
