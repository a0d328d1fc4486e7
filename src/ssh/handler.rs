//! Inbound connections from users

use super::hostkey::wire_base64;
use super::pump::{Side, pump};
use crate::backend::AccountStore;
use crate::error::{Error, Result};
use crate::logging::{EventLog, LogEvent, LogEventKind};
use crate::protocol::{ForwardRequest, PayloadReader, TcpInfo};
use crate::relay::{Dialer, Login, RelaySettings, Session};
use crate::transport::{Channel, ConnControl, ConnectionDriver, PeerEvents, channel_pair, connection_pair};
use bytes::Bytes;
use russh::keys::PublicKey;
use russh::server::{self, Auth, Msg};
use russh::{ChannelId, Disconnect};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// State shared by every inbound connection of a server
pub struct ServerContext {
    pub store: Arc<dyn AccountStore>,
    pub relay: RelaySettings,
    pub dialer: Arc<dyn Dialer>,
    pub events: EventLog,
}

/// russh server handler of one inbound connection
pub struct InboundHandler {
    ctx: Arc<ServerContext>,
    peer: SocketAddr,
    authenticated: Arc<AtomicBool>,
    /// Authorized at key check, started once authentication completes
    session: Option<Session>,
    /// Present while the relay serves this connection
    events: Option<PeerEvents>,
    agent_allowed: bool,
}

impl InboundHandler {
    pub fn new(ctx: Arc<ServerContext>, peer: SocketAddr, authenticated: Arc<AtomicBool>) -> Self {
        Self {
            ctx,
            peer,
            authenticated,
            session: None,
            events: None,
            agent_allowed: false,
        }
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    /// Resolve the key owner and authorize the requested login
    async fn authorize(&self, user: &str, key: &PublicKey) -> Result<Session> {
        let login = Login::parse(user)?;
        let identity = self.ctx.store.find_user_by_key(&wire_base64(key)?).await?;
        info!(client = %self.peer, username = %identity.username, login = %login, "public key accepted");
        Session::create(
            Arc::clone(&self.ctx.store),
            self.peer.to_string(),
            &identity,
            &login,
            &self.ctx.relay,
            self.ctx.events.clone(),
        )
        .await
    }

    /// Offer a client channel to the relay; `true` once it is bridged
    ///
    /// russh answers the open with the callback's return value, so the
    /// relay's decision is awaited here.
    async fn offer(&self, channel: russh::Channel<Msg>, kind: &str, extra: Bytes, handle: server::Handle) -> bool {
        let Some(events) = self.events.as_ref() else {
            debug!(client = %self.peer, channel = kind, "channel before session start");
            return false;
        };
        match events.offer_channel(kind, extra).await {
            Ok(driver) => {
                tokio::spawn(pump(channel, driver, Side::Inbound(handle)));
                true
            }
            Err(rejection) => {
                debug!(client = %self.peer, channel = kind, %rejection, "client channel rejected");
                false
            }
        }
    }

    async fn forward_request(&self, kind: &str, fwd: ForwardRequest) -> Option<Bytes> {
        let events = self.events.as_ref()?;
        let reply = events.request(kind, true, fwd.encode()).await;
        reply.ok.then_some(reply.payload)
    }
}

impl server::Handler for InboundHandler {
    type Error = Error;

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth> {
        match self.authorize(user, key).await {
            Ok(session) => {
                if let Session::Proxy(proxy) = &session {
                    self.agent_allowed = proxy.info().perms.has("tcp");
                }
                self.session = Some(session);
                Ok(Auth::Accept)
            }
            Err(e) => {
                warn!(client = %self.peer, user, error = %e, "authentication failed");
                self.ctx
                    .events
                    .emit(&LogEvent::auth_failure(self.peer.to_string(), e.to_string()).with_username(user));
                Ok(Self::reject())
            }
        }
    }

    async fn auth_succeeded(&mut self, session: &mut server::Session) -> Result<()> {
        let Some(relay_session) = self.session.take() else {
            return Ok(());
        };
        self.authenticated.store(true, Ordering::SeqCst);
        self.ctx.events.emit(
            &LogEvent::new(LogEventKind::AuthSuccess).with_client_id(self.peer.to_string()),
        );

        let (connection, driver) = connection_pair();
        let ConnectionDriver { control, events } = driver;
        self.events = Some(events);
        tokio::spawn(drive(session.handle(), control));

        let dialer = Arc::clone(&self.ctx.dialer);
        tokio::spawn(async move {
            relay_session.serve(connection, dialer.as_ref()).await;
        });
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: russh::Channel<Msg>,
        session: &mut server::Session,
    ) -> Result<bool> {
        let handle = session.handle();
        Ok(self.offer(channel, "session", Bytes::new(), handle).await)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: russh::Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut server::Session,
    ) -> Result<bool> {
        let extra = TcpInfo {
            address: host_to_connect.to_string(),
            port: port_to_connect,
            originator_address: originator_address.to_string(),
            originator_port,
        }
        .encode();
        let handle = session.handle();
        Ok(self.offer(channel, "direct-tcpip", extra, handle).await)
    }

    async fn agent_request(&mut self, channel: ChannelId, _session: &mut server::Session) -> Result<bool> {
        debug!(client = %self.peer, ?channel, allowed = self.agent_allowed, "agent forwarding request");
        Ok(self.agent_allowed)
    }

    async fn tcpip_forward(&mut self, address: &str, port: &mut u32, _session: &mut server::Session) -> Result<bool> {
        let fwd = ForwardRequest {
            address: address.to_string(),
            port: *port,
        };
        let Some(payload) = self.forward_request("tcpip-forward", fwd).await else {
            return Ok(false);
        };
        if *port == 0
            && let Ok(bound) = PayloadReader::new(&payload).read_u32()
        {
            *port = bound;
        }
        Ok(true)
    }

    async fn cancel_tcpip_forward(&mut self, address: &str, port: u32, _session: &mut server::Session) -> Result<bool> {
        let fwd = ForwardRequest {
            address: address.to_string(),
            port,
        };
        Ok(self.forward_request("cancel-tcpip-forward", fwd).await.is_some())
    }
}

/// Executes the relay's instructions on an inbound connection
async fn drive(handle: server::Handle, mut control: mpsc::Receiver<ConnControl>) {
    while let Some(ctl) = control.recv().await {
        match ctl {
            ConnControl::OpenChannel { kind, extra, reply } => {
                let handle = handle.clone();
                tokio::spawn(async move {
                    let _ = reply.send(open_channel(handle, &kind, &extra).await);
                });
            }
            ConnControl::Request(req) => {
                debug!(request = %req.kind, "global request to client not supported");
                req.reject();
            }
            ConnControl::Disconnect => break,
        }
    }
    let _ = handle
        .disconnect(Disconnect::ByApplication, String::new(), "en".to_string())
        .await;
    debug!("inbound connection closed");
}

/// Open a server-initiated channel on the user's client
async fn open_channel(handle: server::Handle, kind: &str, extra: &[u8]) -> Result<Channel> {
    let channel = match kind {
        "forwarded-tcpip" => {
            let info = TcpInfo::parse(extra)?;
            handle
                .channel_open_forwarded_tcpip(
                    info.address,
                    info.port,
                    info.originator_address,
                    info.originator_port,
                )
                .await
        }
        "auth-agent@openssh.com" => handle.channel_open_agent().await,
        other => return Err(Error::ChannelTypeNotSupported(other.to_string())),
    }
    .map_err(|e| Error::ChannelOpen(format!("{}: {}", kind, e)))?;

    let (relay_end, driver) = channel_pair(kind);
    tokio::spawn(pump(channel, driver, Side::Inbound(handle)));
    Ok(relay_end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AccountInfo, MemoryStore, Target};
    use futures::future::BoxFuture;
    use russh::server::Handler as _;
    use tempfile::TempDir;

    const ALICE_KEY: &str = "AAAAC3NzaC1lZDI1NTE5AAAAINaZYlYKA//CKQ3z/jxYLTlrtqkLENOuUe4s865WBXhu";

    struct NoDialer;

    impl Dialer for NoDialer {
        fn dial<'a>(&'a self, _target: &'a Target) -> BoxFuture<'a, Result<crate::transport::Connection>> {
            Box::pin(async { Err(Error::Closed) })
        }
    }

    fn handler(store: MemoryStore, dir: &TempDir) -> InboundHandler {
        let ctx = ServerContext {
            store: Arc::new(store),
            relay: RelaySettings::new(dir.path()),
            dialer: Arc::new(NoDialer),
            events: EventLog::disabled(),
        };
        InboundHandler::new(
            Arc::new(ctx),
            "192.0.2.10:40000".parse().unwrap(),
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn key() -> PublicKey {
        PublicKey::from_openssh(&format!("ssh-ed25519 {}", ALICE_KEY)).unwrap()
    }

    fn web1() -> AccountInfo {
        AccountInfo {
            host_id: 1,
            hostname: "10.0.0.1".to_string(),
            port: 22,
            host_keys: String::new(),
            account_id: 1,
            account: "root".to_string(),
            key: None,
            password: Some("pw".to_string()),
        }
    }

    fn assert_send<T: Send>(_: &T) {}

    // Type-checked only: russh requires these futures to be Send
    #[allow(dead_code)]
    fn channel_open_futures_are_send(
        handler: &mut InboundHandler,
        channel: russh::Channel<Msg>,
        session: &mut server::Session,
    ) {
        assert_send(&handler.channel_open_session(channel, session));
    }

    #[allow(dead_code)]
    fn offer_future_is_send(handler: &InboundHandler, channel: russh::Channel<Msg>, handle: server::Handle) {
        assert_send(&handler.offer(channel, "session", Bytes::new(), handle));
    }

    #[tokio::test]
    async fn test_unknown_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut h = handler(MemoryStore::new(), &dir);
        let auth = h.auth_publickey("root@web1", &key()).await.unwrap();
        assert!(matches!(auth, Auth::Reject { .. }));
        assert!(h.session.is_none());
    }

    #[tokio::test]
    async fn test_illegal_username_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new()
            .with_key(ALICE_KEY, "alice")
            .with_target("alice", "web1", web1(), "shell");
        let mut h = handler(store, &dir);
        let auth = h.auth_publickey("root", &key()).await.unwrap();
        assert!(matches!(auth, Auth::Reject { .. }));
    }

    #[tokio::test]
    async fn test_granted_key_is_accepted() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new()
            .with_key(ALICE_KEY, "alice")
            .with_target("alice", "web1", web1(), "shell,tcp");
        let mut h = handler(store, &dir);
        let auth = h.auth_publickey("root@web1", &key()).await.unwrap();
        assert!(matches!(auth, Auth::Accept));
        assert!(h.session.is_some());
        assert!(h.agent_allowed, "tcp permission allows agent forwarding");
    }
}
