//! Outbound connections to targets

use super::chain::{CommandExit, DEFAULT_REMOTE_COMMAND, LocalCommandStream, RemoteCommandStream, render_proxy_command};
use super::hostkey::KnownHostKeys;
use super::pump::{Side, pump};
use crate::backend::{AccountInfo, Target};
use crate::error::{Error, Result};
use crate::protocol::{ForwardRequest, PayloadWriter, TcpInfo};
use crate::relay::Dialer;
use crate::transport::{
    Channel, ConnControl, Connection, ConnectionDriver, PeerEvents, Request, channel_pair, connection_pair,
};
use bytes::Bytes;
use futures::future::BoxFuture;
use russh::client::{self, AuthResult};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey, decode_secret_key};
use russh::{ChannelId, ChannelMsg, Disconnect};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

/// Default limit for establishing the TCP connection to a target
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// How long a closed connection waits for its proxy command to exit
const PROXY_EXIT_GRACE: Duration = Duration::from_secs(5);

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// russh client handler of an outbound connection
///
/// Without `events` (a proxy hop) server-initiated channels are refused.
pub struct OutboundHandler {
    host: String,
    known: KnownHostKeys,
    events: Option<PeerEvents>,
}

impl OutboundHandler {
    fn new(account: &AccountInfo, events: Option<PeerEvents>) -> Self {
        Self {
            host: account.hostname.clone(),
            known: KnownHostKeys::parse(&account.host_keys),
            events,
        }
    }

    async fn offer<S>(&self, channel: russh::Channel<S>, kind: &str, extra: Bytes)
    where
        S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
    {
        let Some(events) = self.events.as_ref() else {
            debug!(host = %self.host, channel = kind, "channel refused on proxy hop");
            let _ = channel.close().await;
            return;
        };
        match events.offer_channel(kind, extra).await {
            Ok(driver) => {
                tokio::spawn(pump(channel, driver, Side::Outbound));
            }
            Err(rejection) => {
                debug!(host = %self.host, channel = kind, %rejection, "server channel rejected");
                let _ = channel.close().await;
            }
        }
    }
}

impl client::Handler for OutboundHandler {
    type Error = Error;

    async fn check_server_key(&mut self, key: &PublicKey) -> Result<bool> {
        self.known.verify(&self.host, key)?;
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: russh::Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<()> {
        let extra = TcpInfo {
            address: connected_address.to_string(),
            port: connected_port,
            originator_address: originator_address.to_string(),
            originator_port,
        }
        .encode();
        self.offer(channel, "forwarded-tcpip", extra).await;
        Ok(())
    }

    async fn server_channel_open_agent_forward(
        &mut self,
        channel: russh::Channel<client::Msg>,
        _session: &mut client::Session,
    ) -> Result<()> {
        self.offer(channel, "auth-agent@openssh.com", Bytes::new()).await;
        Ok(())
    }
}

/// Connects to targets over SSH, directly or through a proxy
#[derive(Clone)]
pub struct SshDialer {
    config: Arc<client::Config>,
    connect_timeout: Duration,
}

impl SshDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        let config = client::Config {
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            keepalive_max: 3,
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
            connect_timeout,
        }
    }

    async fn connect(&self, target: &Target) -> Result<Connection> {
        let account = &target.account;
        let (stream, exit) = self.open_stream(target).await?;

        let (connection, driver) = connection_pair();
        let ConnectionDriver { control, events } = driver;
        let handler = OutboundHandler::new(account, Some(events));
        let mut handle = client::connect_stream(Arc::clone(&self.config), stream, handler).await?;
        authenticate(&mut handle, account).await?;
        info!(account = %account.account, host = %account.hostname, port = account.port, "target connected");

        tokio::spawn(drive(handle, control, exit));
        Ok(connection)
    }

    /// The byte stream the target's SSH session runs over, with the exit of
    /// the proxy command carrying it
    async fn open_stream(&self, target: &Target) -> Result<(Box<dyn Stream>, Option<CommandExit>)> {
        let account = &target.account;
        match (&target.proxy, &target.proxy_command) {
            (Some(proxy), template) => {
                let template = template.as_deref().unwrap_or(DEFAULT_REMOTE_COMMAND);
                let command = render_proxy_command(template, &account.hostname, account.port)?;
                info!(proxy = %proxy.hostname, account = %proxy.account, command = %command, "connecting through proxy account");
                let session = self.connect_hop(proxy).await?;
                let mut stream = RemoteCommandStream::exec(session, &command).await?;
                let exit = stream.take_exit();
                Ok((Box::new(stream), exit))
            }
            (None, Some(template)) => {
                let command = render_proxy_command(template, &account.hostname, account.port)?;
                info!(command = %command, "connecting through local proxy command");
                let mut stream = LocalCommandStream::spawn(&command)?;
                let exit = stream.take_exit();
                Ok((Box::new(stream), exit))
            }
            (None, None) => Ok((Box::new(self.tcp(&account.hostname, account.port).await?), None)),
        }
    }

    /// Authenticated session to a proxy account's host
    async fn connect_hop(&self, proxy: &AccountInfo) -> Result<client::Handle<OutboundHandler>> {
        let stream = self.tcp(&proxy.hostname, proxy.port).await?;
        let handler = OutboundHandler::new(proxy, None);
        let mut handle = client::connect_stream(Arc::clone(&self.config), stream, handler).await?;
        authenticate(&mut handle, proxy).await?;
        Ok(handle)
    }

    async fn tcp(&self, host: &str, port: u16) -> Result<TcpStream> {
        debug!(host, port, "dial");
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {}:{} timed out", host, port),
                ))
            })??;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}

impl Default for SshDialer {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl Dialer for SshDialer {
    fn dial<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, Result<Connection>> {
        Box::pin(self.connect(target))
    }
}

/// Log in with the account's key, falling back to its password
async fn authenticate(handle: &mut client::Handle<OutboundHandler>, account: &AccountInfo) -> Result<()> {
    let who = format!("{}@{}", account.account, account.hostname);

    if let Some(key) = account.key.as_deref() {
        let key = decode_secret_key(key, None)?;
        let hash = handle.best_supported_rsa_hash().await.ok().flatten().flatten();
        let result = handle
            .authenticate_publickey(account.account.clone(), PrivateKeyWithHashAlg::new(Arc::new(key), hash))
            .await?;
        if matches!(result, AuthResult::Success) {
            debug!(account = %who, "public key accepted");
            return Ok(());
        }
        debug!(account = %who, "public key refused");
    }

    if let Some(password) = account.password.as_deref() {
        let result = handle
            .authenticate_password(account.account.clone(), password)
            .await?;
        if matches!(result, AuthResult::Success) {
            debug!(account = %who, "password accepted");
            return Ok(());
        }
    }

    warn!(account = %who, "target refused every credential");
    Err(Error::AuthFailed(who))
}

/// Executes the relay's instructions on an outbound connection
///
/// Channel opens run concurrently so a slow target does not hold up global
/// requests; only `tcpip-forward` needs the handle exclusively.
async fn drive(
    handle: client::Handle<OutboundHandler>,
    mut control: mpsc::Receiver<ConnControl>,
    exit: Option<CommandExit>,
) {
    let handle = Arc::new(RwLock::new(handle));
    while let Some(ctl) = control.recv().await {
        match ctl {
            ConnControl::OpenChannel { kind, extra, reply } => {
                let handle = Arc::clone(&handle);
                tokio::spawn(async move {
                    let handle = handle.read().await;
                    let _ = reply.send(open_channel(&handle, &kind, &extra).await);
                });
            }
            ConnControl::Request(req) => {
                let handle = Arc::clone(&handle);
                tokio::spawn(async move { global_request(&handle, req).await });
            }
            ConnControl::Disconnect => break,
        }
    }
    let _ = handle
        .read()
        .await
        .disconnect(Disconnect::ByApplication, "", "en")
        .await;
    drop(handle);
    debug!("outbound connection closed");

    if let Some(exit) = exit {
        match exit.wait(PROXY_EXIT_GRACE).await {
            Ok(()) => debug!("proxy command exited"),
            Err(e) => warn!(error = %e, "proxy command did not exit cleanly"),
        }
    }
}

async fn open_channel(handle: &client::Handle<OutboundHandler>, kind: &str, extra: &[u8]) -> Result<Channel> {
    let channel = match kind {
        "session" => handle.channel_open_session().await,
        "direct-tcpip" => {
            let info = TcpInfo::parse(extra)?;
            handle
                .channel_open_direct_tcpip(
                    info.address,
                    info.port,
                    info.originator_address,
                    info.originator_port,
                )
                .await
        }
        other => return Err(Error::ChannelTypeNotSupported(other.to_string())),
    }
    .map_err(|e| Error::ChannelOpen(format!("{}: {}", kind, e)))?;

    let (relay_end, driver) = channel_pair(kind);
    tokio::spawn(pump(channel, driver, Side::Outbound));
    Ok(relay_end)
}

async fn global_request(handle: &RwLock<client::Handle<OutboundHandler>>, req: Request) {
    let fwd = match ForwardRequest::decode(&req.payload) {
        Ok(fwd) => fwd,
        Err(e) => {
            debug!(request = %req.kind, error = %e, "global request not relayed");
            req.reject();
            return;
        }
    };
    match req.kind.as_str() {
        "tcpip-forward" => match handle.write().await.tcpip_forward(fwd.address.clone(), fwd.port).await {
            Ok(bound) => {
                // The allocated port is only reported when port 0 was asked for
                let payload = if fwd.port == 0 {
                    PayloadWriter::new().put_u32(bound).finish()
                } else {
                    Bytes::new()
                };
                req.reply(true, payload);
            }
            Err(e) => {
                debug!(address = %fwd.address, port = fwd.port, error = %e, "remote forward refused");
                req.reject();
            }
        },
        "cancel-tcpip-forward" => {
            let ok = handle
                .read()
                .await
                .cancel_tcpip_forward(fwd.address.clone(), fwd.port)
                .await
                .is_ok();
            req.reply(ok, Bytes::new());
        }
        other => {
            debug!(request = other, "global request not relayed");
            req.reject();
        }
    }
}
