//! TCP listener and per-connection SSH server sessions

use super::client::{DEFAULT_CONNECT_TIMEOUT, SshDialer};
use super::handler::{InboundHandler, ServerContext};
use super::limiter::{DEFAULT_MAX_FAILED, DEFAULT_PROTECT_WINDOW, Limiter};
use crate::backend::{AccountStore, ServerSettings};
use crate::error::{Error, Result};
use crate::logging::{EventLog, LogEvent};
use crate::relay::{AuditSettings, Dialer, RelaySettings};
use russh::MethodKind;
use russh::MethodSet;
use russh::keys::{PrivateKey, decode_secret_key};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

/// Timeouts and limits of the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// How long a failed authentication counts against its address
    pub protect_window: Duration,
    /// Failures tolerated per window before an address is refused
    pub max_failed: usize,
    pub auth_rejection_time: Duration,
    pub connect_timeout: Duration,
    pub drain_timeout: Duration,
    pub inactivity_timeout: Option<Duration>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            protect_window: DEFAULT_PROTECT_WINDOW,
            max_failed: DEFAULT_MAX_FAILED,
            auth_rejection_time: Duration::from_secs(1),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            drain_timeout: Duration::from_secs(10),
            inactivity_timeout: None,
        }
    }
}

/// Local overrides of what the account service configures
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    pub listen: Option<String>,
    pub host_key_path: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub audit: AuditSettings,
    pub limits: Limits,
}

/// Live connections by peer address
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<HashMap<SocketAddr, Instant>>>,
}

impl Registry {
    fn insert(&self, peer: SocketAddr) {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(peer, Instant::now());
        }
    }

    fn remove(&self, peer: &SocketAddr) -> Option<Duration> {
        self.inner
            .lock()
            .ok()
            .and_then(|mut map| map.remove(peer))
            .map(|since| since.elapsed())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The proxy's SSH server
pub struct Server {
    listen: String,
    config: Arc<russh::server::Config>,
    ctx: Arc<ServerContext>,
    limiter: Limiter,
    registry: Registry,
    listener: Option<TcpListener>,
}

impl Server {
    /// Build a server from the account service's settings and local overrides
    pub async fn from_store(store: Arc<dyn AccountStore>, options: ServerOptions, events: EventLog) -> Result<Self> {
        let settings = store.server_settings().await?;
        debug!(listen = %settings.listen, logdir = %settings.logdir.display(), "server settings loaded");
        let host_key = match &options.host_key_path {
            Some(path) => {
                let text = tokio::fs::read_to_string(path).await.map_err(|e| {
                    Error::Config(format!("cannot read host key {}: {}", path.display(), e))
                })?;
                decode_secret_key(&text, None)?
            }
            None => decode_secret_key(&settings.hostkey, None)?,
        };
        let dialer = Arc::new(SshDialer::new(options.limits.connect_timeout));
        Ok(Self::new(store, settings, options, host_key, dialer, events))
    }

    pub fn new(
        store: Arc<dyn AccountStore>,
        settings: ServerSettings,
        options: ServerOptions,
        host_key: PrivateKey,
        dialer: Arc<dyn Dialer>,
        events: EventLog,
    ) -> Self {
        let limits = &options.limits;
        let mut methods = MethodSet::empty();
        methods.push(MethodKind::PublicKey);
        let config = russh::server::Config {
            methods,
            inactivity_timeout: limits.inactivity_timeout,
            auth_rejection_time: limits.auth_rejection_time,
            auth_rejection_time_initial: Some(Duration::ZERO),
            keys: vec![host_key],
            ..Default::default()
        };

        let mut relay = RelaySettings::new(options.log_dir.clone().unwrap_or(settings.logdir));
        relay.audit = options.audit.clone();
        relay.drain_timeout = limits.drain_timeout;

        Self {
            listen: options.listen.clone().unwrap_or(settings.listen),
            config: Arc::new(config),
            ctx: Arc::new(ServerContext {
                store,
                relay,
                dialer,
                events,
            }),
            limiter: Limiter::new(limits.protect_window, limits.max_failed),
            registry: Registry::default(),
            listener: None,
        }
    }

    /// Address the server listens on, as configured
    pub fn listen(&self) -> &str {
        &self.listen
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.listen).await.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("failed to listen on {}: {}", self.listen, e),
            ))
        })?;
        let local = listener.local_addr()?;
        info!(listen = %local, "server listening");
        self.listener = Some(listener);
        Ok(local)
    }

    /// Accept connections until the shutdown signal
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| Error::Other("server is not bound".to_string()))?;
        self.ctx.events.emit(&LogEvent::server_start(&self.listen));

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(live = self.registry.len(), "received shutdown signal, stopping server");
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = self.limiter.admit(peer.ip()) {
                            warn!(client = %peer, error = %e, "connection refused");
                            self.ctx.events.emit(&LogEvent::error(e.to_string()).with_client_id(peer.to_string()));
                            continue;
                        }
                        trace!(client = %peer, "accepted connection");
                        self.ctx.events.emit(&LogEvent::client_connect(peer.to_string()));
                        tokio::spawn(serve_connection(
                            stream,
                            peer,
                            Arc::clone(&self.config),
                            Arc::clone(&self.ctx),
                            self.limiter.clone(),
                            self.registry.clone(),
                        ));
                    }
                    Err(e) => error!(error = %e, "failed to accept connection"),
                },
            }
        }

        self.ctx.events.emit(&LogEvent::server_stop());
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<russh::server::Config>,
    ctx: Arc<ServerContext>,
    limiter: Limiter,
    registry: Registry,
) {
    let authenticated = Arc::new(AtomicBool::new(false));
    let handler = InboundHandler::new(ctx, peer, Arc::clone(&authenticated));
    registry.insert(peer);
    let _guard = scopeguard::guard(registry, move |registry| {
        if let Some(duration) = registry.remove(&peer) {
            debug!(client = %peer, ?duration, "connection finished");
        }
    });

    let result = match russh::server::run_stream(config, stream, handler).await {
        Ok(session) => session.await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        debug!(client = %peer, error = %e, "ssh session ended with error");
    }
    if !authenticated.load(Ordering::SeqCst) {
        warn!(client = %peer, "connection closed without authentication");
        limiter.failed(peer.ip());
    }
}
