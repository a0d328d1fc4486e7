//! One proxied connection: record lifecycle, global requests, channel fan-out

use super::channel::{ChannelSession, Origin};
use super::RelaySettings;
use crate::backend::{AccountStore, Identity, Permissions, RecordStart, Target};
use crate::error::{Error, Result};
use crate::logging::{EventLog, LogEvent, LogEventKind};
use crate::protocol::ForwardRequest;
use crate::transport::{ConnHandle, Connection, NewChannel, Reply, Request};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Everything channel sessions need to know about their connection
pub struct SessionInfo {
    /// Peer address of the inbound connection
    pub client: String,
    pub username: String,
    pub account: String,
    pub host: String,
    pub perms: Permissions,
    pub record: RecordStart,
    pub log_dir: PathBuf,
    pub audit: super::AuditSettings,
    pub store: Arc<dyn AccountStore>,
    pub events: EventLog,
}

impl std::fmt::Debug for SessionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionInfo")
            .field("client", &self.client)
            .field("username", &self.username)
            .field("account", &self.account)
            .field("host", &self.host)
            .field("record", &self.record)
            .finish()
    }
}

/// A proxied SSH connection between one client and one target
#[derive(Debug)]
pub struct ConnectionSession {
    info: Arc<SessionInfo>,
    target: Target,
    drain_timeout: Duration,
}

impl ConnectionSession {
    /// Resolve the target and open the audit record
    ///
    /// Fails with [`Error::NoPermission`] when the user holds no permission
    /// on the target. Nothing is recorded in that case.
    pub async fn create(
        store: Arc<dyn AccountStore>,
        client: String,
        identity: &Identity,
        account: &str,
        host: &str,
        settings: &RelaySettings,
        events: EventLog,
    ) -> Result<Self> {
        let target = store
            .lookup_target(&identity.username, account, host)
            .await?;
        if target.perms.is_empty() {
            return Err(Error::NoPermission);
        }
        let record = store
            .create_record(&identity.username, account, host)
            .await?;
        info!(
            client = %client,
            username = %identity.username,
            account,
            host,
            record_id = record.id,
            perms = %target.perms,
            "connection record created"
        );

        let info = SessionInfo {
            client,
            username: identity.username.clone(),
            account: account.to_string(),
            host: host.to_string(),
            perms: target.perms.clone(),
            record,
            log_dir: settings.log_dir.clone(),
            audit: settings.audit.clone(),
            store,
            events,
        };
        Ok(Self {
            info: Arc::new(info),
            target,
            drain_timeout: settings.drain_timeout,
        })
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn record_id(&self) -> i64 {
        self.info.record.id
    }

    /// Give up before serving; the record is finalized right away
    pub async fn abort(self, reason: &Error) {
        warn!(record_id = self.record_id(), error = %reason, "connection aborted");
        self.info.events.emit(
            &LogEvent::error(reason.to_string())
                .with_record_id(self.record_id())
                .with_username(&self.info.username)
                .with_target(&self.info.account, &self.info.host),
        );
        self.finish().await;
    }

    /// Relay everything between `inbound` and `outbound` until both are gone
    pub async fn serve(self, inbound: Connection, outbound: Connection) {
        let info = &self.info;
        info!(
            record_id = info.record.id,
            username = %info.username,
            account = %info.account,
            host = %info.host,
            "session started"
        );
        info.events.emit(
            &LogEvent::new(LogEventKind::SessionStart)
                .with_client_id(&info.client)
                .with_username(&info.username)
                .with_target(&info.account, &info.host)
                .with_record_id(info.record.id),
        );

        let Connection {
            handle: client,
            channels: client_channels,
            requests: client_requests,
        } = inbound;
        let Connection {
            handle: server,
            channels: server_channels,
            requests: server_requests,
        } = outbound;

        tokio::join!(
            self.forward_global(client_requests, server.clone(), "client"),
            self.forward_global(server_requests, client.clone(), "server"),
            self.accept_channels(client_channels, Origin::Client, server.clone()),
            self.accept_channels(server_channels, Origin::Server, client.clone()),
        );

        info!(record_id = self.record_id(), "session finished");
        self.info.events.emit(
            &LogEvent::new(LogEventKind::SessionEnd)
                .with_client_id(&self.info.client)
                .with_record_id(self.record_id()),
        );
        self.finish().await;
    }

    async fn finish(&self) {
        // A failing store must not keep the connection from closing
        if let Err(e) = self.info.store.end_record(self.info.record.id).await {
            warn!(record_id = self.info.record.id, error = %e, "failed to finalize record");
        }
    }

    /// Opaque global request relay; port forward requests are logged
    async fn forward_global(&self, mut requests: mpsc::Receiver<Request>, peer: ConnHandle, from: &str) {
        let record_id = self.info.record.id;
        while let Some(req) = requests.recv().await {
            debug!(record_id, from, request = %req.kind, want_reply = req.want_reply, "global request");
            if req.kind == "tcpip-forward" || req.kind == "cancel-tcpip-forward" {
                match ForwardRequest::decode(&req.payload) {
                    Ok(fwd) => {
                        info!(record_id, request = %req.kind, address = %fwd.address, port = fwd.port, "remote port forward");
                        self.info.events.emit(
                            &LogEvent::new(LogEventKind::PortForward)
                                .with_record_id(record_id)
                                .with_class("remote")
                                .with_filename(&fwd.address)
                                .with_size(fwd.port as u64)
                                .with_context(serde_json::json!({ "request": req.kind })),
                        );
                    }
                    Err(e) => debug!(record_id, error = %e, "undecodable port forward request"),
                }
            }

            let reply = match peer
                .send_request(&req.kind, req.want_reply, req.payload.clone())
                .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    debug!(record_id, from, request = %req.kind, error = %e, "failed to forward global request");
                    Reply::failure()
                }
            };
            req.reply(reply.ok, reply.payload);
        }
        debug!(record_id, from, "global requests end");
    }

    /// Serve channels opened by one side until that side is gone
    ///
    /// Channel tasks get `drain_timeout` to finish after the stream ends;
    /// then the other connection is disconnected.
    async fn accept_channels(
        &self,
        mut offers: mpsc::Receiver<NewChannel>,
        origin: Origin,
        peer: ConnHandle,
    ) {
        let record_id = self.info.record.id;
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                offer = offers.recv() => match offer {
                    Some(new_channel) => {
                        tasks.spawn(ChannelSession::serve(
                            Arc::clone(&self.info),
                            new_channel,
                            origin,
                            peer.clone(),
                        ));
                    }
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!(record_id, error = %e, "channel task failed");
                    }
                }
            }
        }
        debug!(record_id, ?origin, open = tasks.len(), "channel stream ended");

        let drained = tokio::time::timeout(self.drain_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    warn!(record_id, error = %e, "channel task failed");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(record_id, ?origin, stragglers = tasks.len(), "channels did not drain in time");
            tasks.abort_all();
        }

        peer.disconnect().await;
    }
}
