//! Inbound session dispatch: proxy or review

use super::{ConnectionSession, RelaySettings, ReviewSession};
use crate::backend::{AccountStore, Identity, Target};
use crate::error::{Error, Result};
use crate::logging::EventLog;
use crate::transport::Connection;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::warn;

/// Host name that selects review mode
pub const REVIEW_HOST: &str = "_";

/// What an inbound SSH username asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Login {
    /// `<account>@<host>` or `<account>/<host>`
    Proxy { account: String, host: String },
    /// `<recordlog id>@_`
    Review { record_log_id: i64 },
}

impl Login {
    /// Parse an SSH username; the first `@` wins, then the first `/`
    pub fn parse(username: &str) -> Result<Self> {
        let (account, host) = username
            .split_once('@')
            .or_else(|| username.split_once('/'))
            .ok_or_else(|| Error::IllegalUsername(username.to_string()))?;
        if account.is_empty() || host.is_empty() {
            return Err(Error::IllegalUsername(username.to_string()));
        }
        if host == REVIEW_HOST {
            let record_log_id = account
                .parse()
                .map_err(|_| Error::IllegalUsername(username.to_string()))?;
            return Ok(Login::Review { record_log_id });
        }
        Ok(Login::Proxy {
            account: account.to_string(),
            host: host.to_string(),
        })
    }
}

impl std::fmt::Display for Login {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Login::Proxy { account, host } => write!(f, "{}@{}", account, host),
            Login::Review { record_log_id } => write!(f, "{}@{}", record_log_id, REVIEW_HOST),
        }
    }
}

/// Builds the outbound connection for a proxy session
pub trait Dialer: Send + Sync {
    fn dial<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, Result<Connection>>;
}

/// An authenticated inbound session
#[derive(Debug)]
pub enum Session {
    Proxy(ConnectionSession),
    Review(ReviewSession),
}

impl Session {
    /// Authorize `login` for `identity`
    pub async fn create(
        store: Arc<dyn AccountStore>,
        client: String,
        identity: &Identity,
        login: &Login,
        settings: &RelaySettings,
        events: EventLog,
    ) -> Result<Self> {
        match login {
            Login::Proxy { account, host } => {
                ConnectionSession::create(store, client, identity, account, host, settings, events)
                    .await
                    .map(Session::Proxy)
            }
            Login::Review { record_log_id } => {
                ReviewSession::create(store.as_ref(), client, identity, *record_log_id, settings, events)
                    .await
                    .map(Session::Review)
            }
        }
    }

    /// Serve the inbound connection; proxy sessions dial their target first
    pub async fn serve(self, inbound: Connection, dialer: &dyn Dialer) {
        match self {
            Session::Proxy(session) => match dialer.dial(session.target()).await {
                Ok(outbound) => session.serve(inbound, outbound).await,
                Err(e) => {
                    warn!(record_id = session.record_id(), error = %e, "failed to connect target");
                    session.abort(&e).await;
                    inbound.handle.disconnect().await;
                }
            },
            Session::Review(review) => review.serve(inbound).await,
        }
    }
}
