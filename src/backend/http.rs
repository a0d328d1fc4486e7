//! HTTP+JSON account service client

use super::{
    AccountInfo, AccountStore, Identity, Permissions, RecordLog, RecordStart, ReviewGrant,
    ServerSettings, Target, parse_timestamp,
};
use crate::error::{Error, Result};
use futures::future::BoxFuture;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Default request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for the account service's `/l/*` endpoints
#[derive(Debug, Clone)]
pub struct HttpStore {
    base: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct TargetBody {
    #[serde(flatten)]
    account: AccountInfo,
    #[serde(default)]
    perms: Permissions,
    #[serde(default)]
    proxy: Option<AccountInfo>,
    #[serde(default)]
    proxycommand: Option<String>,
}

#[derive(Deserialize)]
struct RecordBody {
    recordid: i64,
    starttime: String,
}

#[derive(Deserialize)]
struct RecordLogBody {
    id: i64,
}

#[derive(Deserialize)]
struct ReviewBody {
    access: bool,
    time: String,
}

impl HttpStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let url = format!("{}{}", self.base, path);
        debug!(url = %url, "backend GET");
        let response = self.client.get(&url).query(query).send().await?;
        decode(path, response).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, form: &[(&str, &str)]) -> Result<T> {
        let url = format!("{}{}", self.base, path);
        debug!(url = %url, "backend POST");
        let response = self.client.post(&url).form(form).send().await?;
        decode(path, response).await
    }
}

/// Turn a response into `T`, treating `errmsg`, non-2xx and bad JSON as errors
async fn decode<T: DeserializeOwned>(path: &str, response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        return Err(Error::Backend(format!("{} returned status {}", path, status)));
    }
    let text = response.text().await?;
    decode_body(path, &text)
}

fn decode_body<T: DeserializeOwned>(path: &str, text: &str) -> Result<T> {
    // An empty body is a valid answer for endpoints that return nothing
    let text = if text.trim().is_empty() { "null" } else { text };
    let value: serde_json::Value = serde_json::from_str(text)?;
    if let Some(msg) = value.get("errmsg").and_then(|m| m.as_str()) {
        return Err(Error::Backend(format!("{}: {}", path, msg)));
    }
    Ok(serde_json::from_value(value)?)
}

impl AccountStore for HttpStore {
    fn server_settings(&self) -> BoxFuture<'_, Result<ServerSettings>> {
        Box::pin(async move { self.get("/l/cfg", &[]).await })
    }

    fn find_user_by_key<'a>(&'a self, pubkey: &'a str) -> BoxFuture<'a, Result<Identity>> {
        Box::pin(async move {
            self.get("/l/pubk", &[("pubkey", pubkey)])
                .await
                .map_err(|e| match e {
                    Error::Backend(_) => Error::UnknownPublicKey,
                    other => other,
                })
        })
    }

    fn lookup_target<'a>(&'a self, username: &'a str, account: &'a str, host: &'a str) -> BoxFuture<'a, Result<Target>> {
        Box::pin(async move {
            let body: TargetBody = self
                .get(
                    "/l/h",
                    &[("username", username), ("account", account), ("host", host)],
                )
                .await?;
            Ok(Target {
                account: body.account,
                perms: body.perms,
                proxy: body.proxy,
                proxy_command: body.proxycommand.filter(|c| !c.trim().is_empty()),
            })
        })
    }

    fn create_record<'a>(&'a self, username: &'a str, account: &'a str, host: &'a str) -> BoxFuture<'a, Result<RecordStart>> {
        Box::pin(async move {
            let body: RecordBody = self
                .post(
                    "/l/rec",
                    &[("username", username), ("account", account), ("host", host)],
                )
                .await?;
            Ok(RecordStart {
                id: body.recordid,
                start: parse_timestamp(&body.starttime)?,
            })
        })
    }

    fn end_record(&self, record_id: i64) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let id = record_id.to_string();
            let _: serde_json::Value = self.post("/l/end", &[("recordid", &id)]).await?;
            Ok(())
        })
    }

    fn add_record_log(&self, log: RecordLog) -> BoxFuture<'_, Result<i64>> {
        Box::pin(async move {
            let record_id = log.record_id.to_string();
            let num1 = log.num1.to_string();
            let body: RecordLogBody = self
                .post(
                    "/l/rlog",
                    &[
                        ("recordid", &record_id),
                        ("type", &log.kind),
                        ("log1", &log.log1),
                        ("log2", &log.log2),
                        ("num1", &num1),
                    ],
                )
                .await?;
            Ok(body.id)
        })
    }

    fn review_access<'a>(&'a self, username: &'a str, record_log_id: i64) -> BoxFuture<'a, Result<ReviewGrant>> {
        Box::pin(async move {
            let id = record_log_id.to_string();
            let body: ReviewBody = self
                .get("/l/rev", &[("username", username), ("recordlogid", &id)])
                .await?;
            Ok(ReviewGrant {
                access: body.access,
                time: parse_timestamp(&body.time)?,
            })
        })
    }
}
