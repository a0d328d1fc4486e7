//! Account and audit record store
//!
//! The proxy delegates identity, authorization, host lookup and audit
//! record bookkeeping to an external service. [`AccountStore`] is the narrow
//! interface the rest of the crate uses; [`HttpStore`] talks to the account
//! service, [`MemoryStore`] keeps everything in process.

mod http;
mod memory;

pub use http::HttpStore;
pub use memory::MemoryStore;

use crate::error::{Error, Result};
use chrono::{NaiveDate, NaiveDateTime};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Settings the account service hands the proxy at startup
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerSettings {
    pub listen: String,
    /// Host private key, PEM/OpenSSH text
    pub hostkey: String,
    pub logdir: PathBuf,
}

/// Principal owning a public key
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Identity {
    /// Display name of the key
    #[serde(default)]
    pub name: String,
    pub username: String,
}

/// Credentials and address of one account on one host
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AccountInfo {
    #[serde(rename = "hostid", default)]
    pub host_id: i64,
    pub hostname: String,
    pub port: u16,
    /// Accepted host keys in authorized-keys format, one per line
    #[serde(rename = "hostkey", default)]
    pub host_keys: String,
    #[serde(rename = "accountid", default)]
    pub account_id: i64,
    pub account: String,
    /// Private key text
    #[serde(default, deserialize_with = "empty_as_none")]
    pub key: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub password: Option<String>,
}

/// Capability tags granted on a target (`shell`, `exec`, `scpto`, `scpfrom`, `tcp`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Permissions(BTreeSet<String>);

impl Permissions {
    /// Parse a comma separated list; blanks are ignored
    pub fn parse(list: &str) -> Self {
        Self(
            list.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn has(&self, perm: &str) -> bool {
        self.0.contains(perm)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: AsRef<str>> FromIterator<S> for Permissions {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|p| p.as_ref().trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        )
    }
}

impl std::fmt::Display for Permissions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let list: Vec<&str> = self.iter().collect();
        write!(f, "{}", list.join(","))
    }
}

impl<'de> Deserialize<'de> for Permissions {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            List(String),
            Array(Vec<String>),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::List(s) => Permissions::parse(&s),
            Raw::Array(v) => v.into_iter().collect(),
        })
    }
}

/// Everything needed to reach `account@host` on behalf of a user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub account: AccountInfo,
    pub perms: Permissions,
    /// Account to hop through before reaching the target
    pub proxy: Option<AccountInfo>,
    /// Command template providing connectivity to the target
    pub proxy_command: Option<String>,
}

/// A freshly created connection record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordStart {
    pub id: i64,
    pub start: NaiveDateTime,
}

impl RecordStart {
    /// Directory date for the record's log files
    pub fn date(&self) -> NaiveDate {
        self.start.date()
    }
}

/// One audit sub-record of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLog {
    pub record_id: i64,
    /// `shell`, `exec`, `scpto`, `scpfrom`, `local`, `remote` or `sshagent`
    pub kind: String,
    pub log1: String,
    pub log2: String,
    pub num1: i64,
}

impl RecordLog {
    pub fn new(record_id: i64, kind: &str) -> Self {
        Self {
            record_id,
            kind: kind.to_string(),
            log1: String::new(),
            log2: String::new(),
            num1: 0,
        }
    }

    pub fn with_log1(mut self, log1: impl Into<String>) -> Self {
        self.log1 = log1.into();
        self
    }

    pub fn with_log2(mut self, log2: impl Into<String>) -> Self {
        self.log2 = log2.into();
        self
    }

    pub fn with_num1(mut self, num1: i64) -> Self {
        self.num1 = num1;
        self
    }
}

/// Answer to a review request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReviewGrant {
    pub access: bool,
    /// Start time of the record the sub-record belongs to
    pub time: NaiveDateTime,
}

/// Narrow interface to the account and record service
pub trait AccountStore: Send + Sync {
    fn server_settings(&self) -> BoxFuture<'_, Result<ServerSettings>>;

    /// Resolve the owner of a public key given as base64 of its wire encoding
    fn find_user_by_key<'a>(&'a self, pubkey: &'a str) -> BoxFuture<'a, Result<Identity>>;

    fn lookup_target<'a>(&'a self, username: &'a str, account: &'a str, host: &'a str) -> BoxFuture<'a, Result<Target>>;

    fn create_record<'a>(&'a self, username: &'a str, account: &'a str, host: &'a str) -> BoxFuture<'a, Result<RecordStart>>;

    fn end_record(&self, record_id: i64) -> BoxFuture<'_, Result<()>>;

    /// Store a sub-record and return its id
    fn add_record_log(&self, log: RecordLog) -> BoxFuture<'_, Result<i64>>;

    fn review_access<'a>(&'a self, username: &'a str, record_log_id: i64) -> BoxFuture<'a, Result<ReviewGrant>>;
}

/// Parse an ISO 8601 timestamp with optional fraction, `T` or space separated
pub(crate) fn parse_timestamp(s: &str) -> Result<NaiveDateTime> {
    let s = s.trim();
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .map_err(|e| Error::Backend(format!("invalid timestamp {:?}: {}", s, e)))
}

fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}
