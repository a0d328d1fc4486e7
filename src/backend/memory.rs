//! In-process account store

use super::{
    AccountInfo, AccountStore, Identity, Permissions, RecordLog, RecordStart, ReviewGrant,
    ServerSettings, Target,
};
use crate::error::{Error, Result};
use chrono::{Local, NaiveDateTime};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Mutex;

/// A connection record kept by [`MemoryStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub id: i64,
    pub username: String,
    pub account: String,
    pub host: String,
    pub start: NaiveDateTime,
    pub end: Option<NaiveDateTime>,
}

#[derive(Default)]
struct State {
    settings: Option<ServerSettings>,
    /// base64 wire key -> identity
    keys: HashMap<String, Identity>,
    /// (username, account, host) -> target
    targets: HashMap<(String, String, String), Target>,
    /// usernames allowed to review recordings
    auditors: Vec<String>,
    records: Vec<StoredRecord>,
    logs: Vec<(i64, RecordLog)>,
}

/// Account store holding everything in memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(self, settings: ServerSettings) -> Self {
        self.lock().settings = Some(settings);
        self
    }

    /// Register a public key (base64 wire encoding) for `username`
    pub fn with_key(self, pubkey: &str, username: &str) -> Self {
        self.lock().keys.insert(
            pubkey.to_string(),
            Identity {
                name: format!("{}-key", username),
                username: username.to_string(),
            },
        );
        self
    }

    pub fn with_target(self, username: &str, host: &str, account: AccountInfo, perms: &str) -> Self {
        let key = (username.to_string(), account.account.clone(), host.to_string());
        self.lock().targets.insert(
            key,
            Target {
                account,
                perms: Permissions::parse(perms),
                proxy: None,
                proxy_command: None,
            },
        );
        self
    }

    pub fn with_auditor(self, username: &str) -> Self {
        self.lock().auditors.push(username.to_string());
        self
    }

    pub fn records(&self) -> Vec<StoredRecord> {
        self.lock().records.clone()
    }

    /// Sub-records with their ids, in insertion order
    pub fn record_logs(&self) -> Vec<(i64, RecordLog)> {
        self.lock().logs.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain data behind; keep going
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

impl AccountStore for MemoryStore {
    fn server_settings(&self) -> BoxFuture<'_, Result<ServerSettings>> {
        Box::pin(async move {
            self.lock()
                .settings
                .clone()
                .ok_or_else(|| Error::Backend("no server settings".to_string()))
        })
    }

    fn find_user_by_key<'a>(&'a self, pubkey: &'a str) -> BoxFuture<'a, Result<Identity>> {
        Box::pin(async move {
            self.lock()
                .keys
                .get(pubkey)
                .cloned()
                .ok_or(Error::UnknownPublicKey)
        })
    }

    fn lookup_target<'a>(&'a self, username: &'a str, account: &'a str, host: &'a str) -> BoxFuture<'a, Result<Target>> {
        Box::pin(async move {
            let key = (username.to_string(), account.to_string(), host.to_string());
            self.lock()
                .targets
                .get(&key)
                .cloned()
                .ok_or_else(|| Error::Backend("account not exist.".to_string()))
        })
    }

    fn create_record<'a>(&'a self, username: &'a str, account: &'a str, host: &'a str) -> BoxFuture<'a, Result<RecordStart>> {
        Box::pin(async move {
            let mut state = self.lock();
            let record = StoredRecord {
                id: state.records.len() as i64 + 1,
                username: username.to_string(),
                account: account.to_string(),
                host: host.to_string(),
                start: now(),
                end: None,
            };
            let start = RecordStart {
                id: record.id,
                start: record.start,
            };
            state.records.push(record);
            Ok(start)
        })
    }

    fn end_record(&self, record_id: i64) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.lock();
            let record = state
                .records
                .iter_mut()
                .find(|r| r.id == record_id)
                .ok_or_else(|| Error::Backend("rec not exist.".to_string()))?;
            record.end = Some(now());
            Ok(())
        })
    }

    fn add_record_log(&self, log: RecordLog) -> BoxFuture<'_, Result<i64>> {
        Box::pin(async move {
            let mut state = self.lock();
            if !state.records.iter().any(|r| r.id == log.record_id) {
                return Err(Error::Backend("rec not exist.".to_string()));
            }
            let id = state.logs.len() as i64 + 1;
            state.logs.push((id, log));
            Ok(id)
        })
    }

    fn review_access<'a>(&'a self, username: &'a str, record_log_id: i64) -> BoxFuture<'a, Result<ReviewGrant>> {
        Box::pin(async move {
            let state = self.lock();
            let (_, log) = state
                .logs
                .iter()
                .find(|(id, _)| *id == record_log_id)
                .ok_or_else(|| Error::Backend("reclog not exist.".to_string()))?;
            let record = state
                .records
                .iter()
                .find(|r| r.id == log.record_id)
                .ok_or_else(|| Error::Backend("rec not exist.".to_string()))?;
            Ok(ReviewGrant {
                access: state.auditors.iter().any(|a| a == username),
                time: record.start,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> AccountInfo {
        AccountInfo {
            host_id: 1,
            hostname: "127.0.0.1".to_string(),
            port: 22,
            host_keys: String::new(),
            account_id: 1,
            account: "root".to_string(),
            key: None,
            password: Some("pw".to_string()),
        }
    }

    #[tokio::test]
    async fn test_record_lifecycle() {
        let store = MemoryStore::new().with_target("alice", "web", account(), "shell");
        let target = store.lookup_target("alice", "root", "web").await.unwrap();
        assert!(target.perms.has("shell"));

        let rec = store.create_record("alice", "root", "web").await.unwrap();
        let log_id = store
            .add_record_log(RecordLog::new(rec.id, "shell"))
            .await
            .unwrap();
        assert_eq!(log_id, 1);
        store.end_record(rec.id).await.unwrap();
        assert!(store.records()[0].end.is_some());
    }

    #[tokio::test]
    async fn test_unknown_key_and_target() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.find_user_by_key("AAAA").await,
            Err(Error::UnknownPublicKey)
        ));
        assert!(store.lookup_target("a", "b", "c").await.is_err());
        assert!(store.server_settings().await.is_err());
    }

    #[tokio::test]
    async fn test_review_access_requires_auditor() {
        let store = MemoryStore::new().with_auditor("bob");
        let rec = store.create_record("alice", "root", "web").await.unwrap();
        let id = store
            .add_record_log(RecordLog::new(rec.id, "shell"))
            .await
            .unwrap();
        assert!(store.review_access("bob", id).await.unwrap().access);
        assert!(!store.review_access("alice", id).await.unwrap().access);
        assert_eq!(store.review_access("bob", id).await.unwrap().time, rec.start);
    }
}
