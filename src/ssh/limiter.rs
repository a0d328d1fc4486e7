//! Failed-authentication limiter
//!
//! Each failure from an address counts for one protect window; an address
//! whose live count exceeds the limit is refused at accept time.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Default protect window
pub const DEFAULT_PROTECT_WINDOW: Duration = Duration::from_secs(300);

/// Default number of tolerated failures per window
pub const DEFAULT_MAX_FAILED: usize = 3;

/// Per-key counter whose increments expire after a fixed window
#[derive(Debug, Clone)]
pub struct Counter {
    counts: Arc<Mutex<HashMap<IpAddr, usize>>>,
    window: Duration,
}

impl Counter {
    pub fn new(window: Duration) -> Self {
        Self {
            counts: Arc::new(Mutex::new(HashMap::new())),
            window,
        }
    }

    /// Add `n` to `key`; the same amount is taken off again after the window
    pub fn add(&self, key: IpAddr, n: usize) {
        if let Ok(mut counts) = self.counts.lock() {
            *counts.entry(key).or_insert(0) += n;
        }
        let counter = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(counter.window).await;
            counter.remove(key, n);
        });
    }

    /// Take `n` off `key`, forgetting it at zero
    pub fn remove(&self, key: IpAddr, n: usize) {
        if let Ok(mut counts) = self.counts.lock() {
            if let Some(count) = counts.get_mut(&key) {
                *count = count.saturating_sub(n);
                if *count == 0 {
                    counts.remove(&key);
                }
            }
        }
    }

    pub fn number(&self, key: IpAddr) -> usize {
        self.counts
            .lock()
            .map(|counts| counts.get(&key).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

/// Bans addresses with too many recent failures
#[derive(Debug, Clone)]
pub struct Limiter {
    counter: Counter,
    max_failed: usize,
}

impl Limiter {
    pub fn new(window: Duration, max_failed: usize) -> Self {
        Self {
            counter: Counter::new(window),
            max_failed,
        }
    }

    /// Whether a new connection from `ip` should be dropped
    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.counter.number(ip) > self.max_failed
    }

    /// Refuse a banned address with [`Error::TooManyFailures`]
    pub fn admit(&self, ip: IpAddr) -> Result<()> {
        if self.is_banned(ip) {
            return Err(Error::TooManyFailures);
        }
        Ok(())
    }

    pub fn failed(&self, ip: IpAddr) {
        self.counter.add(ip, 1);
        debug!(%ip, failures = self.counter.number(ip), "authentication failure counted");
    }
}

impl Default for Limiter {
    fn default() -> Self {
        Self::new(DEFAULT_PROTECT_WINDOW, DEFAULT_MAX_FAILED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7));

    #[tokio::test(start_paused = true)]
    async fn test_counter_expires_after_window() {
        let counter = Counter::new(Duration::from_secs(10));
        counter.add(IP, 2);
        assert_eq!(counter.number(IP), 2);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(counter.number(IP), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_banned_only_above_limit() {
        let limiter = Limiter::new(Duration::from_secs(300), 3);
        for _ in 0..3 {
            limiter.failed(IP);
        }
        assert!(!limiter.is_banned(IP));
        limiter.failed(IP);
        assert!(limiter.is_banned(IP));
        assert!(matches!(limiter.admit(IP), Err(Error::TooManyFailures)));

        let other = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 8));
        assert!(!limiter.is_banned(other));
        assert!(limiter.admit(other).is_ok());

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert!(!limiter.is_banned(IP));
        assert!(limiter.admit(IP).is_ok());
    }

    #[test]
    fn test_remove_unknown_key_is_noop() {
        let counter = Counter::new(Duration::from_secs(1));
        counter.remove(IP, 1);
        assert_eq!(counter.number(IP), 0);
    }
}
