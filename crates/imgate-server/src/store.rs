//! Shared key-value directory with per-key expiry.
//!
//! Other gateway processes read location records from this store to route
//! messages to users connected elsewhere. It is treated as eventually
//! consistent and possibly unavailable: callers time out, log, and carry on.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use imgate_proto::Identity;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Directory store failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Backend refused or dropped the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Backend did not answer in time.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Key-value store with per-key TTL.
#[async_trait]
pub trait DirectoryStore: Send + Sync + fmt::Debug {
    /// Upsert `key` with a TTL.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Read a live value.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Remove `key`; returns whether it existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Remove `key` only if it currently holds `expected`.
    async fn delete_if_eq(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Reachability probe.
    async fn ping(&self) -> StoreResult<()>;
}

/// Key under which a banned identity is flagged.
#[must_use]
pub fn ban_key(identity: &Identity) -> String {
    format!("risk:ban:user:{identity}")
}

/// Key under which a kicked device is flagged.
#[must_use]
pub fn kick_key(identity: &Identity, device_id: &str) -> String {
    format!("auth:kick:{identity}:{device_id}")
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process [`DirectoryStore`] with lazy expiry plus a purge sweep.
///
/// Used by the binary in standalone mode and by tests. Availability can be
/// toggled to exercise the degraded path.
#[derive(Debug)]
pub struct MemoryDirectoryStore {
    entries: DashMap<String, StoredValue>,
    available: AtomicBool,
}

impl Default for MemoryDirectoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDirectoryStore {
    /// Create an empty, available store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Whether the store currently answers.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Set a key without TTL, bypassing availability. For seeding flags.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(
            key.into(),
            StoredValue {
                value: value.into(),
                expires_at: None,
            },
        );
    }

    /// Remaining TTL of a live key.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|v| v.is_live(now))
            .and_then(|v| v.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    /// Whether no live keys remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired keys; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, v| v.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    /// Run [`MemoryDirectoryStore::purge_expired`] every `interval` until
    /// `shutdown` fires.
    pub fn spawn_purger(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = self.purge_expired();
                        if purged > 0 {
                            debug!(purged, "purged expired directory keys");
                        }
                    }
                }
            }
        })
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }
}

#[async_trait]
impl DirectoryStore for MemoryDirectoryStore {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.check_available()?;
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        let now = Instant::now();
        let live = self
            .entries
            .get(key)
            .map(|v| (v.is_live(now), v.value.clone()));
        match live {
            Some((true, value)) => Ok(Some(value)),
            Some((false, _)) => {
                self.entries.remove_if(key, |_, v| !v.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self.entries.remove(key).is_some_and(|(_, v)| v.is_live(now)))
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .entries
            .remove_if(key, |_, v| v.is_live(now) && v.value == expected)
            .is_some())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_available()
    }
}
