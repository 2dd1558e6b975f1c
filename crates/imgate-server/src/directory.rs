//! Session directory: which identities are connected here, and on which
//! connections.
//!
//! Two concurrent maps are kept in step:
//!
//! - forward: `identity -> [SessionEntry]`, governed by the [`DevicePolicy`]
//! - reverse: `connection id -> identity`, at most one entry per connection
//!
//! Every mutation takes the forward shard first and edits the reverse map
//! while still holding it, so a reader of the forward map never sees a
//! connection whose reverse entry is missing or stale. Locks are per-shard;
//! there is no global session lock.
//!
//! Alongside the local maps, each online identity has a location record in
//! the shared [`DirectoryStore`]. Store failures never fail a connection:
//! they are counted, logged and retried in the background, and the record's
//! TTL cleans up after a crashed process. Record writes for one identity
//! are serialized behind a per-identity lock and re-check local state once
//! they hold it, so a publish and a withdraw never race each other.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use imgate_proto::{Envelope, Identity};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DevicePolicy, SessionConfig};
use crate::connection::{ConnectionHandle, ConnectionId};
use crate::state::CloseReason;
use crate::store::{DirectoryStore, StoreError, StoreResult, ban_key, kick_key};

/// Tunables for the directory and its location records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectorySettings {
    /// Device multiplicity rule.
    pub policy: DevicePolicy,
    /// Value written into location records.
    pub node_locator: String,
    /// Prefix of location record keys.
    pub key_prefix: String,
    /// Location record TTL.
    pub location_ttl: Duration,
    /// Re-publish period for online identities.
    pub refresh_interval: Duration,
    /// Deadline for one store call.
    pub store_timeout: Duration,
    /// Total attempts for a location write.
    pub retry_attempts: u32,
    /// Delay before the first retry.
    pub retry_base: Duration,
}

impl DirectorySettings {
    /// Build settings from the `[session]` table and the node locator.
    #[must_use]
    pub fn from_config(config: &SessionConfig, node_locator: impl Into<String>) -> Self {
        Self {
            policy: config.device_policy,
            node_locator: node_locator.into(),
            key_prefix: config.key_prefix.clone(),
            location_ttl: Duration::from_secs(config.location_ttl_secs),
            refresh_interval: Duration::from_secs(config.location_refresh_secs),
            store_timeout: Duration::from_millis(config.store_timeout_ms),
            retry_attempts: config.store_retry_attempts,
            retry_base: Duration::from_millis(config.store_retry_base_ms),
        }
    }
}

/// Result of delivering to one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Queued on this many local connections.
    Delivered(usize),
    /// No open local connection for the identity.
    NotOnlineLocally,
}

/// Result of delivering to several identities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Connections the envelope was queued on.
    pub delivered: usize,
    /// Identities with no open local connection.
    pub not_online: Vec<Identity>,
}

/// Verdict of the post-verification admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Connection may proceed.
    Allowed,
    /// Identity carries a ban flag.
    Banned,
    /// Device carries a kick flag.
    Kicked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocationOp {
    Publish,
    Withdraw,
}

impl LocationOp {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Withdraw => "withdraw",
        }
    }
}

#[derive(Debug, Clone)]
struct SessionEntry {
    handle: ConnectionHandle,
    device_id: Option<String>,
    registered_at: DateTime<Utc>,
}

#[derive(Debug)]
struct DirectoryInner {
    forward: DashMap<Identity, Vec<SessionEntry>>,
    reverse: DashMap<ConnectionId, Identity>,
    store: Arc<dyn DirectoryStore>,
    settings: DirectorySettings,
    store_failures: AtomicU64,
    location_locks: DashMap<Identity, Arc<Mutex<()>>>,
}

/// Shared registry of local sessions. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SessionDirectory {
    inner: Arc<DirectoryInner>,
}

impl SessionDirectory {
    /// Create an empty directory backed by `store`.
    #[must_use]
    pub fn new(store: Arc<dyn DirectoryStore>, settings: DirectorySettings) -> Self {
        Self {
            inner: Arc::new(DirectoryInner {
                forward: DashMap::new(),
                reverse: DashMap::new(),
                store,
                settings,
                store_failures: AtomicU64::new(0),
                location_locks: DashMap::new(),
            }),
        }
    }

    /// Settings in use.
    #[must_use]
    pub fn settings(&self) -> &DirectorySettings {
        &self.inner.settings
    }

    /// Device policy in force.
    #[must_use]
    pub fn policy(&self) -> DevicePolicy {
        self.inner.settings.policy
    }

    /// Key of the location record for `identity`.
    #[must_use]
    pub fn location_key(&self, identity: &Identity) -> String {
        format!("{}{identity}", self.inner.settings.key_prefix)
    }

    /// Map `identity` to `handle` and publish its location record.
    ///
    /// Under [`DevicePolicy::SingleActive`] every other connection held by the
    /// identity is removed from the maps and closed with
    /// [`CloseReason::Evicted`]. Returns how many connections were evicted.
    pub async fn register(
        &self,
        identity: Identity,
        handle: ConnectionHandle,
        device_id: Option<String>,
    ) -> usize {
        let conn_id = handle.id();
        let evicted = {
            let mut slot = self.inner.forward.entry(identity.clone()).or_default();
            let evicted: Vec<SessionEntry> = match self.inner.settings.policy {
                DevicePolicy::SingleActive => {
                    let (keep, evicted) = std::mem::take(&mut *slot)
                        .into_iter()
                        .partition(|e| e.handle.id() == conn_id);
                    *slot = keep;
                    evicted
                }
                DevicePolicy::MultiDevice => Vec::new(),
            };
            for entry in &evicted {
                self.inner
                    .reverse
                    .remove_if(&entry.handle.id(), |_, owner| owner == &identity);
            }
            slot.retain(|e| e.handle.id() != conn_id);
            slot.push(SessionEntry {
                handle,
                device_id,
                registered_at: Utc::now(),
            });
            self.inner.reverse.insert(conn_id, identity.clone());
            evicted
        };

        for entry in &evicted {
            info!(
                identity = %identity,
                conn_id = %entry.handle.id(),
                replaced_by = %conn_id,
                device_id = entry.device_id.as_deref().unwrap_or("-"),
                "evicting previous connection"
            );
            entry.handle.close(CloseReason::Evicted);
        }

        self.update_location(LocationOp::Publish, &identity).await;
        evicted.len()
    }

    /// Remove the session held by connection `id`.
    ///
    /// Safe to call more than once, or for a connection that never
    /// registered; only the first call for a registered connection returns
    /// its identity. When the identity's last local connection goes, its
    /// location record is withdrawn if it still names this node.
    pub async fn unregister(&self, id: ConnectionId) -> Option<Identity> {
        let identity = self.inner.reverse.get(&id).map(|r| r.value().clone())?;

        let now_offline = match self.inner.forward.entry(identity.clone()) {
            Entry::Occupied(mut slot) => {
                let removed = self
                    .inner
                    .reverse
                    .remove_if(&id, |_, owner| owner == &identity)
                    .is_some();
                if !removed {
                    return None;
                }
                slot.get_mut().retain(|e| e.handle.id() != id);
                if slot.get().is_empty() {
                    slot.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => {
                self.inner
                    .reverse
                    .remove_if(&id, |_, owner| owner == &identity)?;
                true
            }
        };

        debug!(identity = %identity, conn_id = %id, now_offline, "session removed");
        if now_offline {
            self.update_location(LocationOp::Withdraw, &identity).await;
        }
        Some(identity)
    }

    /// Most recently registered open connection of `identity`.
    #[must_use]
    pub fn lookup_local(&self, identity: &Identity) -> Option<ConnectionHandle> {
        self.inner.forward.get(identity).and_then(|slot| {
            slot.iter()
                .rev()
                .find(|e| e.handle.is_open())
                .map(|e| e.handle.clone())
        })
    }

    /// Every open connection of `identity`, oldest first.
    #[must_use]
    pub fn lookup_all(&self, identity: &Identity) -> Vec<ConnectionHandle> {
        self.inner
            .forward
            .get(identity)
            .map(|slot| {
                slot.iter()
                    .filter(|e| e.handle.is_open())
                    .map(|e| e.handle.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Identity registered on connection `id`.
    #[must_use]
    pub fn identity_of(&self, id: ConnectionId) -> Option<Identity> {
        self.inner.reverse.get(&id).map(|r| r.value().clone())
    }

    /// When connection `id` registered.
    #[must_use]
    pub fn registered_at(&self, id: ConnectionId) -> Option<DateTime<Utc>> {
        let identity = self.identity_of(id)?;
        self.inner.forward.get(&identity).and_then(|slot| {
            slot.iter()
                .find(|e| e.handle.id() == id)
                .map(|e| e.registered_at)
        })
    }

    /// Whether `identity` has a local session.
    #[must_use]
    pub fn is_online(&self, identity: &Identity) -> bool {
        self.inner.forward.contains_key(identity)
    }

    /// Identities with at least one local session.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.inner.forward.len()
    }

    /// Registered local connections across all identities.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.reverse.len()
    }

    /// Queue `envelope` on every open connection of `identity`.
    pub fn deliver(&self, identity: &Identity, envelope: &Envelope) -> DeliveryOutcome {
        let mut delivered = 0;
        for handle in self.lookup_all(identity) {
            match handle.send(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => debug!(
                    identity = %identity,
                    conn_id = %handle.id(),
                    error = %err,
                    "delivery skipped"
                ),
            }
        }
        if delivered == 0 {
            DeliveryOutcome::NotOnlineLocally
        } else {
            DeliveryOutcome::Delivered(delivered)
        }
    }

    /// [`SessionDirectory::deliver`] to each of `identities`.
    pub fn deliver_many<'a, I>(&self, identities: I, envelope: &Envelope) -> DeliveryReport
    where
        I: IntoIterator<Item = &'a Identity>,
    {
        let mut report = DeliveryReport::default();
        for identity in identities {
            match self.deliver(identity, envelope) {
                DeliveryOutcome::Delivered(n) => report.delivered += n,
                DeliveryOutcome::NotOnlineLocally => report.not_online.push(identity.clone()),
            }
        }
        report
    }

    /// Queue `envelope` on every registered connection. Returns the count.
    pub fn broadcast(&self, envelope: &Envelope) -> usize {
        let handles: Vec<ConnectionHandle> = self
            .inner
            .forward
            .iter()
            .flat_map(|slot| {
                slot.value()
                    .iter()
                    .map(|e| e.handle.clone())
                    .collect::<Vec<_>>()
            })
            .collect();
        handles
            .into_iter()
            .filter(|h| h.send(envelope.clone()).is_ok())
            .count()
    }

    /// Consult the ban and kick flags for a freshly verified identity.
    ///
    /// Store failures admit the connection.
    pub async fn admission_check(&self, identity: &Identity, device_id: Option<&str>) -> Admission {
        match self.store_call(self.inner.store.get(&ban_key(identity))).await {
            Ok(Some(_)) => return Admission::Banned,
            Ok(None) => {}
            Err(err) => self.record_store_failure("ban check", identity, &err),
        }
        if let Some(device_id) = device_id {
            let key = kick_key(identity, device_id);
            match self.store_call(self.inner.store.get(&key)).await {
                Ok(Some(_)) => return Admission::Kicked,
                Ok(None) => {}
                Err(err) => self.record_store_failure("kick check", identity, &err),
            }
        }
        Admission::Allowed
    }

    /// Re-publish the location record of every online identity. Returns how
    /// many writes succeeded.
    pub async fn refresh_all(&self) -> usize {
        let identities: Vec<Identity> =
            self.inner.forward.iter().map(|e| e.key().clone()).collect();
        let mut refreshed = 0;
        for identity in &identities {
            match self.apply_location(LocationOp::Publish, identity).await {
                Some(Ok(())) => refreshed += 1,
                Some(Err(err)) => self.record_store_failure("refresh", identity, &err),
                None => {}
            }
        }
        debug!(refreshed, total = identities.len(), "location records refreshed");
        refreshed
    }

    /// Run [`SessionDirectory::refresh_all`] every refresh interval until
    /// `shutdown` fires.
    pub fn spawn_refresher(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let directory = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(directory.inner.settings.refresh_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        directory.refresh_all().await;
                    }
                }
            }
        })
    }

    /// Probe the shared store.
    ///
    /// # Errors
    ///
    /// Returns the store's error, or [`StoreError::Timeout`].
    pub async fn ping(&self) -> StoreResult<()> {
        self.store_call(self.inner.store.ping()).await
    }

    /// Store calls that failed since start.
    #[must_use]
    pub fn store_failures(&self) -> u64 {
        self.inner.store_failures.load(Ordering::Relaxed)
    }

    async fn store_call<T>(&self, call: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        let limit = self.inner.settings.store_timeout;
        tokio::time::timeout(limit, call)
            .await
            .unwrap_or_else(|_| Err(StoreError::Timeout(limit)))
    }

    async fn write_location(&self, op: LocationOp, identity: &Identity) -> StoreResult<()> {
        let key = self.location_key(identity);
        let settings = &self.inner.settings;
        match op {
            LocationOp::Publish => {
                self.store_call(self.inner.store.set_with_ttl(
                    &key,
                    &settings.node_locator,
                    settings.location_ttl,
                ))
                .await
            }
            LocationOp::Withdraw => {
                let deleted = self
                    .store_call(self.inner.store.delete_if_eq(&key, &settings.node_locator))
                    .await?;
                if !deleted {
                    debug!(identity = %identity, "location record not ours, left in place");
                }
                Ok(())
            }
        }
    }

    /// Whether `op` still reflects local state for `identity`.
    fn still_wanted(&self, op: LocationOp, identity: &Identity) -> bool {
        match op {
            LocationOp::Publish => self.is_online(identity),
            LocationOp::Withdraw => !self.is_online(identity),
        }
    }

    /// Run `op` under the identity's location lock if local state still
    /// calls for it; `None` when it was skipped.
    async fn apply_location(&self, op: LocationOp, identity: &Identity) -> Option<StoreResult<()>> {
        let lock = Arc::clone(
            self.inner
                .location_locks
                .entry(identity.clone())
                .or_default()
                .value(),
        );
        let result = {
            let _guard = lock.lock().await;
            if self.still_wanted(op, identity) {
                Some(self.write_location(op, identity).await)
            } else {
                None
            }
        };
        drop(lock);
        self.inner
            .location_locks
            .remove_if(identity, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn update_location(&self, op: LocationOp, identity: &Identity) {
        match self.apply_location(op, identity).await {
            None => debug!(identity = %identity, op = op.as_str(), "location update superseded"),
            Some(Ok(())) => debug!(identity = %identity, op = op.as_str(), "location record updated"),
            Some(Err(err)) => {
                self.record_store_failure(op.as_str(), identity, &err);
                self.spawn_retry(op, identity.clone());
            }
        }
    }

    fn spawn_retry(&self, op: LocationOp, identity: Identity) {
        let attempts = self.inner.settings.retry_attempts;
        if attempts <= 1 {
            return;
        }
        let directory = self.clone();
        tokio::spawn(async move {
            let mut delay = directory.inner.settings.retry_base;
            for attempt in 2..=attempts {
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                match directory.apply_location(op, &identity).await {
                    None => {
                        debug!(identity = %identity, op = op.as_str(), "retry no longer needed");
                        return;
                    }
                    Some(Ok(())) => {
                        info!(identity = %identity, op = op.as_str(), attempt, "location record recovered");
                        return;
                    }
                    Some(Err(err)) => directory.record_store_failure(op.as_str(), &identity, &err),
                }
            }
            warn!(
                identity = %identity,
                op = op.as_str(),
                attempts,
                "giving up on location record; TTL will reconcile"
            );
        });
    }

    fn record_store_failure(&self, op: &str, identity: &Identity, err: &StoreError) {
        self.inner.store_failures.fetch_add(1, Ordering::Relaxed);
        warn!(
            kind = "DirectoryUnavailable",
            op,
            identity = %identity,
            error = %err,
            "directory store call failed"
        );
    }
}
