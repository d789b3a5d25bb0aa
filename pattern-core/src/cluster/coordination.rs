//! Key/value, lease and watch primitives of the coordination service.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::config::CoordinationConfig;
use super::error::CoordinationError;

/// Lease handle issued by the coordination service.
pub type LeaseId = i64;

/// A stored key and its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Change notification delivered to a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put(KeyValue),
    Delete { key: String },
}

impl WatchEvent {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put(kv) => &kv.key,
            Self::Delete { key } => key,
        }
    }
}

/// Whether a watch covers one key or every key under a prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    Key,
    Prefix,
}

impl WatchMode {
    fn matches(self, watched: &str, key: &str) -> bool {
        match self {
            Self::Key => watched == key,
            Self::Prefix => key.starts_with(watched),
        }
    }
}

/// Change feed of a watch; the channel closing means the watch failed.
pub type WatchStream = mpsc::UnboundedReceiver<WatchEvent>;

/// Async interface implemented by coordination backends.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Grant a lease that expires after `ttl` unless renewed.
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, CoordinationError>;

    /// Renew a lease once.
    async fn keep_alive(&self, lease: LeaseId) -> Result<(), CoordinationError>;

    /// Revoke a lease, deleting every key bound to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), CoordinationError>;

    /// Store `value` only if `key` is absent. Returns `false` when it already exists.
    async fn create(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<bool, CoordinationError>;

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), CoordinationError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CoordinationError>;

    /// All pairs under `prefix`, ordered by key.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, CoordinationError>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, CoordinationError>;

    /// Subscribe to changes of a key or prefix.
    async fn watch(&self, key: &str, mode: WatchMode) -> Result<WatchStream, CoordinationError>;
}

/// Convenience trait-object alias for dynamic dispatch.
pub type DynCoordination = Arc<dyn CoordinationClient>;

/// How often the in-process backend sweeps expired leases.
const MEMORY_REAPER_INTERVAL: Duration = Duration::from_secs(1);

/// Construct a coordination backend from configuration.
pub async fn build_coordination(config: &CoordinationConfig) -> Result<DynCoordination, CoordinationError> {
    match config {
        CoordinationConfig::Memory => {
            let store = Arc::new(MemoryCoordination::new());
            // Exits on its own once the last strong reference is dropped.
            drop(store.spawn_reaper(MEMORY_REAPER_INTERVAL));
            Ok(store)
        }
        CoordinationConfig::Etcd {
            endpoints,
            connect_timeout,
        } => {
            #[cfg(feature = "etcd")]
            {
                let client = super::etcd::EtcdCoordination::connect(endpoints, *connect_timeout).await?;
                Ok(Arc::new(client))
            }
            #[cfg(not(feature = "etcd"))]
            {
                let _ = endpoints;
                let _ = connect_timeout;
                Err(CoordinationError::BackendUnavailable("built without etcd feature"))
            }
        }
    }
}

struct Entry {
    value: String,
    lease: Option<LeaseId>,
}

struct Lease {
    ttl: Duration,
    deadline: Instant,
}

struct Watcher {
    key: String,
    mode: WatchMode,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct State {
    next_lease: LeaseId,
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    watchers: Vec<Watcher>,
}

impl State {
    fn notify(&mut self, event: &WatchEvent) {
        self.watchers.retain(|watcher| !watcher.tx.is_closed());
        for watcher in &self.watchers {
            if watcher.mode.matches(&watcher.key, event.key()) {
                let _ = watcher.tx.send(event.clone());
            }
        }
    }

    fn remove_key(&mut self, key: &str) -> bool {
        if self.entries.remove(key).is_some() {
            self.notify(&WatchEvent::Delete { key: key.to_string() });
            true
        } else {
            false
        }
    }

    fn drop_lease(&mut self, lease: LeaseId) {
        self.leases.remove(&lease);
        let bound: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.lease == Some(lease))
            .map(|(key, _)| key.clone())
            .collect();
        for key in bound {
            self.remove_key(&key);
        }
    }

    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease in expired {
            debug!(lease, "lease expired");
            self.drop_lease(lease);
        }
    }

    fn check_lease(&self, lease: Option<LeaseId>) -> Result<(), CoordinationError> {
        match lease {
            Some(id) if !self.leases.contains_key(&id) => Err(CoordinationError::LeaseNotFound(id)),
            _ => Ok(()),
        }
    }

    fn store(&mut self, key: &str, value: &str, lease: Option<LeaseId>) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease,
            },
        );
        self.notify(&WatchEvent::Put(KeyValue {
            key: key.to_string(),
            value: value.to_string(),
        }));
    }
}

/// In-process coordination store with TTL leases on the tokio clock.
///
/// Expired leases are collected on every call and by the optional reaper task,
/// so watchers observe deletions even without traffic.
#[derive(Default)]
pub struct MemoryCoordination {
    state: Mutex<State>,
}

impl MemoryCoordination {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Periodically expire leases until the store is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.state.lock().purge_expired(Instant::now());
            }
        })
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock();
        state.purge_expired(Instant::now());
        f(&mut state)
    }
}

#[async_trait]
impl CoordinationClient for MemoryCoordination {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, CoordinationError> {
        Ok(self.with_state(|state| {
            state.next_lease += 1;
            let id = state.next_lease;
            state.leases.insert(
                id,
                Lease {
                    ttl,
                    deadline: Instant::now() + ttl,
                },
            );
            id
        }))
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<(), CoordinationError> {
        self.with_state(|state| match state.leases.get_mut(&lease) {
            Some(entry) => {
                entry.deadline = Instant::now() + entry.ttl;
                Ok(())
            }
            None => Err(CoordinationError::LeaseNotFound(lease)),
        })
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), CoordinationError> {
        self.with_state(|state| {
            if !state.leases.contains_key(&lease) {
                return Err(CoordinationError::LeaseNotFound(lease));
            }
            state.drop_lease(lease);
            Ok(())
        })
    }

    async fn create(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<bool, CoordinationError> {
        self.with_state(|state| {
            state.check_lease(lease)?;
            if state.entries.contains_key(key) {
                return Ok(false);
            }
            state.store(key, value, lease);
            Ok(true)
        })
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), CoordinationError> {
        self.with_state(|state| {
            state.check_lease(lease)?;
            state.store(key, value, lease);
            Ok(())
        })
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CoordinationError> {
        Ok(self.with_state(|state| state.entries.get(key).map(|entry| entry.value.clone())))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, CoordinationError> {
        Ok(self.with_state(|state| {
            state
                .entries
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(key, entry)| KeyValue {
                    key: key.clone(),
                    value: entry.value.clone(),
                })
                .collect()
        }))
    }

    async fn delete(&self, key: &str) -> Result<bool, CoordinationError> {
        Ok(self.with_state(|state| state.remove_key(key)))
    }

    async fn watch(&self, key: &str, mode: WatchMode) -> Result<WatchStream, CoordinationError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.with_state(|state| {
            state.watchers.push(Watcher {
                key: key.to_string(),
                mode,
                tx,
            });
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[tokio::test]
    async fn create_rejects_existing_key() {
        let store = MemoryCoordination::new();
        assert!(store.create("/k", "a", None).await.unwrap());
        assert!(!store.create("/k", "b", None).await.unwrap());
        assert_eq!(store.get("/k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn prefix_listing_is_sorted_and_scoped() {
        let store = MemoryCoordination::new();
        store.put("/svc/b", "b", None).await.unwrap();
        store.put("/svc/a", "a", None).await.unwrap();
        store.put("/svd/c", "c", None).await.unwrap();

        let keys: Vec<_> = store
            .get_prefix("/svc/")
            .await
            .unwrap()
            .into_iter()
            .map(|kv| kv.key)
            .collect();
        assert_eq!(keys, vec!["/svc/a", "/svc/b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_vanish_when_lease_is_not_renewed() {
        let store = MemoryCoordination::new();
        let lease = store.grant_lease(Duration::from_secs(10)).await.unwrap();
        store.put("/svc/a", "a", Some(lease)).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        store.keep_alive(lease).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get_prefix("/svc/").await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(store.get_prefix("/svc/").await.unwrap().is_empty());
        assert!(matches!(
            store.keep_alive(lease).await,
            Err(CoordinationError::LeaseNotFound(id)) if id == lease
        ));
    }

    #[tokio::test]
    async fn watchers_see_puts_and_revocations() {
        let store = MemoryCoordination::new();
        let mut members = store.watch("/svc/", WatchMode::Prefix).await.unwrap();
        let mut version = store.watch("/version", WatchMode::Key).await.unwrap();

        let lease = store.grant_lease(Duration::from_secs(10)).await.unwrap();
        store.put("/svc/a", "a", Some(lease)).await.unwrap();
        store.put("/version", "v2", None).await.unwrap();
        store.revoke_lease(lease).await.unwrap();

        assert!(matches!(members.recv().await, Some(WatchEvent::Put(kv)) if kv.key == "/svc/a"));
        assert!(matches!(members.recv().await, Some(WatchEvent::Delete { key }) if key == "/svc/a"));
        assert!(matches!(version.recv().await, Some(WatchEvent::Put(kv)) if kv.value == "v2"));
        assert!(members.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_expires_without_traffic() {
        let store = Arc::new(MemoryCoordination::new());
        let mut members = store.watch("/svc/", WatchMode::Prefix).await.unwrap();
        let lease = store.grant_lease(Duration::from_secs(1)).await.unwrap();
        store.put("/svc/a", "a", Some(lease)).await.unwrap();
        let reaper = store.spawn_reaper(Duration::from_millis(200));

        assert!(matches!(members.recv().await, Some(WatchEvent::Put(_))));
        assert!(matches!(members.recv().await, Some(WatchEvent::Delete { .. })));
        reaper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn built_memory_backend_expires_leases_on_its_own() {
        let store = build_coordination(&CoordinationConfig::Memory).await.unwrap();
        let mut members = store.watch("/svc/", WatchMode::Prefix).await.unwrap();
        let lease = store.grant_lease(Duration::from_secs(3)).await.unwrap();
        store.put("/svc/a", "a", Some(lease)).await.unwrap();

        assert!(matches!(members.recv().await, Some(WatchEvent::Put(_))));
        let deleted = tokio::time::timeout(Duration::from_secs(10), members.recv())
            .await
            .unwrap();
        assert!(matches!(deleted, Some(WatchEvent::Delete { key }) if key == "/svc/a"));
    }

    #[tokio::test]
    async fn put_with_unknown_lease_fails() {
        let store = MemoryCoordination::new();
        assert!(matches!(
            store.put("/k", "v", Some(42)).await,
            Err(CoordinationError::LeaseNotFound(42))
        ));
    }
}
