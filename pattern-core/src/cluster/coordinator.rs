//! Lease-based registration, peer discovery and snapshot publication.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::config::ClusterConfig;
use super::coordination::{DynCoordination, LeaseId, WatchEvent, WatchMode};
use super::error::{ClusterError, CoordinationError};
use super::membership::{ClusterHandle, ClusterView};
use super::placement::ordinal;
use crate::catalog::{Catalog, CatalogError, CatalogSource, INITIAL_CATALOG_VERSION};

/// Owns this node's registration and the published [`ClusterView`].
///
/// Only the coordinator mutates membership and catalog state. Readers go
/// through a [`ClusterHandle`] and always see a complete snapshot.
pub struct Coordinator {
    client: DynCoordination,
    catalogs: Arc<dyn CatalogSource>,
    config: ClusterConfig,
    local_addr: String,
    lease: LeaseId,
    generation: AtomicU64,
    view_tx: watch::Sender<Arc<ClusterView>>,
}

impl Coordinator {
    /// Register, discover peers, load the current catalog and publish the first view.
    ///
    /// Every failure here is meant to abort the process.
    pub async fn start(
        client: DynCoordination,
        catalogs: Arc<dyn CatalogSource>,
        config: ClusterConfig,
        local_addr: impl Into<String>,
    ) -> Result<Arc<Self>, ClusterError> {
        let local_addr = local_addr.into();
        let lease = register(&client, &config, &local_addr).await?;
        info!(addr = %local_addr, lease, ttl = ?config.lease_ttl, "registered pattern server");

        let peers = discover(&client, &config).await?;
        info!(peers = ?peers, "discovered pattern servers");
        if ordinal(&local_addr, &peers).is_none() {
            return Err(ClusterError::NotRegistered { addr: local_addr });
        }

        let version = current_version(&client, &config).await?;
        let catalog = match catalogs.load(&version).await {
            Ok(catalog) => catalog,
            Err(CatalogError::NotFound(missing)) => {
                warn!(version = %missing, "catalog blob missing, serving an empty catalog");
                Catalog::empty(missing)
            }
            Err(err) => return Err(err.into()),
        };

        let view = ClusterView::new(1, local_addr.clone(), peers, Arc::new(catalog));
        info!(
            ordinal = ?view.ordinal,
            catalog_version = %view.catalog_version(),
            projects = view.catalog.project_count(),
            "published initial cluster view"
        );
        let (view_tx, _) = watch::channel(Arc::new(view));

        Ok(Arc::new(Self {
            client,
            catalogs,
            config,
            local_addr,
            lease,
            generation: AtomicU64::new(1),
            view_tx,
        }))
    }

    #[must_use]
    pub fn handle(&self) -> ClusterHandle {
        ClusterHandle::new(self.view_tx.subscribe())
    }

    #[must_use]
    pub fn view(&self) -> Arc<ClusterView> {
        Arc::clone(&self.view_tx.borrow())
    }

    #[must_use]
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    #[must_use]
    pub const fn lease(&self) -> LeaseId {
        self.lease
    }

    /// Registered addresses, sorted ascending.
    pub async fn discover(&self) -> Result<Vec<String>, ClusterError> {
        discover(&self.client, &self.config).await
    }

    /// Renew the lease every third of its TTL. Failures are logged only.
    pub fn spawn_keep_alive(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(coordinator.config.keep_alive_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match coordinator.client.keep_alive(coordinator.lease).await {
                    Ok(()) => debug!(lease = coordinator.lease, "lease renewed"),
                    Err(err) => error!(lease = coordinator.lease, error = %err, "failed to renew lease"),
                }
            }
        })
    }

    /// Follow membership and catalog-version changes until aborted.
    ///
    /// Each time both watches are established the view is reconciled with
    /// live state. A closed watch suspends updates until they are
    /// re-established after `watch_retry`.
    pub fn spawn_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(err) = coordinator.watch_until_closed().await {
                    error!(error = %err, "cluster watch failed, updates suspended");
                }
                tokio::time::sleep(coordinator.config.watch_retry).await;
            }
        })
    }

    async fn watch_until_closed(&self) -> Result<(), ClusterError> {
        let membership_prefix = self.config.membership_prefix();
        let version_key = self.config.catalog_version_key();
        let mut members = self.client.watch(&membership_prefix, WatchMode::Prefix).await?;
        let mut versions = self.client.watch(&version_key, WatchMode::Key).await?;

        // Changes made before the watches went live are only visible by reading.
        if let Err(err) = self.reconcile().await {
            warn!(error = %err, "reconcile after subscribing failed");
        }

        let mut ticker = tokio::time::interval(self.config.recompute_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.recompute().await {
                        warn!(error = %err, "periodic membership recompute failed");
                    }
                }
                event = members.recv() => {
                    let Some(event) = event else {
                        return Err(CoordinationError::WatchClosed(membership_prefix).into());
                    };
                    debug!(key = %event.key(), "membership change");
                    if let Err(err) = self.refresh_membership().await {
                        warn!(error = %err, "failed to refresh membership");
                    }
                }
                event = versions.recv() => {
                    match event {
                        Some(WatchEvent::Put(kv)) => {
                            if let Err(err) = self.reload_catalog(&kv.value).await {
                                warn!(version = %kv.value, error = %err, "catalog reload failed, keeping current catalog");
                            }
                        }
                        Some(WatchEvent::Delete { key }) => {
                            warn!(key = %key, "catalog version key deleted, keeping current catalog");
                        }
                        None => return Err(CoordinationError::WatchClosed(version_key).into()),
                    }
                }
            }
        }
    }

    /// Rediscover peers and publish when they changed. Returns whether a new view went out.
    ///
    /// When the local node is missing from membership the current view is kept.
    pub async fn refresh_membership(&self) -> Result<bool, ClusterError> {
        let peers = self.discover().await?;
        let Some(position) = ordinal(&self.local_addr, &peers) else {
            warn!(addr = %self.local_addr, peers = ?peers, "local node absent from membership, keeping current view");
            return Ok(false);
        };
        let current = self.view();
        if current.same_membership(&peers, Some(position)) {
            return Ok(false);
        }
        info!(ordinal = position, peers = ?peers, "membership changed");
        self.publish(peers, Arc::clone(&current.catalog));
        Ok(true)
    }

    /// Drift check run on a timer: republish only when ordinal or peers differ.
    pub async fn recompute(&self) -> Result<bool, ClusterError> {
        let before = self.view();
        let changed = self.refresh_membership().await?;
        if changed {
            error!(
                old_ordinal = ?before.ordinal,
                new_ordinal = ?self.view().ordinal,
                "cluster view drifted from live membership, recomputed"
            );
        }
        Ok(changed)
    }

    /// Load the catalog for `version` and publish it with the current membership.
    ///
    /// The old catalog stays authoritative until the load has fully succeeded.
    pub async fn reload_catalog(&self, version: &str) -> Result<(), ClusterError> {
        if self.view().catalog_version() == version {
            return Ok(());
        }
        let catalog = self.catalogs.load(version).await?;
        let current = self.view();
        info!(
            old_version = %current.catalog_version(),
            new_version = %version,
            projects = catalog.project_count(),
            "catalog reloaded"
        );
        self.publish(current.peers.clone(), Arc::new(catalog));
        Ok(())
    }

    async fn reconcile(&self) -> Result<(), ClusterError> {
        self.refresh_membership().await?;
        let version = current_version(&self.client, &self.config).await?;
        self.reload_catalog(&version).await
    }

    /// Revoke the lease so peers see this node leave immediately.
    pub async fn shutdown(&self) -> Result<(), ClusterError> {
        self.client.revoke_lease(self.lease).await?;
        info!(addr = %self.local_addr, "deregistered pattern server");
        Ok(())
    }

    fn publish(&self, peers: Vec<String>, catalog: Arc<Catalog>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let view = ClusterView::new(generation, self.local_addr.clone(), peers, catalog);
        self.view_tx.send_replace(Arc::new(view));
    }
}

async fn register(client: &DynCoordination, config: &ClusterConfig, addr: &str) -> Result<LeaseId, ClusterError> {
    let key = config.membership_key(addr);
    if client.get(&key).await?.is_some() {
        return Err(ClusterError::RegistrationConflict { addr: addr.to_string() });
    }
    let lease = client.grant_lease(config.lease_ttl).await?;
    if !client.create(&key, addr, Some(lease)).await? {
        if let Err(err) = client.revoke_lease(lease).await {
            warn!(lease, error = %err, "failed to revoke unused lease");
        }
        return Err(ClusterError::RegistrationConflict { addr: addr.to_string() });
    }
    Ok(lease)
}

async fn discover(client: &DynCoordination, config: &ClusterConfig) -> Result<Vec<String>, ClusterError> {
    let mut peers: Vec<String> = client
        .get_prefix(&config.membership_prefix())
        .await?
        .into_iter()
        .map(|kv| kv.value)
        .collect();
    peers.sort_unstable();
    peers.dedup();
    Ok(peers)
}

async fn current_version(client: &DynCoordination, config: &ClusterConfig) -> Result<String, ClusterError> {
    let key = config.catalog_version_key();
    if let Some(version) = client.get(&key).await? {
        return Ok(version);
    }
    warn!(key = %key, version = INITIAL_CATALOG_VERSION, "catalog version missing, initialising");
    if !client.create(&key, INITIAL_CATALOG_VERSION, None).await?
        && let Some(version) = client.get(&key).await?
    {
        return Ok(version);
    }
    Ok(INITIAL_CATALOG_VERSION.to_string())
}
