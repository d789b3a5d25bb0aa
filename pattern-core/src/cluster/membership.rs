//! Immutable cluster snapshots and the handle readers use to observe them.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use super::placement::{ordinal, owner_index};
use crate::catalog::Catalog;
use crate::types::ProjectId;

/// Membership and catalog state installed as one unit.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterView {
    /// Incremented on every publish.
    pub generation: u64,
    pub local_addr: String,
    /// Position of the local node among `peers`.
    pub ordinal: Option<usize>,
    /// Registered addresses, sorted ascending.
    pub peers: Vec<String>,
    #[serde(skip)]
    pub catalog: Arc<Catalog>,
}

impl ClusterView {
    /// Snapshot derived from a peer list; sorts and deduplicates it.
    #[must_use]
    pub fn new(generation: u64, local_addr: impl Into<String>, mut peers: Vec<String>, catalog: Arc<Catalog>) -> Self {
        peers.sort_unstable();
        peers.dedup();
        let local_addr = local_addr.into();
        let ordinal = ordinal(&local_addr, &peers);
        Self {
            generation,
            local_addr,
            ordinal,
            peers,
            catalog,
        }
    }

    /// Standalone view where the local node owns everything.
    #[must_use]
    pub fn single_node(local_addr: impl Into<String>, catalog: Arc<Catalog>) -> Self {
        let local_addr = local_addr.into();
        Self::new(0, local_addr.clone(), vec![local_addr], catalog)
    }

    #[must_use]
    pub fn catalog_version(&self) -> &str {
        self.catalog.version()
    }

    /// Address of the server owning `project`.
    #[must_use]
    pub fn owner_of(&self, project: ProjectId) -> Option<&str> {
        owner_index(project, self.peers.len()).and_then(|idx| self.peers.get(idx).map(String::as_str))
    }

    /// Whether requests for `project` are served by this node.
    #[must_use]
    pub fn owns(&self, project: ProjectId) -> bool {
        self.owner_of(project) == Some(self.local_addr.as_str())
    }

    pub(crate) fn same_membership(&self, peers: &[String], ordinal: Option<usize>) -> bool {
        self.ordinal == ordinal && self.peers == peers
    }
}

/// Cheap, cloneable reader of the currently published [`ClusterView`].
#[derive(Clone)]
pub struct ClusterHandle {
    rx: watch::Receiver<Arc<ClusterView>>,
}

impl ClusterHandle {
    pub(crate) const fn new(rx: watch::Receiver<Arc<ClusterView>>) -> Self {
        Self { rx }
    }

    /// Handle over a fixed view that never changes.
    #[must_use]
    pub fn fixed(view: ClusterView) -> Self {
        let (_tx, rx) = watch::channel(Arc::new(view));
        Self { rx }
    }

    /// The latest snapshot. Never blocks on the publisher.
    #[must_use]
    pub fn view(&self) -> Arc<ClusterView> {
        Arc::clone(&self.rx.borrow())
    }

    /// Wait until a snapshot newer than the last one seen is published.
    pub async fn changed(&mut self) -> Option<Arc<ClusterView>> {
        self.rx.changed().await.ok()?;
        Some(Arc::clone(&self.rx.borrow_and_update()))
    }
}
