use thiserror::Error;

use crate::catalog::CatalogError;

/// Failures reported by a coordination backend.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The lease is unknown or already expired.
    #[error("lease {0} not found or expired")]
    LeaseNotFound(i64),
    /// A watch stream closed and must be re-established.
    #[error("watch on '{0}' closed")]
    WatchClosed(String),
    /// The backend cannot be reached or rejected the call.
    #[error("coordination backend error: {0}")]
    Backend(String),
    /// Requested backend is not compiled in.
    #[error("coordination backend unavailable: {0}")]
    BackendUnavailable(&'static str),
}

#[cfg(feature = "etcd")]
impl From<etcd_client::Error> for CoordinationError {
    fn from(err: etcd_client::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Errors surfaced while joining or tracking the cluster.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Another live process already holds this address.
    #[error("pattern server already registered at {addr}; retry after the lease expires")]
    RegistrationConflict {
        /// Address that is still registered.
        addr: String,
    },
    /// The local address is missing from discovered membership.
    #[error("pattern server {addr} is not among the registered peers")]
    NotRegistered {
        /// Local address searched for.
        addr: String,
    },
    /// Lease, key-value or watch call failed.
    #[error(transparent)]
    Coordination(#[from] CoordinationError),
    /// Catalog blob for the published version could not be loaded.
    #[error("failed to load catalog: {0}")]
    Catalog(#[from] CatalogError),
}
