//! Cluster coordination: registration, discovery, ownership and snapshots.

/// Declarative configuration for coordination and lease timing.
pub mod config;
/// Key/value, lease and watch client abstraction plus the in-process backend.
pub mod coordination;
/// Registration, keep-alive and watch loops publishing cluster views.
pub mod coordinator;
/// etcd-backed coordination client.
#[cfg(feature = "etcd")]
pub mod etcd;
/// Error types surfaced by cluster subsystems.
pub mod error;
/// Immutable cluster views and their reader handle.
pub mod membership;
/// Ordinal and project ownership functions.
pub mod placement;

pub use config::{ClusterConfig, CoordinationConfig};
pub use coordination::{
    CoordinationClient, DynCoordination, KeyValue, LeaseId, MemoryCoordination, WatchEvent, WatchMode,
    WatchStream, build_coordination,
};
pub use coordinator::Coordinator;
#[cfg(feature = "etcd")]
pub use etcd::EtcdCoordination;
pub use error::{ClusterError, CoordinationError};
pub use membership::{ClusterHandle, ClusterView};
pub use placement::{ordinal, owner_index};
