//! Core engine of the pattern server.
//!
//! Holds the mined-pattern data model, the bounded caches used by the storage
//! tiers, the project/model catalog, lease-based cluster coordination, the
//! pattern index with its funnel/lift engine and the streaming query tracker.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::unimplemented,
    clippy::todo
)]
#![deny(clippy::unwrap_in_result, clippy::panic_in_result_fn)]

pub mod cache;
pub mod catalog;
pub mod cluster;
pub mod index;
pub mod pattern;
pub mod tracker;
pub mod types;

pub use cache::{BoundedCache, CacheStats};
pub use catalog::{Catalog, CatalogError, CatalogRecord, CatalogSource, ModelChunkMapping, ModelData};
pub use cluster::{ClusterConfig, ClusterError, ClusterHandle, ClusterView, Coordinator};
pub use index::{FactorReport, IndexConfig, IndexError, PathCount, PatternIndex};
pub use pattern::{EventInfo, Pattern, PatternRecord, PropertiesInfo, TransitionSample, UserAndEventsInfo};
pub use tracker::{EventRecord, QueryDefinition, QueryTracker, ScanReport, TrackerSet};
pub use types::{CardinalityBounds, ModelId, ProjectId};
