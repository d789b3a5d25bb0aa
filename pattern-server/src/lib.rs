//! Pattern server: configuration, the JSON-RPC façade and status endpoints.

#![warn(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::unimplemented,
    clippy::todo
)]
#![deny(clippy::unwrap_in_result, clippy::panic_in_result_fn)]

pub mod config;
pub mod error;
pub mod rpc;
pub mod service;
pub mod status;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use pattern_storage::{CloudBlobStore, DiskBlobStore, DynBlobStore, StorageResult};

pub use config::{Environment, ServerConfig, StartupConfigError};
pub use error::RpcError;
pub use service::PatternService;

/// Shared state behind both ports.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PatternService>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(service: Arc<PatternService>) -> Self {
        Self {
            service,
            started_at: Utc::now(),
        }
    }
}

/// Routes served on the RPC port.
pub fn rpc_router(state: AppState) -> Router {
    Router::new().route("/rpc", post(rpc::handle_rpc)).with_state(state)
}

/// Routes served on the status port.
pub fn status_router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status::status))
        .route("/state", get(status::state))
        .with_state(state)
}

/// Disk and cloud tiers for `config`.
///
/// In development the bucket is a local directory read through the disk
/// backend; elsewhere it is an object store reached over HTTP.
pub fn build_blob_stores(config: &ServerConfig, env: Environment) -> StorageResult<(DynBlobStore, DynBlobStore)> {
    let disk: DynBlobStore = Arc::new(DiskBlobStore::new(&config.disk_dir));
    let cloud: DynBlobStore = if env.is_development() {
        Arc::new(DiskBlobStore::named(&config.storage.bucket, "cloud"))
    } else {
        Arc::new(CloudBlobStore::new(
            &config.storage.cloud_endpoint,
            &config.storage.bucket,
            config.storage.cloud_token.clone(),
            config.storage.request_timeout,
        )?)
    };
    Ok((disk, cloud))
}
