//! Status port: liveness and a dump of what this node currently serves.

use axum::extract::State;
use axum::response::{IntoResponse, Json};
use serde_json::json;

use crate::AppState;

/// GET /status
pub async fn status() -> impl IntoResponse {
    Json(json!({ "status": "success" }))
}

/// GET /state
pub async fn state(State(state): State<AppState>) -> impl IntoResponse {
    let view = state.service.view();
    Json(json!({
        "generation": view.generation,
        "localAddr": view.local_addr,
        "ordinal": view.ordinal,
        "peers": view.peers,
        "catalogVersion": view.catalog_version(),
        "projects": view.catalog.project_count(),
        "caches": state.service.store_cache_stats(),
        "indexCache": state.service.index_cache_stats(),
        "startedAt": state.started_at.to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
