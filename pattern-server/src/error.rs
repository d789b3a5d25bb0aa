use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use pattern_core::tracker::QueryValidationError;
use pattern_core::{IndexError, ModelId, ProjectId};
use pattern_storage::StorageError;
use serde_json::json;
use thiserror::Error;

/// Failures of a JSON-RPC call.
///
/// Only [`RpcError::MalformedRequest`] fails the HTTP exchange; every other
/// variant travels in the `error` member of a regular response.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Body is not a JSON-RPC request.
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("unknown method '{0}'")]
    UnknownMethod(String),
    /// Params do not match the method's schema.
    #[error("invalid params for {method}: {reason}")]
    InvalidParams { method: String, reason: String },
    /// The catalog has no such project or model.
    #[error("project {project_id} has no model {model}", model = model_label(.model_id))]
    ModelNotFound {
        project_id: ProjectId,
        model_id: Option<ModelId>,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Query(#[from] QueryValidationError),
    /// A result could not be serialized.
    #[error("failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

fn model_label(model_id: &Option<ModelId>) -> String {
    model_id.map_or_else(|| "(latest)".to_string(), |id| id.to_string())
}

impl RpcError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::MalformedRequest(_) | Self::InvalidParams { .. } | Self::Query(_) => StatusCode::BAD_REQUEST,
            Self::UnknownMethod(_) | Self::ModelNotFound { .. } => StatusCode::NOT_FOUND,
            Self::Storage(err) if err.is_not_found() => StatusCode::NOT_FOUND,
            Self::Storage(_) | Self::Index(_) | Self::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let body = json!({
            "result": null,
            "error": self.to_string(),
            "id": null,
        });
        (self.status(), Json(body)).into_response()
    }
}
