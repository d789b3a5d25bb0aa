//! `POST /rpc`: JSON-RPC 1.0 style dispatch onto [`PatternService`].

use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Json, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::AppState;
use crate::error::RpcError;
use crate::service::PatternService;

/// Request id header, generated when the caller sends none.
pub const REQUEST_ID_HEADER: &str = "x-req-id";

const METHOD_PREFIX: &str = "ps.";

#[derive(Debug, Deserialize)]
struct RpcRequest {
    method: String,
    #[serde(default)]
    params: Vec<Value>,
    #[serde(default)]
    id: Value,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    result: Value,
    error: Option<String>,
    id: Value,
}

pub async fn handle_rpc(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let started = Instant::now();
    let req_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);

    let request: RpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            warn!(req_id = %req_id, error = %err, "rejecting malformed rpc body");
            return with_request_id(RpcError::MalformedRequest(err.to_string()).into_response(), &req_id);
        }
    };

    info!(req_id = %req_id, method = %request.method, "rpc call");
    let (result, error) = match dispatch(&state.service, &request.method, request.params).await {
        Ok(result) => (result, None),
        Err(err) => {
            warn!(req_id = %req_id, method = %request.method, error = %err, "rpc call failed");
            (Value::Null, Some(err.to_string()))
        }
    };
    info!(
        req_id = %req_id,
        method = %request.method,
        latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        failed = error.is_some(),
        "rpc done"
    );

    let response = Json(RpcResponse {
        result,
        error,
        id: request.id,
    });
    with_request_id(response.into_response(), &req_id)
}

fn with_request_id(mut response: Response, req_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(req_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn dispatch(service: &PatternService, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
    let name = method
        .strip_prefix(METHOD_PREFIX)
        .ok_or_else(|| RpcError::UnknownMethod(method.to_string()))?;
    match name {
        "GetPerUserCount" => encode(service.per_user_count(first_param(method, params)?).await?),
        "GetFrequentPaths" => encode(service.frequent_paths(first_param(method, params)?).await?),
        "Factor" => encode(service.factor(first_param(method, params)?).await?),
        "GetAllPatterns" => encode(service.all_patterns(first_param(method, params)?).await?),
        "GetAllContainingPatterns" => encode(service.containing_patterns(first_param(method, params)?).await?),
        "GetPatterns" => encode(service.patterns(first_param(method, params)?).await?),
        "GetUserAndEventsInfo" => encode(service.user_and_events_info(first_param(method, params)?).await?),
        "GetCountOfPattern" => encode(service.count_of_pattern(first_param(method, params)?).await?),
        "GetTotalEventCount" => encode(service.total_event_count(first_param(method, params)?).await?),
        "TrackQueries" => encode(service.track_queries(&first_param(method, params)?)?),
        _ => Err(RpcError::UnknownMethod(method.to_string())),
    }
}

/// Calls carry their arguments as a single object in `params[0]`.
fn first_param<T: DeserializeOwned>(method: &str, params: Vec<Value>) -> Result<T, RpcError> {
    let invalid = |reason: String| RpcError::InvalidParams {
        method: method.to_string(),
        reason,
    };
    let first = params
        .into_iter()
        .next()
        .ok_or_else(|| invalid("expected one params object".to_string()))?;
    serde_json::from_value(first).map_err(|err| invalid(err.to_string()))
}

fn encode<T: Serialize>(result: T) -> Result<Value, RpcError> {
    Ok(serde_json::to_value(result)?)
}
