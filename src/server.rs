// Server module - the HTTP Control API
//
// Lets operators add, list and remove monitored targets at runtime. Every
// successful mutation asks the publisher loop for an immediate flush
// without waiting for it.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::registry::{RegistryError, TargetRegistry};
use crate::scheduler::FlushHandle;
use crate::target::{Target, TargetError, TargetKind};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub registry: TargetRegistry,
    pub flush: FlushHandle,
    pub kind: TargetKind,
}

/// Request failures, rendered as `{"detail": "..."}`.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Target(#[from] TargetError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Target(_) => StatusCode::BAD_REQUEST,
            ApiError::Registry(RegistryError::DuplicateTarget(_)) => StatusCode::BAD_REQUEST,
            ApiError::Registry(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

#[derive(Serialize)]
struct AddResponse {
    status: &'static str,
    #[serde(flatten)]
    target: Target,
}

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

/// Create the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route(
            "/cluster/",
            post(add_target_handler).delete(remove_target_handler),
        )
        .route("/clusters/", get(list_targets_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness probe.
async fn healthz_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "ok", "targets": state.registry.len() }))
}

/// Decodes an optional JSON body; an empty body is `None`.
fn decode_body(body: &Bytes) -> Result<Option<Value>, TargetError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| TargetError::InvalidJson(e.to_string()))
}

async fn add_target_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<AddResponse>, ApiError> {
    let body = decode_body(&body)?.ok_or(TargetError::NotAnObject)?;
    let target = state.kind.parse_target(&body)?;

    state.registry.add(target.clone())?;
    info!("Added cluster: {}", target.key());
    state.flush.request();

    Ok(Json(AddResponse {
        status: "success",
        target,
    }))
}

async fn list_targets_handler(State(state): State<AppState>) -> Json<Vec<Target>> {
    Json(state.registry.list())
}

async fn remove_target_handler(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Json<MessageResponse>, ApiError> {
    let body = decode_body(&body)?;
    let key = state.kind.parse_key(body.as_ref(), &query)?;

    state.registry.remove(&key)?;
    state.flush.request();

    Ok(Json(MessageResponse {
        message: format!("Deleted cluster: {}", key),
    }))
}
