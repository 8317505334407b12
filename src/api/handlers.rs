//! Route handlers. Each one is a thin adapter over a manager operation.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

use super::{ApiError, ApiResponse};
use crate::error::FleetError;
use crate::manager::{SandboxManager, StartRequest, StopStatus};

type AppState = State<Arc<SandboxManager>>;

/// Body of `POST /sandboxes/{name}/revert`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevertRequest {
    pub snapshot_id: String,
}

#[derive(Debug, Serialize)]
struct StatusBody<S: Serialize> {
    status: S,
}

fn bad_body(rejection: JsonRejection) -> ApiError {
    ApiError(FleetError::InvalidRequest {
        reason: rejection.body_text(),
    })
}

/// POST /sandboxes
pub async fn start_sandbox(
    State(manager): AppState,
    body: Result<Json<StartRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = body.map_err(bad_body)?;
    let info = manager.start(request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(info))))
}

/// GET /sandboxes
pub async fn list_sandboxes(State(manager): AppState) -> impl IntoResponse {
    Json(ApiResponse::ok(manager.list().await))
}

/// GET /sandboxes/{name}
pub async fn get_sandbox(
    State(manager): AppState,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let info = manager.connection_info(&name).await?;
    Ok(Json(ApiResponse::ok(info)))
}

/// DELETE /sandboxes/{name}
pub async fn stop_sandbox(
    State(manager): AppState,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let status: StopStatus = manager.stop(&name).await?;
    Ok(Json(ApiResponse::ok(StatusBody { status })))
}

/// POST /sandboxes/{name}/revert
pub async fn revert_sandbox(
    State(manager): AppState,
    Path(name): Path<String>,
    body: Result<Json<RevertRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = body.map_err(bad_body)?;
    manager
        .revert_to_snapshot(&name, &request.snapshot_id)
        .await?;
    Ok(Json(ApiResponse::ok(StatusBody { status: "reverted" })))
}

/// GET /ports
pub async fn list_ports(State(manager): AppState) -> impl IntoResponse {
    Json(ApiResponse::ok(manager.reserved_ports().await))
}

/// GET /usage
pub async fn usage(State(manager): AppState) -> impl IntoResponse {
    Json(ApiResponse::ok(manager.usage().await))
}

/// POST /admin/factory-reset
pub async fn factory_reset(State(manager): AppState) -> Result<impl IntoResponse, ApiError> {
    let report = manager.factory_reset().await?;
    Ok(Json(ApiResponse::ok(report)))
}

/// GET /health
pub async fn health() -> &'static str {
    "ok"
}
