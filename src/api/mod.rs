//! HTTP+JSON service boundary.
//!
//! Routes map one-to-one onto [`SandboxManager`] operations. Every response
//! uses the [`ApiResponse`] envelope; failures carry a machine-readable
//! [`ErrorKind`] plus a human-readable detail.

mod handlers;
mod server;

use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::error::{ErrorKind, FleetError};
use crate::manager::SandboxManager;

pub use server::{ApiServer, ApiServerConfig};

/// Error body inside the envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ApiErrorBody {
    pub kind: ErrorKind,
    pub detail: String,
}

/// Response envelope for API responses.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiErrorBody {
                kind,
                detail: detail.into(),
            }),
        }
    }
}

/// A [`FleetError`] on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub FleetError);

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        if matches!(self.0, FleetError::NameCollision { .. }) {
            return StatusCode::CONFLICT;
        }
        status_for(self.0.kind())
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
        ErrorKind::CapacityExhausted => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::PortExhaustion => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::NotReady => StatusCode::CONFLICT,
        ErrorKind::ReadinessTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::TransientInfraError => StatusCode::BAD_GATEWAY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.0.kind();
        if status.is_server_error() {
            tracing::warn!(kind = %kind, error = %self.0, "Request failed");
        }
        (
            status,
            Json(ApiResponse::<()>::err(kind, self.0.to_string())),
        )
            .into_response()
    }
}

/// Build the router over a shared manager.
pub fn router(manager: Arc<SandboxManager>) -> Router {
    Router::new()
        .route(
            "/sandboxes",
            post(handlers::start_sandbox).get(handlers::list_sandboxes),
        )
        .route(
            "/sandboxes/{name}",
            get(handlers::get_sandbox).delete(handlers::stop_sandbox),
        )
        .route("/sandboxes/{name}/revert", post(handlers::revert_sandbox))
        .route("/ports", get(handlers::list_ports))
        .route("/usage", get(handlers::usage))
        .route("/admin/factory-reset", post(handlers::factory_reset))
        .route("/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}
