//! HTTP API handlers using axum.
//!
//! Every route maps onto exactly one [`SupervisorService`] operation. Errors
//! are answered with an [`ErrorResponse`] whose `error` field is the tagged
//! [`SupervisorError`], so a client sees the same kind and context the
//! supervisor produced.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use procmaster_common::SupervisorError;
use procmaster_supervisor::{MonitStatus, ProcessInfo, ResurrectSummary, SupervisorService};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::types::{ErrorResponse, OperationResponse, SaveResponse, StartGoBinRequest};

/// Optional request header carrying the caller's deadline in milliseconds.
pub const DEADLINE_HEADER: &str = "x-procmaster-deadline-ms";

/// Creates the API router.
pub fn create_router(service: SupervisorService) -> Router {
    Router::new()
        .route("/api/v1/save", post(save_handler))
        .route("/api/v1/resurrect", post(resurrect_handler))
        .route("/api/v1/processes", post(start_go_bin_handler))
        .route(
            "/api/v1/processes/{name}",
            get(process_info_handler).delete(delete_handler),
        )
        .route("/api/v1/processes/{name}/start", post(start_handler))
        .route("/api/v1/processes/{name}/restart", post(restart_handler))
        .route("/api/v1/processes/{name}/stop", post(stop_handler))
        .route("/api/v1/status", get(status_handler))
        .route("/api/v1/health", get(health_handler))
        .with_state(service)
}

/// The service bounded by the request's deadline header, if any.
fn scoped(service: &SupervisorService, headers: &HeaderMap) -> Result<SupervisorService, ApiError> {
    let Some(value) = headers.get(DEADLINE_HEADER) else {
        return Ok(service.clone());
    };

    let millis = value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .ok_or_else(|| {
            ApiError(SupervisorError::invalid_request(format!(
                "{} must be a positive integer number of milliseconds",
                DEADLINE_HEADER
            )))
        })?;

    debug!("Request deadline: {}ms", millis);
    Ok(service.with_deadline(Duration::from_millis(millis)))
}

async fn save_handler(
    State(service): State<SupervisorService>,
) -> Result<Json<SaveResponse>, ApiError> {
    let saved = service.save().await?;
    Ok(Json(SaveResponse { saved }))
}

async fn resurrect_handler(
    State(service): State<SupervisorService>,
    headers: HeaderMap,
) -> Result<Json<ResurrectSummary>, ApiError> {
    let summary = scoped(&service, &headers)?.resurrect().await?;
    Ok(Json(summary))
}

async fn start_go_bin_handler(
    State(service): State<SupervisorService>,
    headers: HeaderMap,
    Json(req): Json<StartGoBinRequest>,
) -> Result<Json<OperationResponse>, ApiError> {
    let name = req.name.clone();
    scoped(&service, &headers)?
        .start_go_bin(req.source_path, req.name, req.keep_alive, req.args)
        .await?;
    Ok(Json(OperationResponse::ok(format!("Started {}", name))))
}

async fn start_handler(
    State(service): State<SupervisorService>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<OperationResponse>, ApiError> {
    scoped(&service, &headers)?.start_process(&name).await?;
    Ok(Json(OperationResponse::ok(format!("Started {}", name))))
}

async fn restart_handler(
    State(service): State<SupervisorService>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<OperationResponse>, ApiError> {
    scoped(&service, &headers)?.restart_process(&name).await?;
    Ok(Json(OperationResponse::ok(format!("Restarted {}", name))))
}

async fn stop_handler(
    State(service): State<SupervisorService>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<OperationResponse>, ApiError> {
    scoped(&service, &headers)?.stop_process(&name).await?;
    Ok(Json(OperationResponse::ok(format!("Stopped {}", name))))
}

async fn delete_handler(
    State(service): State<SupervisorService>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<OperationResponse>, ApiError> {
    scoped(&service, &headers)?.delete_process(&name).await?;
    Ok(Json(OperationResponse::ok(format!("Deleted {}", name))))
}

async fn process_info_handler(
    State(service): State<SupervisorService>,
    Path(name): Path<String>,
) -> Result<Json<ProcessInfo>, ApiError> {
    Ok(Json(service.process_info(&name).await?))
}

async fn status_handler(
    State(service): State<SupervisorService>,
) -> Result<Json<MonitStatus>, ApiError> {
    Ok(Json(service.monit_status().await?))
}

async fn health_handler() -> &'static str {
    "OK"
}

/// A supervisor error on its way to an HTTP client.
#[derive(Debug)]
pub struct ApiError(pub SupervisorError);

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            SupervisorError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            SupervisorError::NotFound { .. } => StatusCode::NOT_FOUND,
            SupervisorError::DuplicateName { .. }
            | SupervisorError::AlreadyRunning { .. }
            | SupervisorError::OperationNotAllowed { .. } => StatusCode::CONFLICT,
            SupervisorError::LaunchFailed { .. }
            | SupervisorError::TerminationFailed { .. }
            | SupervisorError::Resurrect { .. } => StatusCode::BAD_GATEWAY,
            SupervisorError::Persistence { .. }
            | SupervisorError::QueueFull { .. }
            | SupervisorError::TaskPanic { .. }
            | SupervisorError::CompletionChannelClosed { .. }
            | SupervisorError::Unavailable { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.0.to_string();

        if status.is_server_error() {
            error!("API error: {} - {}", status, message);
        } else {
            warn!("API error: {} - {}", status, message);
        }

        let body = Json(ErrorResponse {
            error: self.0,
            message,
        });
        (status, body).into_response()
    }
}
