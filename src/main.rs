// src/main.rs

use anyhow::{Context, Result};
use axum::http::{HeaderMap, StatusCode as AxumStatusCode};
use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{NaiveDate, NaiveDateTime};
use clap::Parser;
use serde::Deserialize;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use thiserror::Error;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod actions;
mod grid;
mod hr_api;
mod model;

#[cfg(test)]
mod actions_tests;

use actions::{ActionError, ReviewSession};
use grid::GridError;
use hr_api::{HrApiClient, HrApiConfig, HrApiError, ReviewBackend, SubmitCorrectionRequest};
use model::{AttendanceStatus, ManagerOverride};

// --- Error type for the HTTP surface ---

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Action(#[from] ActionError),

    #[error("StaffHub backend client error")]
    HrApi(#[from] HrApiError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        error!("Error occurred: {:?}", self);
        let (status_code, error_message) = match &self {
            AppError::Action(action_err) => match action_err {
                ActionError::ReasonTooShort { .. } | ActionError::UnknownDate { .. } => {
                    (AxumStatusCode::BAD_REQUEST, action_err.to_string())
                }
                ActionError::RecordFinalized { .. }
                | ActionError::PackageFinalized
                | ActionError::PendingRequestsRemain { .. }
                | ActionError::NoPendingRequest { .. } => {
                    (AxumStatusCode::CONFLICT, action_err.to_string())
                }
                ActionError::RequestInFlight { .. }
                | ActionError::DateInFlight { .. }
                | ActionError::PackageInFlight { .. } => (
                    AxumStatusCode::CONFLICT,
                    "This operation is already in progress.".to_string(),
                ),
                ActionError::NotManager => (
                    AxumStatusCode::FORBIDDEN,
                    "Only managers may perform this action.".to_string(),
                ),
                ActionError::NotLoaded => (
                    AxumStatusCode::NOT_FOUND,
                    "No review package has been loaded for this employee.".to_string(),
                ),
                ActionError::SessionClosed => (
                    AxumStatusCode::GONE,
                    "The review session has been closed.".to_string(),
                ),
                ActionError::LoadSuperseded => (
                    AxumStatusCode::CONFLICT,
                    "A newer reload superseded this request.".to_string(),
                ),
                ActionError::Grid(grid_err) => match grid_err {
                    GridError::MissingPeriod | GridError::InvalidPeriod { .. } => (
                        AxumStatusCode::BAD_GATEWAY,
                        "Backend returned an unusable review period.".to_string(),
                    ),
                    GridError::NoFallback(_) => (
                        AxumStatusCode::BAD_GATEWAY,
                        "Failed to load review data and no previous data is available."
                            .to_string(),
                    ),
                },
                ActionError::Backend(e) => return backend_error_response(e),
            },
            AppError::HrApi(e) => return backend_error_response(e),
        };
        (
            status_code,
            Json(serde_json::json!({ "error": error_message })),
        )
            .into_response()
    }
}

fn backend_error_response(err: &HrApiError) -> axum::response::Response {
    let (status, message) = match err {
        HrApiError::RateLimitExceeded => (
            AxumStatusCode::TOO_MANY_REQUESTS,
            "HR backend rate limit exceeded. Please try again later.".to_string(),
        ),
        HrApiError::ApiError { status, message } => {
            error!("HR API Error: Status={}, Msg={}", status, message);
            let axum_status = AxumStatusCode::from_u16(status.as_u16())
                .unwrap_or(AxumStatusCode::INTERNAL_SERVER_ERROR);
            (
                axum_status,
                "An error occurred while communicating with the HR backend.".to_string(),
            )
        }
        HrApiError::Request(e) => {
            error!("Network request error to HR backend: {}", e);
            (
                AxumStatusCode::BAD_GATEWAY,
                "Failed to connect to the HR backend.".to_string(),
            )
        }
        HrApiError::Json(e) => {
            error!("JSON processing error from HR backend: {}", e);
            (
                AxumStatusCode::INTERNAL_SERVER_ERROR,
                "Internal error processing HR backend data.".to_string(),
            )
        }
        HrApiError::MissingToken | HrApiError::ConfigError(_) | HrApiError::UrlParse(_) => (
            AxumStatusCode::INTERNAL_SERVER_ERROR,
            "Server configuration error.".to_string(),
        ),
    };
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

// --- Configuration ---

#[derive(Debug, Clone, Deserialize)]
struct AppConfig {
    hr_api_base_url: String,
    hr_api_token: String,
    #[serde(default = "default_bind_addr")]
    bind_addr: String,
    #[serde(default = "default_request_timeout_secs")]
    request_timeout_secs: u64,
    #[serde(default = "default_min_reason_len")]
    min_reason_len: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_request_timeout_secs() -> u64 {
    hr_api::DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_min_reason_len() -> usize {
    actions::DEFAULT_MIN_REASON_LEN
}

#[derive(Debug, Parser)]
#[command(name = "staffhub-core", about = "StaffHub timesheet review service")]
struct CliArgs {
    /// Overrides STAFFHUB_BIND_ADDR.
    #[arg(long)]
    bind: Option<String>,

    /// Log filter, e.g. "info" or "staffhub_core=debug".
    #[arg(long, default_value = "info")]
    log: String,
}

// --- Application state ---

type SessionKey = (String, String);

#[derive(Clone)]
pub struct AppState {
    backend: Arc<HrApiClient>,
    sessions: Arc<Mutex<HashMap<SessionKey, Arc<ReviewSession>>>>,
    min_reason_len: usize,
}

impl AppState {
    /// Returns the open session for this (timesheet, employee) pair,
    /// creating one on first touch. The caller's role is captured when the
    /// session opens, matching the lifetime of the detail view it backs.
    async fn session(
        &self,
        timesheet_id: &str,
        employee_id: &str,
        is_manager: bool,
    ) -> Arc<ReviewSession> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry((timesheet_id.to_string(), employee_id.to_string()))
            .or_insert_with(|| {
                info!(
                    "Opening review session for Timesheet={}, Emp={}",
                    timesheet_id, employee_id
                );
                Arc::new(
                    ReviewSession::new(
                        self.backend.clone() as Arc<dyn ReviewBackend>,
                        timesheet_id,
                        employee_id,
                        is_manager,
                    )
                    .with_min_reason_len(self.min_reason_len),
                )
            })
            .clone()
    }
}

fn is_manager(headers: &HeaderMap) -> bool {
    // Role resolution is owned by the auth layer in front of this service;
    // only the boolean verdict is consumed here.
    headers
        .get("x-staffhub-role")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|role| role.eq_ignore_ascii_case("manager"))
}

// --- Main application ---

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = CliArgs::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Setting tracing subscriber failed: {}", e))?;
    info!("Tracing subscriber initialized.");

    let mut config: AppConfig = envy::prefixed("STAFFHUB_")
        .from_env()
        .context("Loading STAFFHUB_* configuration from environment failed")?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    info!("App configuration loaded.");

    let backend = Arc::new(HrApiClient::new(HrApiConfig {
        base_url: config.hr_api_base_url.clone(),
        api_token: config.hr_api_token.clone(),
        request_timeout_secs: config.request_timeout_secs,
    })?);
    info!("HR API client initialized.");

    let state = AppState {
        backend,
        sessions: Arc::new(Mutex::new(HashMap::new())),
        min_reason_len: config.min_reason_len,
    };

    let review_routes = Router::new()
        .route(
            "/{timesheet_id}/{employee_id}",
            get(handle_load_review).delete(handle_close_session),
        )
        .route(
            "/{timesheet_id}/{employee_id}/corrections",
            axum::routing::post(handle_submit_correction),
        )
        .route(
            "/{timesheet_id}/{employee_id}/corrections/{request_id}/approve",
            axum::routing::post(handle_approve),
        )
        .route(
            "/{timesheet_id}/{employee_id}/corrections/{request_id}/reject",
            axum::routing::post(handle_reject),
        )
        .route(
            "/{timesheet_id}/{employee_id}/override",
            axum::routing::post(handle_override),
        )
        .route(
            "/{timesheet_id}/{employee_id}/finalize",
            axum::routing::post(handle_finalize),
        );

    let app = Router::new()
        .nest("/api/review", review_routes)
        .route("/status", get(handle_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("Invalid bind address '{}'", config.bind_addr))?;
    info!("Starting server on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Binding listener failed")?;
    axum::serve(listener, app).await.context("Server failed")?;

    Ok(())
}

// --- Handlers ---

async fn handle_load_review(
    State(state): State<AppState>,
    Path((timesheet_id, employee_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let session = state
        .session(&timesheet_id, &employee_id, is_manager(&headers))
        .await;
    let package = session.load(None).await?;
    Ok(Json(package))
}

async fn handle_close_session(
    State(state): State<AppState>,
    Path((timesheet_id, employee_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let key = (timesheet_id, employee_id);
    let session = state.sessions.lock().await.remove(&key);
    if let Some(session) = session {
        session.close().await;
    }
    Ok(AxumStatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitCorrectionBody {
    work_date: NaiveDate,
    #[serde(default)]
    requested_check_in: Option<NaiveDateTime>,
    #[serde(default)]
    requested_check_out: Option<NaiveDateTime>,
    #[serde(default)]
    requested_status: Option<AttendanceStatus>,
    reason_for_edit: String,
    #[serde(default)]
    requested_notes: Option<String>,
}

async fn handle_submit_correction(
    State(state): State<AppState>,
    Path((timesheet_id, employee_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<SubmitCorrectionBody>,
) -> Result<impl IntoResponse, AppError> {
    let session = state
        .session(&timesheet_id, &employee_id, is_manager(&headers))
        .await;
    let request = SubmitCorrectionRequest {
        employee_id,
        work_date: body.work_date,
        requested_check_in: body.requested_check_in,
        requested_check_out: body.requested_check_out,
        requested_status: body.requested_status,
        reason_for_edit: body.reason_for_edit,
        requested_notes: body.requested_notes,
    };
    let request_id = session.submit_correction(request).await?;
    Ok(Json(serde_json::json!({ "requestId": request_id })))
}

async fn handle_approve(
    State(state): State<AppState>,
    Path((timesheet_id, employee_id, request_id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let session = state
        .session(&timesheet_id, &employee_id, is_manager(&headers))
        .await;
    session.approve(&request_id).await?;
    Ok(AxumStatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RejectBody {
    reason: String,
}

async fn handle_reject(
    State(state): State<AppState>,
    Path((timesheet_id, employee_id, request_id)): Path<(String, String, String)>,
    headers: HeaderMap,
    Json(body): Json<RejectBody>,
) -> Result<impl IntoResponse, AppError> {
    let session = state
        .session(&timesheet_id, &employee_id, is_manager(&headers))
        .await;
    session.reject(&request_id, &body.reason).await?;
    Ok(AxumStatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OverrideBody {
    #[serde(default)]
    attendance_id: Option<String>,
    work_date: NaiveDate,
    #[serde(default)]
    check_in_time: Option<NaiveDateTime>,
    #[serde(default)]
    check_out_time: Option<NaiveDateTime>,
    #[serde(default)]
    status: Option<AttendanceStatus>,
    #[serde(default)]
    notes: Option<String>,
    reason: String,
}

async fn handle_override(
    State(state): State<AppState>,
    Path((timesheet_id, employee_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<OverrideBody>,
) -> Result<impl IntoResponse, AppError> {
    let session = state
        .session(&timesheet_id, &employee_id, is_manager(&headers))
        .await;
    let request = ManagerOverride {
        attendance_id: body.attendance_id,
        employee_id,
        timesheet_id,
        work_date: body.work_date,
        check_in_time: body.check_in_time,
        check_out_time: body.check_out_time,
        status: body.status,
        notes: body.notes,
        reason: body.reason,
    };
    session.apply_override(request).await?;
    Ok(AxumStatusCode::NO_CONTENT)
}

async fn handle_finalize(
    State(state): State<AppState>,
    Path((timesheet_id, employee_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let session = state
        .session(&timesheet_id, &employee_id, is_manager(&headers))
        .await;
    let finalized_count = session.finalize_employee().await?;
    Ok(Json(serde_json::json!({ "finalizedCount": finalized_count })))
}

async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    let open_sessions = state.sessions.lock().await.len();
    Json(serde_json::json!({
        "service": "staffhub-core",
        "time": chrono::Local::now().to_rfc3339(),
        "openSessions": open_sessions,
    }))
}
