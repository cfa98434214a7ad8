// src/hr_api.rs

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::model::{
    AttendanceId, AttendanceStatus, CorrectionRequest, EmployeeId, ManagerOverride, RequestId,
    RequestStatus, TimesheetId,
};

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

// --- Error type for the StaffHub backend client ---

#[derive(Error, Debug)]
pub enum HrApiError {
    #[error("HTTP request failed")]
    Request(#[from] reqwest::Error),

    #[error("JSON processing error")]
    Json(#[from] serde_json::Error),

    #[error("URL parsing error")]
    UrlParse(#[from] url::ParseError),

    #[error("API token not configured")]
    MissingToken,

    #[error("Rate limit exceeded (Status 429)")]
    RateLimitExceeded,

    #[error("StaffHub API error: Status={status}, Message='{message}'")]
    ApiError { status: StatusCode, message: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

// --- Wire DTOs ---

/// One raw per-day row from the review-package feed. Upstream services emit
/// the attendance identifier under several key casings; the aliases here are
/// the single normalization point so business logic never has to look twice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDailyRow {
    #[serde(alias = "AttendanceId", alias = "attendanceid", default)]
    pub attendance_id: Option<AttendanceId>,
    #[serde(alias = "date", alias = "workDate")]
    pub work_date: String,
    #[serde(default)]
    pub check_in_time: Option<String>,
    #[serde(default)]
    pub check_out_time: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub total_hours: Option<f64>,
    #[serde(default)]
    pub request_id: Option<RequestId>,
    #[serde(default)]
    pub requested_check_in: Option<String>,
    #[serde(default)]
    pub requested_check_out: Option<String>,
    #[serde(default)]
    pub requested_status: Option<String>,
    #[serde(default)]
    pub requested_notes: Option<String>,
    #[serde(default)]
    pub reason_for_edit: Option<String>,
    #[serde(default)]
    pub request_status: Option<String>,
    #[serde(default)]
    pub is_finalized: Option<bool>,
    #[serde(default)]
    pub has_pending_request: Option<bool>,
}

impl RawDailyRow {
    /// Calendar day of this row, truncated from whatever timestamp shape the
    /// source used. Time-of-day and timezone offset are ignored on purpose:
    /// the grid is keyed by local calendar date.
    pub fn work_day(&self) -> Option<NaiveDate> {
        parse_work_day(&self.work_date)
    }
}

/// Review package for one (timesheet, employee) pair as served by the
/// backend. Month and year are optional on the wire; the grid refuses to
/// build without them rather than guessing a period.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewPackageResponse {
    pub employee_id: EmployeeId,
    pub timesheet_id: TimesheetId,
    #[serde(default)]
    pub month: Option<u32>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub is_finalized: Option<bool>,
    #[serde(default)]
    pub records: Vec<RawDailyRow>,
}

/// One employee's set of correction requests from the cross-employee
/// submission feed. The timesheet link is not reliably populated upstream,
/// which is why the matcher falls back to date-window filtering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionPackage {
    pub employee_id: EmployeeId,
    #[serde(default)]
    pub timesheet_id: Option<TimesheetId>,
    #[serde(default)]
    pub corrections: Vec<RawCorrection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionPackagesResponse {
    #[serde(default)]
    pub packages: Vec<SubmissionPackage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCorrection {
    pub request_id: RequestId,
    #[serde(alias = "AttendanceId", alias = "attendanceid", default)]
    pub attendance_id: Option<AttendanceId>,
    #[serde(default)]
    pub employee_id: Option<EmployeeId>,
    pub work_date: String,
    #[serde(default)]
    pub requested_check_in: Option<String>,
    #[serde(default)]
    pub requested_check_out: Option<String>,
    #[serde(default)]
    pub requested_status: Option<String>,
    #[serde(default)]
    pub requested_notes: Option<String>,
    #[serde(default)]
    pub reason_for_edit: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl RawCorrection {
    /// Converts the wire shape into the domain request. The owning package's
    /// employee id fills in when the row itself omits it. Returns None when
    /// the work date cannot be reduced to a calendar day.
    pub fn into_domain(self, package_employee: &str) -> Option<CorrectionRequest> {
        let work_date = parse_work_day(&self.work_date)?;
        Some(CorrectionRequest {
            request_id: self.request_id,
            attendance_id: non_empty(self.attendance_id),
            employee_id: self
                .employee_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| package_employee.to_string()),
            work_date,
            requested_check_in: parse_timestamp_opt(self.requested_check_in.as_deref()),
            requested_check_out: parse_timestamp_opt(self.requested_check_out.as_deref()),
            requested_status: self
                .requested_status
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .map(AttendanceStatus::from_wire),
            requested_notes: non_empty(self.requested_notes),
            reason_for_edit: self.reason_for_edit.unwrap_or_default(),
            status: self
                .status
                .as_deref()
                .map(RequestStatus::from_wire)
                .unwrap_or(RequestStatus::Pending),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitCorrectionRequest {
    pub employee_id: EmployeeId,
    pub work_date: NaiveDate,
    pub requested_check_in: Option<NaiveDateTime>,
    pub requested_check_out: Option<NaiveDateTime>,
    pub requested_status: Option<AttendanceStatus>,
    pub reason_for_edit: String,
    pub requested_notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessCorrectionRequest {
    pub request_id: RequestId,
    pub approve: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitCorrectionResponse {
    pub request_id: RequestId,
}

/// Echo of the values the override actually applied. Consumed directly by
/// the optimistic override cache; fields may come back empty when the
/// backend applied a partial override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideResponse {
    #[serde(alias = "AttendanceId", alias = "attendanceid", default)]
    pub attendance_id: Option<AttendanceId>,
    #[serde(default)]
    pub check_in_time: Option<String>,
    #[serde(default)]
    pub check_out_time: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    #[serde(default)]
    pub finalized_count: usize,
}

// Backend error bodies, when parseable.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiErrorPayload {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

// --- Wire parsing helpers ---

/// Reduces an upstream date or timestamp string to its calendar day.
/// Accepts `YYYY-MM-DD` with or without a trailing time/offset.
pub fn parse_work_day(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    // get() rejects short strings and strings where byte 10 is not a char
    // boundary; a valid date prefix is always ASCII.
    let head = trimmed.get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

/// Lenient timestamp parse: RFC3339, `YYYY-MM-DDTHH:MM:SS` or the
/// space-separated variant. Offsets are dropped, keeping the wall-clock
/// value, since the grid compares local calendar time.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.naive_local());
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(dt);
        }
    }
    warn!("Unparseable timestamp '{}' from backend, dropping", trimmed);
    None
}

pub fn parse_timestamp_opt(raw: Option<&str>) -> Option<NaiveDateTime> {
    raw.and_then(parse_timestamp)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

// --- Backend seam ---

/// The backend operations the review core consumes. `HrApiClient` is the
/// production implementation; tests substitute an in-memory mock.
#[async_trait]
pub trait ReviewBackend: Send + Sync {
    async fn fetch_review_package(
        &self,
        timesheet_id: &str,
        employee_id: &str,
    ) -> Result<ReviewPackageResponse, HrApiError>;

    async fn fetch_submission_packages(&self) -> Result<Vec<SubmissionPackage>, HrApiError>;

    async fn submit_correction(
        &self,
        request: &SubmitCorrectionRequest,
    ) -> Result<SubmitCorrectionResponse, HrApiError>;

    async fn process_correction(
        &self,
        request: &ProcessCorrectionRequest,
    ) -> Result<(), HrApiError>;

    async fn apply_override(
        &self,
        request: &ManagerOverride,
    ) -> Result<OverrideResponse, HrApiError>;

    async fn finalize_employee(
        &self,
        timesheet_id: &str,
        employee_id: &str,
    ) -> Result<FinalizeResponse, HrApiError>;
}

// --- Client configuration ---

#[derive(Clone, Debug)]
pub struct HrApiConfig {
    pub base_url: String,
    pub api_token: String,
    pub request_timeout_secs: u64,
}

impl Default for HrApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_token: String::new(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

// --- Client implementation ---

#[derive(Clone)]
pub struct HrApiClient {
    config: HrApiConfig,
    http_client: Client,
}

impl HrApiClient {
    pub fn new(config: HrApiConfig) -> Result<Self, HrApiError> {
        if config.base_url.is_empty() {
            return Err(HrApiError::ConfigError(
                "Backend base URL must be configured".to_string(),
            ));
        }
        if config.api_token.is_empty() {
            return Err(HrApiError::MissingToken);
        }
        // Validate the base URL up front so a typo fails at startup, not on
        // the first request.
        Url::parse(&config.base_url)?;

        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            config,
            http_client,
        })
    }

    fn build_request(&self, method: Method, endpoint: &str) -> Result<RequestBuilder, HrApiError> {
        let url = if endpoint.starts_with('/') {
            format!("{}{}", self.config.base_url.trim_end_matches('/'), endpoint)
        } else {
            format!("{}/{}", self.config.base_url.trim_end_matches('/'), endpoint)
        };
        Url::parse(&url)?;

        Ok(self
            .http_client
            .request(method, &url)
            .header(AUTHORIZATION, format!("Bearer {}", self.config.api_token))
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json"))
    }

    async fn send_and_deserialize<T: DeserializeOwned>(
        &self,
        request_builder: RequestBuilder,
        context_msg: &str,
    ) -> Result<T, HrApiError> {
        let request = request_builder.build().map_err(|e| {
            error!("Request build failed for '{}': {}", context_msg, e);
            HrApiError::Request(e)
        })?;
        let request_url = request.url().to_string();
        debug!("Sending request for '{}' to URL: {}", context_msg, request_url);

        let response = self.http_client.execute(request).await?;
        let status = response.status();
        info!(
            "Received response for '{}' (URL: {}): Status={}",
            context_msg, request_url, status
        );

        if status.is_success() {
            let bytes = response.bytes().await?;
            match serde_json::from_slice::<T>(&bytes) {
                Ok(data) => Ok(data),
                Err(e) => {
                    error!(
                        "JSON deserialization failed for '{}' (URL: {}): {}",
                        context_msg, request_url, e
                    );
                    Err(HrApiError::Json(e))
                }
            }
        } else {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("Failed to read error body: {}", e));
            error!(
                "API Error Response: Status={}, Body='{}' for URL: {}",
                status, error_body, request_url
            );

            if status == StatusCode::TOO_MANY_REQUESTS {
                warn!("Rate limit exceeded for '{}'", context_msg);
                return Err(HrApiError::RateLimitExceeded);
            }

            let message = match serde_json::from_str::<ApiErrorPayload>(&error_body) {
                Ok(parsed) => parsed
                    .message
                    .or(parsed.error)
                    .unwrap_or(error_body),
                Err(_) => error_body,
            };
            Err(HrApiError::ApiError { status, message })
        }
    }
}

#[async_trait]
impl ReviewBackend for HrApiClient {
    async fn fetch_review_package(
        &self,
        timesheet_id: &str,
        employee_id: &str,
    ) -> Result<ReviewPackageResponse, HrApiError> {
        let endpoint = format!(
            "/timesheets/{}/employees/{}/review",
            timesheet_id, employee_id
        );
        let request = self.build_request(Method::GET, &endpoint)?;
        self.send_and_deserialize(request, "fetch review package")
            .await
    }

    async fn fetch_submission_packages(&self) -> Result<Vec<SubmissionPackage>, HrApiError> {
        let request = self.build_request(Method::GET, "/corrections/submissions")?;
        let response: SubmissionPackagesResponse = self
            .send_and_deserialize(request, "fetch submission packages")
            .await?;
        Ok(response.packages)
    }

    async fn submit_correction(
        &self,
        request: &SubmitCorrectionRequest,
    ) -> Result<SubmitCorrectionResponse, HrApiError> {
        let builder = self.build_request(Method::POST, "/corrections")?.json(request);
        self.send_and_deserialize(builder, "submit correction").await
    }

    async fn process_correction(
        &self,
        request: &ProcessCorrectionRequest,
    ) -> Result<(), HrApiError> {
        let endpoint = format!("/corrections/{}/process", request.request_id);
        let builder = self.build_request(Method::POST, &endpoint)?.json(request);
        // Response body is an acknowledgement we do not consume.
        let _: serde_json::Value = self
            .send_and_deserialize(builder, "process correction")
            .await?;
        Ok(())
    }

    async fn apply_override(
        &self,
        request: &ManagerOverride,
    ) -> Result<OverrideResponse, HrApiError> {
        let builder = self
            .build_request(Method::POST, "/attendance/override")?
            .json(request);
        self.send_and_deserialize(builder, "apply manager override")
            .await
    }

    async fn finalize_employee(
        &self,
        timesheet_id: &str,
        employee_id: &str,
    ) -> Result<FinalizeResponse, HrApiError> {
        let endpoint = format!(
            "/timesheets/{}/employees/{}/finalize",
            timesheet_id, employee_id
        );
        let builder = self.build_request(Method::POST, &endpoint)?;
        self.send_and_deserialize(builder, "finalize employee records")
            .await
    }
}
