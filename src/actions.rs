// src/actions.rs
//
// The review session: one per open employee-review detail view. Owns the
// grid builder (and through it the optimistic override cache), the in-flight
// markers, and the teardown generation. All server interaction flows through
// the `ReviewBackend` seam.

use chrono::NaiveDate;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::grid::{CachedOverride, GridBuilder, GridError};
use crate::hr_api::{
    HrApiError, ProcessCorrectionRequest, ReviewBackend, SubmissionPackage,
    SubmitCorrectionRequest,
};
use crate::model::{
    CorrectionRequest, EmployeeReviewPackage, ManagerOverride, RequestId, RequestStatus,
};

pub const DEFAULT_MIN_REASON_LEN: usize = 10;

#[derive(Error, Debug)]
pub enum ActionError {
    #[error("Reason must be at least {min} characters")]
    ReasonTooShort { min: usize },

    #[error("Record for {date} is finalized and cannot be modified")]
    RecordFinalized { date: NaiveDate },

    #[error("The review package for this month is finalized")]
    PackageFinalized,

    #[error("No daily record exists for {date} in the loaded month")]
    UnknownDate { date: NaiveDate },

    #[error("No pending correction request with id {request_id}")]
    NoPendingRequest { request_id: RequestId },

    #[error("Request {request_id} is already being processed")]
    RequestInFlight { request_id: RequestId },

    #[error("An operation for {date} is already in flight")]
    DateInFlight { date: NaiveDate },

    #[error("A finalize operation for employee {employee_id} is already in flight")]
    PackageInFlight { employee_id: String },

    #[error("Cannot finalize while {pending} correction request(s) are pending")]
    PendingRequestsRemain { pending: usize },

    #[error("Only managers may perform this action")]
    NotManager,

    #[error("No review package has been loaded yet")]
    NotLoaded,

    #[error("Review session is closed")]
    SessionClosed,

    #[error("A newer load superseded this one")]
    LoadSuperseded,

    #[error(transparent)]
    Grid(#[from] GridError),

    #[error("Backend call failed")]
    Backend(#[from] HrApiError),
}

struct SessionState {
    builder: GridBuilder,
    processing_request_ids: HashSet<RequestId>,
    processing_dates: HashSet<NaiveDate>,
    processing_package_ids: HashSet<String>,
    generation: u64,
    closed: bool,
}

/// One review session for a (timesheet, employee) pair. Constructed when the
/// detail view opens, closed when it goes away; all state is discarded with
/// it except what the backend persisted.
pub struct ReviewSession {
    backend: Arc<dyn ReviewBackend>,
    timesheet_id: String,
    employee_id: String,
    is_manager: bool,
    min_reason_len: usize,
    state: Mutex<SessionState>,
}

impl ReviewSession {
    pub fn new(
        backend: Arc<dyn ReviewBackend>,
        timesheet_id: &str,
        employee_id: &str,
        is_manager: bool,
    ) -> Self {
        Self {
            backend,
            timesheet_id: timesheet_id.to_string(),
            employee_id: employee_id.to_string(),
            is_manager,
            min_reason_len: DEFAULT_MIN_REASON_LEN,
            state: Mutex::new(SessionState {
                builder: GridBuilder::new(timesheet_id, employee_id),
                processing_request_ids: HashSet::new(),
                processing_dates: HashSet::new(),
                processing_package_ids: HashSet::new(),
                generation: 0,
                closed: false,
            }),
        }
    }

    pub fn with_min_reason_len(mut self, min: usize) -> Self {
        self.min_reason_len = min;
        self
    }

    /// Snapshot of the current package for the consuming view.
    pub async fn package(&self) -> Option<EmployeeReviewPackage> {
        self.state.lock().await.builder.current().cloned()
    }

    /// Tears the session down: in-flight loads started before this point
    /// will find a newer generation and discard their results instead of
    /// mutating dead state.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.generation += 1;
        state.processing_request_ids.clear();
        state.processing_dates.clear();
        state.processing_package_ids.clear();
        info!(
            "Review session closed for Emp={}, Timesheet={}",
            self.employee_id, self.timesheet_id
        );
    }

    /// Loads (or reloads) the review package. The package feed and the
    /// submission feed are fetched in parallel; a failure in the submission
    /// feed degrades to an un-annotated grid, a failure in the package feed
    /// falls back to the previous package or the supplied snapshot.
    pub async fn load(
        &self,
        snapshot: Option<EmployeeReviewPackage>,
    ) -> Result<EmployeeReviewPackage, ActionError> {
        let generation = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(ActionError::SessionClosed);
            }
            state.generation += 1;
            state.generation
        };

        let (package_result, submissions_result) = tokio::join!(
            self.backend
                .fetch_review_package(&self.timesheet_id, &self.employee_id),
            self.backend.fetch_submission_packages(),
        );

        let corrections = match submissions_result {
            Ok(packages) => collect_corrections(packages, &self.employee_id),
            Err(e) => {
                // The grid is still useful without correction annotations.
                warn!(
                    "Submission package feed failed for Emp={}: {}; continuing without corrections",
                    self.employee_id, e
                );
                Vec::new()
            }
        };

        let mut state = self.state.lock().await;
        if state.closed {
            debug!(
                "Discarding load result for closed session, Emp={}",
                self.employee_id
            );
            return Err(ActionError::SessionClosed);
        }
        if state.generation != generation {
            debug!(
                "Discarding stale load result for Emp={} (generation {} < {})",
                self.employee_id, generation, state.generation
            );
            return Err(ActionError::LoadSuperseded);
        }

        match package_result {
            Ok(response) => {
                state.builder.rebuild(&response, &corrections)?;
            }
            Err(e) => {
                state.builder.fallback(e, snapshot)?;
            }
        }
        state
            .builder
            .current()
            .cloned()
            .ok_or(ActionError::NotLoaded)
    }

    /// Employee-side submission of a correction request for one day.
    /// Blocked locally when the day or the whole month is finalized.
    pub async fn submit_correction(
        &self,
        request: SubmitCorrectionRequest,
    ) -> Result<RequestId, ActionError> {
        let date = request.work_date;
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(ActionError::SessionClosed);
            }
            let package = state.builder.current().ok_or(ActionError::NotLoaded)?;
            if package.is_finalized() {
                return Err(ActionError::PackageFinalized);
            }
            let record = package
                .record_for_date(date)
                .ok_or(ActionError::UnknownDate { date })?;
            if record.is_finalized {
                return Err(ActionError::RecordFinalized { date });
            }
            self.check_reason(&request.reason_for_edit)?;
            if !state.processing_dates.insert(date) {
                return Err(ActionError::DateInFlight { date });
            }
        }

        let result = self.backend.submit_correction(&request).await;

        let mut state = self.state.lock().await;
        state.processing_dates.remove(&date);
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    "Correction submission failed for Emp={}, Date={}: {}",
                    self.employee_id, date, e
                );
                return Err(e.into());
            }
        };

        if let Some(record) = state
            .builder
            .current_mut()
            .and_then(|p| p.records.iter_mut().find(|r| r.date == date))
        {
            record.request_id = Some(response.request_id.clone());
            record.requested_check_in = request.requested_check_in;
            record.requested_check_out = request.requested_check_out;
            record.requested_status = request.requested_status;
            record.requested_notes = request.requested_notes.clone();
            record.reason_for_edit = Some(request.reason_for_edit.clone());
            record.request_status = RequestStatus::Pending;
            record.has_pending_request = true;
        }
        state.builder.refresh_aggregates();
        drop(state);

        info!(
            "Correction {} submitted for Emp={}, Date={}",
            response.request_id, self.employee_id, date
        );
        self.reload_after_write().await;
        Ok(response.request_id)
    }

    /// Manager approval of a pending correction: the requested values are
    /// promoted into the original fields and the request is cleared.
    pub async fn approve(&self, request_id: &str) -> Result<(), ActionError> {
        self.process(request_id, true, None).await
    }

    /// Manager rejection of a pending correction: requires a reason, clears
    /// the requested values without promotion.
    pub async fn reject(&self, request_id: &str, reason: &str) -> Result<(), ActionError> {
        self.check_reason(reason)?;
        self.process(request_id, false, Some(reason.to_string())).await
    }

    async fn process(
        &self,
        request_id: &str,
        approve: bool,
        rejection_reason: Option<String>,
    ) -> Result<(), ActionError> {
        if !self.is_manager {
            return Err(ActionError::NotManager);
        }
        let date = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(ActionError::SessionClosed);
            }
            let package = state.builder.current().ok_or(ActionError::NotLoaded)?;
            let record = package
                .records
                .iter()
                .find(|r| r.request_id.as_deref() == Some(request_id))
                .ok_or_else(|| ActionError::NoPendingRequest {
                    request_id: request_id.to_string(),
                })?;
            if record.is_finalized {
                return Err(ActionError::RecordFinalized { date: record.date });
            }
            if record.request_status != RequestStatus::Pending {
                return Err(ActionError::NoPendingRequest {
                    request_id: request_id.to_string(),
                });
            }
            let date = record.date;
            if !state.processing_request_ids.insert(request_id.to_string()) {
                return Err(ActionError::RequestInFlight {
                    request_id: request_id.to_string(),
                });
            }
            date
        };

        let call = ProcessCorrectionRequest {
            request_id: request_id.to_string(),
            approve,
            rejection_reason,
        };
        let result = self.backend.process_correction(&call).await;

        let mut state = self.state.lock().await;
        state.processing_request_ids.remove(request_id);
        if let Err(e) = result {
            warn!(
                "Processing correction {} ({}) failed: {}",
                request_id,
                if approve { "approve" } else { "reject" },
                e
            );
            return Err(e.into());
        }

        if let Some(record) = state
            .builder
            .current_mut()
            .and_then(|p| p.records.iter_mut().find(|r| r.date == date))
        {
            if approve {
                record.promote_requested();
            } else {
                record.clear_requested(RequestStatus::Rejected);
            }
        }
        state.builder.refresh_aggregates();
        drop(state);

        info!(
            "Correction {} {} for Emp={}, Date={}",
            request_id,
            if approve { "approved" } else { "rejected" },
            self.employee_id,
            date
        );
        self.reload_after_write().await;
        Ok(())
    }

    /// Manager override: sets a day's values directly, outside the
    /// correction workflow, and is the only path that can fix a day with no
    /// existing attendance row. The values echoed by the backend feed the
    /// optimistic override cache so the change survives lagging reloads.
    pub async fn apply_override(&self, request: ManagerOverride) -> Result<(), ActionError> {
        if !self.is_manager {
            return Err(ActionError::NotManager);
        }
        self.check_reason(&request.reason)?;
        let date = request.work_date;
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(ActionError::SessionClosed);
            }
            let package = state.builder.current().ok_or(ActionError::NotLoaded)?;
            if package.is_finalized() {
                return Err(ActionError::PackageFinalized);
            }
            if let Some(record) = package.record_for_date(date) {
                if record.is_finalized {
                    return Err(ActionError::RecordFinalized { date });
                }
            } else {
                return Err(ActionError::UnknownDate { date });
            }
            if !state.processing_dates.insert(date) {
                return Err(ActionError::DateInFlight { date });
            }
        }

        let result = self.backend.apply_override(&request).await;

        let mut state = self.state.lock().await;
        state.processing_dates.remove(&date);
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    "Manager override failed for Emp={}, Date={}: {}",
                    self.employee_id, date, e
                );
                return Err(e.into());
            }
        };

        // Effective values come from the backend echo; fields the echo
        // leaves empty fall back to what was requested.
        let mut applied = CachedOverride::from(&response);
        if applied.check_in_time.is_none() {
            applied.check_in_time = request.check_in_time;
        }
        if applied.check_out_time.is_none() {
            applied.check_out_time = request.check_out_time;
        }
        if applied.status.is_none() {
            applied.status = request.status;
        }

        state.builder.record_override(date, applied);
        state.builder.refresh_aggregates();
        drop(state);

        info!(
            "Manager override applied for Emp={}, Date={}",
            self.employee_id, date
        );
        self.reload_after_write().await;
        Ok(())
    }

    /// Batch finalize for this employee-month. Rejected before any network
    /// call while correction requests are still pending. On success every
    /// record with clock data and a working status is locked, and the
    /// package flag is set directly rather than re-derived (the derivation
    /// would stay false whenever id-less absence days are present).
    pub async fn finalize_employee(&self) -> Result<usize, ActionError> {
        if !self.is_manager {
            return Err(ActionError::NotManager);
        }
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(ActionError::SessionClosed);
            }
            state.builder.refresh_aggregates();
            let package = state.builder.current().ok_or(ActionError::NotLoaded)?;
            if package.is_finalized() {
                return Err(ActionError::PackageFinalized);
            }
            let pending = package.pending_request_count;
            if pending > 0 {
                return Err(ActionError::PendingRequestsRemain { pending });
            }
            if !state
                .processing_package_ids
                .insert(self.employee_id.clone())
            {
                return Err(ActionError::PackageInFlight {
                    employee_id: self.employee_id.clone(),
                });
            }
        }

        let result = self
            .backend
            .finalize_employee(&self.timesheet_id, &self.employee_id)
            .await;

        let mut state = self.state.lock().await;
        state.processing_package_ids.remove(&self.employee_id);
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    "Batch finalize failed for Emp={}, Timesheet={}: {}",
                    self.employee_id, self.timesheet_id, e
                );
                return Err(e.into());
            }
        };

        if let Some(package) = state.builder.current_mut() {
            for record in package.records.iter_mut() {
                if record.has_record && record.original_status.is_finalizable() {
                    record.is_finalized = true;
                }
            }
        }
        state.builder.force_finalized();
        state.builder.refresh_aggregates();
        drop(state);

        info!(
            "Finalized {} record(s) for Emp={}, Timesheet={}",
            response.finalized_count, self.employee_id, self.timesheet_id
        );
        self.reload_after_write().await;
        Ok(response.finalized_count)
    }

    fn check_reason(&self, reason: &str) -> Result<(), ActionError> {
        if reason.trim().len() < self.min_reason_len {
            return Err(ActionError::ReasonTooShort {
                min: self.min_reason_len,
            });
        }
        Ok(())
    }

    /// Post-write reload. The write already succeeded server-side, so a
    /// failed or stale reload only logs; the optimistic state stands until
    /// the next successful rebuild.
    async fn reload_after_write(&self) {
        match self.load(None).await {
            Ok(_) => {}
            Err(ActionError::SessionClosed) | Err(ActionError::LoadSuperseded) => {}
            Err(e) => warn!(
                "Post-write reload failed for Emp={}: {}; keeping optimistic state",
                self.employee_id, e
            ),
        }
    }
}

/// Flattens the cross-employee submission feed into this employee's domain
/// corrections. Rows that cannot be reduced to a calendar day are dropped
/// with a warning at the boundary.
pub fn collect_corrections(
    packages: Vec<SubmissionPackage>,
    employee_id: &str,
) -> Vec<CorrectionRequest> {
    let mut corrections = Vec::new();
    for package in packages {
        if package.employee_id != employee_id {
            continue;
        }
        let package_employee = package.employee_id.clone();
        for raw in package.corrections {
            match raw.into_domain(&package_employee) {
                Some(correction) => corrections.push(correction),
                None => warn!(
                    "Dropping correction with unparseable work date for Emp={}",
                    package_employee
                ),
            }
        }
    }
    corrections
}
