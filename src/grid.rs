// src/grid.rs
//
// The monthly reconciliation pipeline: normalize the sparse daily feed into
// a full calendar grid, merge correction requests onto it, re-apply
// optimistic manager overrides, then derive the package aggregates.

use chrono::{Datelike, NaiveDate};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::hr_api::{
    parse_timestamp_opt, HrApiError, OverrideResponse, RawDailyRow, ReviewPackageResponse,
};
use crate::model::{
    is_weekend, AttendanceStatus, CorrectionRequest, DailyRecord, EmployeeReviewPackage,
    FinalizedSignal, RequestStatus,
};

#[derive(Error, Debug)]
pub enum GridError {
    #[error("Review period (month/year) missing from backend payload; refusing to build a grid")]
    MissingPeriod,

    #[error("Invalid review period {month}/{year}")]
    InvalidPeriod { month: u32, year: i32 },

    #[error("Backend reload failed and no previous package is available")]
    NoFallback(#[source] HrApiError),
}

/// Number of days in the given calendar month, or None for an invalid
/// month/year pair.
pub fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next_first = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some(next_first.signed_duration_since(first).num_days() as u32)
}

// --- DailyRecord Normalizer ---

/// Expands the sparse per-day feed for one employee-month into exactly one
/// record per calendar day, ascending by date. Days without a source row
/// become `No Record` placeholders. The weekend flag always comes from the
/// synthesized date's weekday; a stale "absent" marking in the source must
/// never claim a weekend.
pub fn normalize_month(
    employee_id: &str,
    month: u32,
    year: i32,
    rows: &[RawDailyRow],
) -> Result<Vec<DailyRecord>, GridError> {
    let day_count = days_in_month(year, month).ok_or(GridError::InvalidPeriod { month, year })?;

    let mut by_date: HashMap<NaiveDate, &RawDailyRow> = HashMap::new();
    for row in rows {
        match row.work_day() {
            Some(date) => {
                if by_date.insert(date, row).is_some() {
                    warn!(
                        "Duplicate source row for Emp={}, Date={}; keeping the later row",
                        employee_id, date
                    );
                }
            }
            None => warn!(
                "Source row with unparseable date '{}' for Emp={}, skipping",
                row.work_date, employee_id
            ),
        }
    }

    let mut records = Vec::with_capacity(day_count as usize);
    for day in 1..=day_count {
        // Day number is within the validated month, so the date exists.
        let date = NaiveDate::from_ymd_opt(year, month, day)
            .ok_or(GridError::InvalidPeriod { month, year })?;

        let record = match by_date.get(&date) {
            Some(row) => daily_record_from_row(date, row),
            None => DailyRecord::placeholder(date),
        };
        records.push(record);
    }

    debug!(
        "Normalized {} source rows into {} daily records for Emp={}, Period={}/{}",
        rows.len(),
        records.len(),
        employee_id,
        month,
        year
    );
    Ok(records)
}

fn daily_record_from_row(date: NaiveDate, row: &RawDailyRow) -> DailyRecord {
    let request_status = row
        .request_status
        .as_deref()
        .map(RequestStatus::from_wire)
        .unwrap_or(RequestStatus::None);
    let total_hours = row
        .total_hours
        .and_then(Decimal::from_f64)
        .unwrap_or(Decimal::ZERO)
        .max(Decimal::ZERO);

    DailyRecord {
        date,
        attendance_id: row.attendance_id.clone().filter(|id| !id.is_empty()),
        original_check_in: parse_timestamp_opt(row.check_in_time.as_deref()),
        original_check_out: parse_timestamp_opt(row.check_out_time.as_deref()),
        original_status: row
            .status
            .as_deref()
            .map(AttendanceStatus::from_wire)
            .unwrap_or(AttendanceStatus::NoRecord),
        original_total_hours: total_hours,
        requested_check_in: parse_timestamp_opt(row.requested_check_in.as_deref()),
        requested_check_out: parse_timestamp_opt(row.requested_check_out.as_deref()),
        requested_status: row
            .requested_status
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(AttendanceStatus::from_wire),
        requested_notes: row.requested_notes.clone().filter(|s| !s.is_empty()),
        reason_for_edit: row.reason_for_edit.clone().filter(|s| !s.is_empty()),
        request_id: row.request_id.clone().filter(|id| !id.is_empty()),
        request_status,
        is_finalized: row.is_finalized.unwrap_or(false),
        has_pending_request: row.has_pending_request.unwrap_or(false)
            || request_status == RequestStatus::Pending,
        has_record: true,
        is_weekend: is_weekend(date),
    }
}

// --- Correction Matcher ---

/// Annotates the grid with the employee's correction requests from the
/// submission feed. The feed's timesheet link is not reliably populated
/// upstream, so corrections are matched by employee plus month/year window
/// until the correction store grows a real linking key (tracked with the
/// team owning that store). Finalized records are immutable and are never
/// perturbed by stale corrections the backend has already superseded.
pub fn merge_corrections(
    records: &mut [DailyRecord],
    corrections: &[CorrectionRequest],
    employee_id: &str,
    month: u32,
    year: i32,
) {
    let mut by_date: HashMap<NaiveDate, &mut DailyRecord> =
        records.iter_mut().map(|r| (r.date, r)).collect();

    for correction in corrections {
        if correction.employee_id != employee_id {
            continue;
        }
        if correction.work_date.month() != month || correction.work_date.year() != year {
            continue;
        }
        let Some(record) = by_date.get_mut(&correction.work_date) else {
            continue;
        };
        if record.is_finalized {
            debug!(
                "Skipping correction {} on finalized record {}",
                correction.request_id, record.date
            );
            continue;
        }

        record.request_id = Some(correction.request_id.clone());
        record.requested_check_in = correction.requested_check_in;
        record.requested_check_out = correction.requested_check_out;
        record.requested_status = correction.requested_status;
        record.requested_notes = correction.requested_notes.clone();
        record.reason_for_edit = Some(correction.reason_for_edit.clone());
        record.request_status = correction.status;
        record.has_pending_request = correction.status == RequestStatus::Pending;
    }
}

// --- Optimistic Override Cache ---

/// Values the backend confirmed it applied for a manager override.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CachedOverride {
    pub check_in_time: Option<chrono::NaiveDateTime>,
    pub check_out_time: Option<chrono::NaiveDateTime>,
    pub status: Option<AttendanceStatus>,
}

impl From<&OverrideResponse> for CachedOverride {
    fn from(response: &OverrideResponse) -> Self {
        Self {
            check_in_time: parse_timestamp_opt(response.check_in_time.as_deref()),
            check_out_time: parse_timestamp_opt(response.check_out_time.as_deref()),
            status: response
                .status
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .map(AttendanceStatus::from_wire),
        }
    }
}

/// Bridges the gap between "the override call succeeded" and "the backend
/// read view reflects it". Overrides on days with no original attendance id
/// can lag indefinitely in the read path (the finalized row and the
/// attendance row never join when both sides of the key are NULL), so the
/// session holds the confirmed values here, keyed by calendar date, and
/// stamps them back onto every rebuilt grid until the server catches up.
/// Owned by the review session; lives exactly as long as the detail view.
#[derive(Debug, Default)]
pub struct OverrideCache {
    entries: HashMap<NaiveDate, CachedOverride>,
}

impl OverrideCache {
    /// Stores the confirmed override for a date. Called immediately after a
    /// successful override API response.
    pub fn record(&mut self, date: NaiveDate, applied: CachedOverride) {
        info!("Caching optimistic override for {}: {:?}", date, applied);
        self.entries.insert(date, applied);
    }

    /// Re-stamps every cached override onto the freshly rebuilt grid.
    /// Entries whose record the server now reports finalized have been
    /// confirmed and are dropped; all others force the record to the
    /// override's values so the user never sees an override regress.
    pub fn reapply(&mut self, records: &mut [DailyRecord]) {
        let mut confirmed: Vec<NaiveDate> = Vec::new();

        for (date, applied) in &self.entries {
            let Some(record) = records.iter_mut().find(|r| r.date == *date) else {
                continue;
            };
            if record.is_finalized {
                info!("Server confirmed override for {}; dropping cache entry", date);
                confirmed.push(*date);
                continue;
            }

            if applied.check_in_time.is_some() {
                record.original_check_in = applied.check_in_time;
            }
            if applied.check_out_time.is_some() {
                record.original_check_out = applied.check_out_time;
            }
            if let Some(status) = applied.status {
                record.original_status = status;
            }
            record.is_finalized = true;
            record.has_record = true;
            debug!("Re-applied optimistic override for {}", date);
        }

        for date in confirmed {
            self.entries.remove(&date);
        }
    }

    pub fn drop_entry(&mut self, date: NaiveDate) {
        self.entries.remove(&date);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// --- Monthly Grid Builder ---

/// Single entry point that runs Normalizer, Matcher and override
/// reapplication, then derives the package aggregates. Keeps the previous
/// package and the package-level finalization signal across rebuilds so a
/// failed reload can fall back instead of blanking the view.
pub struct GridBuilder {
    timesheet_id: String,
    employee_id: String,
    overrides: OverrideCache,
    finalized: FinalizedSignal,
    current: Option<EmployeeReviewPackage>,
}

impl GridBuilder {
    pub fn new(timesheet_id: &str, employee_id: &str) -> Self {
        Self {
            timesheet_id: timesheet_id.to_string(),
            employee_id: employee_id.to_string(),
            overrides: OverrideCache::default(),
            finalized: FinalizedSignal::default(),
            current: None,
        }
    }

    pub fn current(&self) -> Option<&EmployeeReviewPackage> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut EmployeeReviewPackage> {
        self.current.as_mut()
    }

    /// Marks the whole employee-month finalized directly. Used by the batch
    /// finalize path, where re-deriving would stay false whenever absence
    /// days without an attendance id are present.
    pub fn force_finalized(&mut self) {
        self.finalized.update_server(Some(true));
        if let Some(package) = self.current.as_mut() {
            package.finalized = self.finalized;
        }
    }

    /// Rebuilds the package from an authoritative reload. Aggregates are
    /// recomputed from scratch every time; incremental patching drifts.
    pub fn rebuild(
        &mut self,
        response: &ReviewPackageResponse,
        corrections: &[CorrectionRequest],
    ) -> Result<&EmployeeReviewPackage, GridError> {
        let (month, year) = match (response.month, response.year) {
            (Some(month), Some(year)) => (month, year),
            // Guessing "current month" here would show the wrong historical
            // period, which is worse than showing nothing.
            _ => return Err(GridError::MissingPeriod),
        };

        let mut records = normalize_month(&self.employee_id, month, year, &response.records)?;
        merge_corrections(&mut records, corrections, &self.employee_id, month, year);
        self.overrides.reapply(&mut records);

        self.finalized.update_server(response.is_finalized);
        self.finalized.update_derived(derive_package_finalized(&records));

        let counts = Aggregates::compute(&records);
        info!(
            "Rebuilt review package for Emp={}, Period={}/{}: {} records, {} pending, {} finalized",
            self.employee_id, month, year, counts.total_records, counts.pending, counts.finalized
        );

        Ok(self.current.insert(EmployeeReviewPackage {
            employee_id: self.employee_id.clone(),
            timesheet_id: self.timesheet_id.clone(),
            month,
            year,
            records,
            pending_request_count: counts.pending,
            approved_count: counts.approved,
            rejected_count: counts.rejected,
            finalized_count: counts.finalized,
            total_records: counts.total_records,
            non_work_count: counts.non_work,
            finalized: self.finalized,
        }))
    }

    /// Stores a confirmed override and immediately stamps it onto the
    /// current package so the view reflects it before the next reload
    /// completes.
    pub fn record_override(&mut self, date: NaiveDate, applied: CachedOverride) {
        self.overrides.record(date, applied);
        if let Some(package) = self.current.as_mut() {
            self.overrides.reapply(&mut package.records);
        }
    }

    /// Recomputes the aggregate counters on the current package after an
    /// optimistic local mutation, keeping the counters and the derived
    /// finalization signal in step until the next authoritative rebuild.
    pub fn refresh_aggregates(&mut self) {
        let Some(package) = self.current.as_mut() else {
            return;
        };
        self.finalized.update_derived(derive_package_finalized(&package.records));
        let counts = Aggregates::compute(&package.records);
        package.pending_request_count = counts.pending;
        package.approved_count = counts.approved;
        package.rejected_count = counts.rejected;
        package.finalized_count = counts.finalized;
        package.total_records = counts.total_records;
        package.non_work_count = counts.non_work;
        package.finalized = self.finalized;
    }

    /// Fallback chain for a failed authoritative reload: the previous
    /// in-memory package if populated, then an optionally supplied snapshot,
    /// otherwise the error surfaces. Never a silent blank grid.
    pub fn fallback(
        &mut self,
        error: HrApiError,
        snapshot: Option<EmployeeReviewPackage>,
    ) -> Result<(), GridError> {
        if self.current.as_ref().is_some_and(|p| !p.records.is_empty()) {
            warn!(
                "Reload failed for Emp={} ({}); keeping previous in-memory package",
                self.employee_id, error
            );
            return Ok(());
        }
        match snapshot {
            Some(snapshot) => {
                warn!(
                    "Reload failed for Emp={} ({}); using passed-in package snapshot",
                    self.employee_id, error
                );
                if snapshot.is_finalized() {
                    self.finalized.update_server(Some(true));
                }
                self.current = Some(snapshot);
                Ok(())
            }
            None => Err(GridError::NoFallback(error)),
        }
    }
}

/// Package-level finalization derived only from records that both have a
/// source row and carry an attendance identifier; id-less placeholders are
/// excluded because the backend truth source cannot always stamp them.
/// Returns None when no record qualifies, so the caller keeps the last
/// known value instead of defaulting to false.
fn derive_package_finalized(records: &[DailyRecord]) -> Option<bool> {
    let mut saw_identified = false;
    for record in records {
        if record.has_record && record.attendance_id.is_some() {
            saw_identified = true;
            if !record.is_finalized {
                return Some(false);
            }
        }
    }
    saw_identified.then_some(true)
}

struct Aggregates {
    pending: usize,
    approved: usize,
    rejected: usize,
    finalized: usize,
    total_records: usize,
    non_work: usize,
}

impl Aggregates {
    fn compute(records: &[DailyRecord]) -> Self {
        let mut counts = Self {
            pending: 0,
            approved: 0,
            rejected: 0,
            finalized: 0,
            total_records: 0,
            non_work: 0,
        };
        for record in records {
            if !record.is_finalized && record.has_pending() {
                counts.pending += 1;
            }
            match record.request_status {
                RequestStatus::Approved => counts.approved += 1,
                RequestStatus::Rejected => counts.rejected += 1,
                _ => {}
            }
            if record.is_finalized {
                counts.finalized += 1;
            }
            if record.has_record {
                counts.total_records += 1;
            }
            if record.original_status.is_non_work() {
                counts.non_work += 1;
            }
        }
        counts
    }
}
