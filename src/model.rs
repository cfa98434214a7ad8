// src/model.rs

use chrono::{Datelike, NaiveDate, NaiveDateTime, Weekday};
use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

pub type EmployeeId = String;
pub type TimesheetId = String;
pub type AttendanceId = String;
pub type RequestId = String;

// --- Attendance status ---

/// Normalized per-day attendance status. Upstream systems emit these as
/// free-form strings with inconsistent casing and separators, so all parsing
/// goes through [`AttendanceStatus::from_wire`] and nowhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    HalfDay,
    OnLeave,
    Holiday,
    NoRecord,
    Weekend,
}

impl AttendanceStatus {
    /// Parses an upstream status string. Casing, spaces and dashes are
    /// normalized; anything unrecognized is treated as `NoRecord` so a bad
    /// payload degrades to a placeholder day instead of inventing clock data.
    pub fn from_wire(raw: &str) -> Self {
        let normalized: String = raw
            .trim()
            .chars()
            .map(|c| match c {
                ' ' | '-' => '_',
                c => c.to_ascii_lowercase(),
            })
            .collect();
        match normalized.as_str() {
            "present" => Self::Present,
            "absent" => Self::Absent,
            "late" => Self::Late,
            "half_day" => Self::HalfDay,
            "on_leave" | "leave" => Self::OnLeave,
            "holiday" => Self::Holiday,
            "no_record" | "" => Self::NoRecord,
            "weekend" => Self::Weekend,
            other => {
                tracing::warn!("Unknown attendance status '{}', treating as no-record", other);
                Self::NoRecord
            }
        }
    }

    pub fn wire_value(&self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
            Self::Late => "late",
            Self::HalfDay => "half_day",
            Self::OnLeave => "on_leave",
            Self::Holiday => "holiday",
            Self::NoRecord => "no_record",
            Self::Weekend => "weekend",
        }
    }

    /// True for statuses that carry no working time (time fields are hidden
    /// for these in the review views).
    pub fn is_non_work(&self) -> bool {
        NON_WORK_STATUSES.contains(self)
    }

    /// True for statuses eligible for batch finalization. Weekend and
    /// no-record days are skipped because the payroll truth source cannot
    /// stamp rows that have no attendance identifier.
    pub fn is_finalizable(&self) -> bool {
        !matches!(self, Self::Weekend | Self::NoRecord)
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Present => "Present",
            Self::Absent => "Absent",
            Self::Late => "Late",
            Self::HalfDay => "Half Day",
            Self::OnLeave => "On Leave",
            Self::Holiday => "Holiday",
            Self::NoRecord => "No Record",
            Self::Weekend => "Weekend",
        };
        f.write_str(label)
    }
}

/// Classification table for statuses that represent non-working days.
/// Single source of truth; consulted by the grid builder and the views.
pub static NON_WORK_STATUSES: Lazy<HashSet<AttendanceStatus>> = Lazy::new(|| {
    HashSet::from([
        AttendanceStatus::Absent,
        AttendanceStatus::OnLeave,
        AttendanceStatus::Holiday,
        AttendanceStatus::NoRecord,
        AttendanceStatus::Weekend,
    ])
});

// --- Correction request status ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    #[default]
    None,
    Pending,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn from_wire(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Self::Pending,
            "approved" => Self::Approved,
            "rejected" => Self::Rejected,
            _ => Self::None,
        }
    }
}

// --- Daily record ---

/// One calendar day of attendance state for one employee within a reviewed
/// month. Rebuilt from scratch on every grid rebuild; never persisted
/// client-side across rebuilds except through the override cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyRecord {
    pub date: NaiveDate,
    pub attendance_id: Option<AttendanceId>,
    pub original_check_in: Option<NaiveDateTime>,
    pub original_check_out: Option<NaiveDateTime>,
    pub original_status: AttendanceStatus,
    pub original_total_hours: Decimal,
    pub requested_check_in: Option<NaiveDateTime>,
    pub requested_check_out: Option<NaiveDateTime>,
    pub requested_status: Option<AttendanceStatus>,
    pub requested_notes: Option<String>,
    pub reason_for_edit: Option<String>,
    pub request_id: Option<RequestId>,
    pub request_status: RequestStatus,
    pub is_finalized: bool,
    /// Redundant with `request_status == Pending`; kept because older
    /// payload shapes carry only this flag.
    pub has_pending_request: bool,
    /// False for synthesized placeholder days with no source row.
    pub has_record: bool,
    pub is_weekend: bool,
}

impl DailyRecord {
    /// Synthesizes the placeholder for a day the source feed has no row for.
    pub fn placeholder(date: NaiveDate) -> Self {
        Self {
            date,
            attendance_id: None,
            original_check_in: None,
            original_check_out: None,
            original_status: AttendanceStatus::NoRecord,
            original_total_hours: Decimal::ZERO,
            requested_check_in: None,
            requested_check_out: None,
            requested_status: None,
            requested_notes: None,
            reason_for_edit: None,
            request_id: None,
            request_status: RequestStatus::None,
            is_finalized: false,
            has_pending_request: false,
            has_record: false,
            is_weekend: is_weekend(date),
        }
    }

    pub fn has_pending(&self) -> bool {
        self.request_status == RequestStatus::Pending || self.has_pending_request
    }

    /// Promotes the requested values into the original fields and clears the
    /// request. Only meaningful while a pending request is attached.
    pub fn promote_requested(&mut self) {
        if let Some(check_in) = self.requested_check_in.take() {
            self.original_check_in = Some(check_in);
        }
        if let Some(check_out) = self.requested_check_out.take() {
            self.original_check_out = Some(check_out);
        }
        if let Some(status) = self.requested_status.take() {
            self.original_status = status;
        }
        self.requested_notes = None;
        self.reason_for_edit = None;
        self.request_status = RequestStatus::Approved;
        self.has_pending_request = false;
    }

    /// Clears the requested values without touching the original fields.
    pub fn clear_requested(&mut self, outcome: RequestStatus) {
        self.requested_check_in = None;
        self.requested_check_out = None;
        self.requested_status = None;
        self.requested_notes = None;
        self.reason_for_edit = None;
        self.request_status = outcome;
        self.has_pending_request = false;
    }
}

pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

// --- Correction request ---

/// Employee-submitted proposal to change one day's recorded values.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionRequest {
    pub request_id: RequestId,
    pub attendance_id: Option<AttendanceId>,
    pub employee_id: EmployeeId,
    pub work_date: NaiveDate,
    pub requested_check_in: Option<NaiveDateTime>,
    pub requested_check_out: Option<NaiveDateTime>,
    pub requested_status: Option<AttendanceStatus>,
    pub requested_notes: Option<String>,
    pub reason_for_edit: String,
    pub status: RequestStatus,
}

// --- Manager override ---

/// Manager-initiated direct change to one day, bypassing the correction
/// workflow. `attendance_id` is None when the day has no attendance row yet
/// (e.g. turning an absence into a present day).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerOverride {
    pub attendance_id: Option<AttendanceId>,
    pub employee_id: EmployeeId,
    pub timesheet_id: TimesheetId,
    pub work_date: NaiveDate,
    pub check_in_time: Option<NaiveDateTime>,
    pub check_out_time: Option<NaiveDateTime>,
    pub status: Option<AttendanceStatus>,
    pub notes: Option<String>,
    pub reason: String,
}

// --- Finalization signal ---

/// The two partially-overlapping finalization signals for an employee-month:
/// what the server last reported, and what the grid derivation concluded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizedSignal {
    pub server_reported: Option<bool>,
    pub locally_derived: bool,
}

impl FinalizedSignal {
    /// Merge rule for the package-level flag: logical OR of both signals.
    /// Neither signal ever downgrades the other.
    pub fn resolve(&self) -> bool {
        self.server_reported.unwrap_or(false) || self.locally_derived
    }

    /// Feeds a fresh derivation in. `None` means the derivation had no
    /// eligible records and the previously known value stands.
    pub fn update_derived(&mut self, derived: Option<bool>) {
        if let Some(derived) = derived {
            self.locally_derived = self.locally_derived || derived;
        }
    }

    /// Records what the server reported on the last authoritative read.
    pub fn update_server(&mut self, reported: Option<bool>) {
        match (self.server_reported, reported) {
            // Never downgrade a confirmed true.
            (Some(true), _) => {}
            (_, Some(value)) => self.server_reported = Some(value),
            (_, None) => {}
        }
    }
}

// --- Employee review package ---

/// Aggregate for one employee within one month: the full ordered day grid
/// plus derived counters. Constructed per review session and discarded on
/// close.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmployeeReviewPackage {
    pub employee_id: EmployeeId,
    pub timesheet_id: TimesheetId,
    pub month: u32,
    pub year: i32,
    pub records: Vec<DailyRecord>,
    pub pending_request_count: usize,
    pub approved_count: usize,
    pub rejected_count: usize,
    pub finalized_count: usize,
    pub total_records: usize,
    pub non_work_count: usize,
    pub finalized: FinalizedSignal,
}

impl EmployeeReviewPackage {
    pub fn is_finalized(&self) -> bool {
        self.finalized.resolve()
    }

    pub fn record_for_date(&self, date: NaiveDate) -> Option<&DailyRecord> {
        self.records.iter().find(|r| r.date == date)
    }
}
