// src/actions_tests.rs

#[cfg(test)]
mod tests {
    use crate::actions::*;
    use crate::grid::GridError;
    use crate::hr_api::*;
    use crate::model::*;
    use async_trait::async_trait;
    use chrono::{NaiveDate, NaiveDateTime};
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    fn timestamp(raw: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S").unwrap()
    }

    fn raw_row(work_date: &str, status: &str) -> RawDailyRow {
        RawDailyRow {
            attendance_id: Some(format!("att-{}", work_date)),
            work_date: work_date.to_string(),
            status: Some(status.to_string()),
            total_hours: Some(8.0),
            ..Default::default()
        }
    }

    fn base_review() -> ReviewPackageResponse {
        ReviewPackageResponse {
            employee_id: "emp-1".to_string(),
            timesheet_id: "ts-1".to_string(),
            month: Some(2),
            year: Some(2026),
            is_finalized: Some(false),
            records: vec![
                raw_row("2026-02-02", "present"),
                raw_row("2026-02-03", "absent"),
            ],
        }
    }

    // In-memory stand-in for the HR backend. Writes mutate its stored feeds
    // the way the real backend would, except overrides, whose read path is
    // deliberately left lagging to exercise the optimistic cache.
    struct MockBackend {
        calls: Mutex<Vec<String>>,
        review: Mutex<ReviewPackageResponse>,
        submissions: Mutex<Vec<SubmissionPackage>>,
        fail_review: AtomicBool,
        fail_submissions: AtomicBool,
        review_delay_ms: AtomicU64,
        finalize_delay_ms: AtomicU64,
        next_request_id: AtomicUsize,
    }

    impl MockBackend {
        fn new(review: ReviewPackageResponse) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                review: Mutex::new(review),
                submissions: Mutex::new(Vec::new()),
                fail_review: AtomicBool::new(false),
                fail_submissions: AtomicBool::new(false),
                review_delay_ms: AtomicU64::new(0),
                finalize_delay_ms: AtomicU64::new(0),
                next_request_id: AtomicUsize::new(0),
            })
        }

        fn record(&self, name: &str) {
            self.calls.lock().unwrap().push(name.to_string());
        }

        fn calls_of(&self, name: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| *c == name)
                .count()
        }

        fn seed_correction(&self, request_id: &str, work_date: &str, check_in: &str) {
            let correction = RawCorrection {
                request_id: request_id.to_string(),
                attendance_id: None,
                employee_id: Some("emp-1".to_string()),
                work_date: work_date.to_string(),
                requested_check_in: Some(check_in.to_string()),
                requested_status: Some("present".to_string()),
                reason_for_edit: Some("Forgot to clock in that morning".to_string()),
                status: Some("pending".to_string()),
                ..Default::default()
            };
            let mut submissions = self.submissions.lock().unwrap();
            match submissions.iter_mut().find(|p| p.employee_id == "emp-1") {
                Some(package) => package.corrections.push(correction),
                None => submissions.push(SubmissionPackage {
                    employee_id: "emp-1".to_string(),
                    timesheet_id: Some("ts-1".to_string()),
                    corrections: vec![correction],
                }),
            }
        }
    }

    #[async_trait]
    impl ReviewBackend for MockBackend {
        async fn fetch_review_package(
            &self,
            _timesheet_id: &str,
            _employee_id: &str,
        ) -> Result<ReviewPackageResponse, HrApiError> {
            self.record("fetch_review_package");
            let delay = self.review_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.fail_review.load(Ordering::SeqCst) {
                return Err(HrApiError::RateLimitExceeded);
            }
            Ok(self.review.lock().unwrap().clone())
        }

        async fn fetch_submission_packages(&self) -> Result<Vec<SubmissionPackage>, HrApiError> {
            self.record("fetch_submission_packages");
            if self.fail_submissions.load(Ordering::SeqCst) {
                return Err(HrApiError::RateLimitExceeded);
            }
            Ok(self.submissions.lock().unwrap().clone())
        }

        async fn submit_correction(
            &self,
            request: &SubmitCorrectionRequest,
        ) -> Result<SubmitCorrectionResponse, HrApiError> {
            self.record("submit_correction");
            let id = format!(
                "req-{}",
                self.next_request_id.fetch_add(1, Ordering::SeqCst) + 1
            );
            let correction = RawCorrection {
                request_id: id.clone(),
                attendance_id: None,
                employee_id: Some(request.employee_id.clone()),
                work_date: request.work_date.to_string(),
                requested_check_in: request
                    .requested_check_in
                    .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string()),
                requested_check_out: request
                    .requested_check_out
                    .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string()),
                requested_status: request.requested_status.map(|s| s.wire_value().to_string()),
                requested_notes: request.requested_notes.clone(),
                reason_for_edit: Some(request.reason_for_edit.clone()),
                status: Some("pending".to_string()),
            };
            let mut submissions = self.submissions.lock().unwrap();
            match submissions
                .iter_mut()
                .find(|p| p.employee_id == request.employee_id)
            {
                Some(package) => package.corrections.push(correction),
                None => submissions.push(SubmissionPackage {
                    employee_id: request.employee_id.clone(),
                    timesheet_id: Some("ts-1".to_string()),
                    corrections: vec![correction],
                }),
            }
            Ok(SubmitCorrectionResponse { request_id: id })
        }

        async fn process_correction(
            &self,
            request: &ProcessCorrectionRequest,
        ) -> Result<(), HrApiError> {
            self.record("process_correction");
            let correction = {
                let mut submissions = self.submissions.lock().unwrap();
                let mut found = None;
                for package in submissions.iter_mut() {
                    if let Some(pos) = package
                        .corrections
                        .iter()
                        .position(|c| c.request_id == request.request_id)
                    {
                        found = Some(package.corrections.remove(pos));
                        break;
                    }
                }
                found
            };
            if let Some(correction) = correction {
                let mut review = self.review.lock().unwrap();
                if let Some(row) = review
                    .records
                    .iter_mut()
                    .find(|r| r.work_date == correction.work_date)
                {
                    row.request_id = Some(request.request_id.clone());
                    if request.approve {
                        if correction.requested_check_in.is_some() {
                            row.check_in_time = correction.requested_check_in.clone();
                        }
                        if correction.requested_check_out.is_some() {
                            row.check_out_time = correction.requested_check_out.clone();
                        }
                        if correction.requested_status.is_some() {
                            row.status = correction.requested_status.clone();
                        }
                        row.request_status = Some("approved".to_string());
                    } else {
                        row.request_status = Some("rejected".to_string());
                    }
                }
            }
            Ok(())
        }

        async fn apply_override(
            &self,
            request: &ManagerOverride,
        ) -> Result<OverrideResponse, HrApiError> {
            self.record("apply_override");
            // The read feed is intentionally not updated here.
            Ok(OverrideResponse {
                attendance_id: request.attendance_id.clone(),
                check_in_time: request
                    .check_in_time
                    .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string()),
                check_out_time: request
                    .check_out_time
                    .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string()),
                status: request.status.map(|s| s.wire_value().to_string()),
            })
        }

        async fn finalize_employee(
            &self,
            _timesheet_id: &str,
            _employee_id: &str,
        ) -> Result<FinalizeResponse, HrApiError> {
            self.record("finalize_employee");
            let delay = self.finalize_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            let mut review = self.review.lock().unwrap();
            let mut finalized_count = 0;
            for row in review.records.iter_mut() {
                row.is_finalized = Some(true);
                finalized_count += 1;
            }
            review.is_finalized = Some(true);
            Ok(FinalizeResponse { finalized_count })
        }
    }

    fn open_session(mock: &Arc<MockBackend>, is_manager: bool) -> ReviewSession {
        ReviewSession::new(
            mock.clone() as Arc<dyn ReviewBackend>,
            "ts-1",
            "emp-1",
            is_manager,
        )
    }

    // --- Loading ---

    #[tokio::test]
    async fn test_load_builds_package_and_merges_corrections() {
        let mock = MockBackend::new(base_review());
        mock.seed_correction("req-5", "2026-02-02", "2026-02-02T08:00:00");
        let session = open_session(&mock, false);

        let package = session.load(None).await.unwrap();

        assert_eq!(package.records.len(), 28);
        assert_eq!(package.pending_request_count, 1);
        let day_2 = package.record_for_date(date(2026, 2, 2)).unwrap();
        assert_eq!(day_2.request_id.as_deref(), Some("req-5"));
        assert!(day_2.has_pending());
    }

    #[tokio::test]
    async fn test_load_degrades_without_submission_feed() {
        let mock = MockBackend::new(base_review());
        mock.seed_correction("req-5", "2026-02-02", "2026-02-02T08:00:00");
        mock.fail_submissions.store(true, Ordering::SeqCst);
        let session = open_session(&mock, false);

        let package = session.load(None).await.unwrap();

        assert_eq!(package.records.len(), 28, "Grid builds without annotations");
        assert_eq!(package.pending_request_count, 0);
    }

    #[tokio::test]
    async fn test_load_falls_back_to_previous_package() {
        let mock = MockBackend::new(base_review());
        let session = open_session(&mock, false);
        session.load(None).await.unwrap();

        mock.fail_review.store(true, Ordering::SeqCst);
        let package = session.load(None).await.unwrap();

        assert_eq!(
            package.records.len(),
            28,
            "Failed reload keeps the previous package"
        );
    }

    #[tokio::test]
    async fn test_load_without_fallback_surfaces_error() {
        let mock = MockBackend::new(base_review());
        mock.fail_review.store(true, Ordering::SeqCst);
        let session = open_session(&mock, false);

        let result = session.load(None).await;
        assert!(matches!(
            result,
            Err(ActionError::Grid(GridError::NoFallback(_)))
        ));
    }

    // --- Correction submission ---

    #[tokio::test]
    async fn test_submit_correction_marks_day_pending() {
        let mock = MockBackend::new(base_review());
        let session = open_session(&mock, false);
        session.load(None).await.unwrap();

        let request_id = session
            .submit_correction(SubmitCorrectionRequest {
                employee_id: "emp-1".to_string(),
                work_date: date(2026, 2, 3),
                requested_check_in: Some(timestamp("2026-02-03T08:00:00")),
                requested_check_out: Some(timestamp("2026-02-03T16:00:00")),
                requested_status: Some(AttendanceStatus::Present),
                reason_for_edit: "Was on site, badge reader was down".to_string(),
                requested_notes: None,
            })
            .await
            .unwrap();

        assert_eq!(request_id, "req-1");
        assert_eq!(mock.calls_of("submit_correction"), 1);

        let package = session.package().await.unwrap();
        let day_3 = package.record_for_date(date(2026, 2, 3)).unwrap();
        assert_eq!(day_3.request_status, RequestStatus::Pending);
        assert!(day_3.has_pending());
        assert_eq!(package.pending_request_count, 1);
    }

    #[tokio::test]
    async fn test_submit_correction_rejects_short_reason() {
        let mock = MockBackend::new(base_review());
        let session = open_session(&mock, false);
        session.load(None).await.unwrap();

        let result = session
            .submit_correction(SubmitCorrectionRequest {
                employee_id: "emp-1".to_string(),
                work_date: date(2026, 2, 3),
                requested_check_in: None,
                requested_check_out: None,
                requested_status: Some(AttendanceStatus::Present),
                reason_for_edit: "typo".to_string(),
                requested_notes: None,
            })
            .await;

        assert!(matches!(result, Err(ActionError::ReasonTooShort { min: 10 })));
        assert_eq!(
            mock.calls_of("submit_correction"),
            0,
            "Validation failures never reach the backend"
        );
    }

    #[tokio::test]
    async fn test_submit_correction_blocked_on_finalized_record() {
        let mut review = base_review();
        review.records[0].is_finalized = Some(true);
        let mock = MockBackend::new(review);
        let session = open_session(&mock, false);
        session.load(None).await.unwrap();

        let result = session
            .submit_correction(SubmitCorrectionRequest {
                employee_id: "emp-1".to_string(),
                work_date: date(2026, 2, 2),
                requested_check_in: None,
                requested_check_out: None,
                requested_status: Some(AttendanceStatus::Present),
                reason_for_edit: "Adjusting a closed day".to_string(),
                requested_notes: None,
            })
            .await;

        assert!(matches!(result, Err(ActionError::RecordFinalized { .. })));
        assert_eq!(mock.calls_of("submit_correction"), 0);
    }

    // --- Approve / reject ---

    #[tokio::test]
    async fn test_approve_promotes_requested_values() {
        let mock = MockBackend::new(base_review());
        mock.seed_correction("req-5", "2026-02-03", "2026-02-03T08:00:00");
        let session = open_session(&mock, true);
        session.load(None).await.unwrap();

        session.approve("req-5").await.unwrap();

        let package = session.package().await.unwrap();
        let day_3 = package.record_for_date(date(2026, 2, 3)).unwrap();
        assert_eq!(day_3.original_status, AttendanceStatus::Present);
        assert_eq!(
            day_3.original_check_in,
            Some(timestamp("2026-02-03T08:00:00"))
        );
        assert_eq!(day_3.request_status, RequestStatus::Approved);
        assert!(!day_3.has_pending());
        assert_eq!(package.pending_request_count, 0);
        assert_eq!(package.approved_count, 1);
    }

    #[tokio::test]
    async fn test_reject_requires_reason_and_keeps_originals() {
        let mock = MockBackend::new(base_review());
        mock.seed_correction("req-5", "2026-02-03", "2026-02-03T09:00:00");
        let session = open_session(&mock, true);
        session.load(None).await.unwrap();

        let result = session.reject("req-5", "no").await;
        assert!(matches!(result, Err(ActionError::ReasonTooShort { .. })));
        assert_eq!(mock.calls_of("process_correction"), 0);

        session
            .reject("req-5", "Badge log shows no entry that day")
            .await
            .unwrap();

        let package = session.package().await.unwrap();
        let day_3 = package.record_for_date(date(2026, 2, 3)).unwrap();
        assert_eq!(
            day_3.original_status,
            AttendanceStatus::Absent,
            "Rejection never touches the original values"
        );
        assert!(day_3.original_check_in.is_none());
        assert_eq!(day_3.request_status, RequestStatus::Rejected);
        assert_eq!(package.pending_request_count, 0);
        assert_eq!(package.rejected_count, 1);
    }

    #[tokio::test]
    async fn test_process_requires_manager() {
        let mock = MockBackend::new(base_review());
        mock.seed_correction("req-5", "2026-02-03", "2026-02-03T08:00:00");
        let session = open_session(&mock, false);
        session.load(None).await.unwrap();

        let result = session.approve("req-5").await;
        assert!(matches!(result, Err(ActionError::NotManager)));
        assert_eq!(mock.calls_of("process_correction"), 0);
    }

    #[tokio::test]
    async fn test_process_unknown_request_id() {
        let mock = MockBackend::new(base_review());
        let session = open_session(&mock, true);
        session.load(None).await.unwrap();

        let result = session.approve("req-missing").await;
        assert!(matches!(result, Err(ActionError::NoPendingRequest { .. })));
    }

    // --- Manager override ---

    fn override_request(work_date: NaiveDate) -> ManagerOverride {
        ManagerOverride {
            attendance_id: None,
            employee_id: "emp-1".to_string(),
            timesheet_id: "ts-1".to_string(),
            work_date,
            check_in_time: Some(timestamp("2026-02-03T09:00:00")),
            check_out_time: Some(timestamp("2026-02-03T17:00:00")),
            status: Some(AttendanceStatus::Present),
            notes: None,
            reason: "Employee attended an offsite visit".to_string(),
        }
    }

    #[tokio::test]
    async fn test_override_survives_lagging_reload() {
        let mock = MockBackend::new(base_review());
        let session = open_session(&mock, true);
        session.load(None).await.unwrap();

        // The mock never updates its read feed, so the internal post-write
        // reload comes back with the stale absent day.
        session
            .apply_override(override_request(date(2026, 2, 3)))
            .await
            .unwrap();

        let package = session.package().await.unwrap();
        let day_3 = package.record_for_date(date(2026, 2, 3)).unwrap();
        assert_eq!(day_3.original_status, AttendanceStatus::Present);
        assert_eq!(
            day_3.original_check_in,
            Some(timestamp("2026-02-03T09:00:00"))
        );
        assert!(day_3.is_finalized, "Overridden day presents as locked");

        // And again across an explicit reload.
        session.load(None).await.unwrap();
        let package = session.package().await.unwrap();
        let day_3 = package.record_for_date(date(2026, 2, 3)).unwrap();
        assert_eq!(day_3.original_status, AttendanceStatus::Present);
    }

    #[tokio::test]
    async fn test_override_requires_manager() {
        let mock = MockBackend::new(base_review());
        let session = open_session(&mock, false);
        session.load(None).await.unwrap();

        let result = session.apply_override(override_request(date(2026, 2, 3))).await;
        assert!(matches!(result, Err(ActionError::NotManager)));
        assert_eq!(mock.calls_of("apply_override"), 0);
    }

    // --- Batch finalize ---

    #[tokio::test]
    async fn test_finalize_blocked_while_pending() {
        let mock = MockBackend::new(base_review());
        mock.seed_correction("req-5", "2026-02-02", "2026-02-02T08:00:00");
        let session = open_session(&mock, true);
        session.load(None).await.unwrap();

        let result = session.finalize_employee().await;
        assert!(matches!(
            result,
            Err(ActionError::PendingRequestsRemain { pending: 1 })
        ));
        assert_eq!(
            mock.calls_of("finalize_employee"),
            0,
            "The gate fires before any network call"
        );
    }

    #[tokio::test]
    async fn test_finalize_locks_records_and_package() {
        let mock = MockBackend::new(base_review());
        let session = open_session(&mock, true);
        session.load(None).await.unwrap();

        let finalized_count = session.finalize_employee().await.unwrap();
        assert_eq!(finalized_count, 2);

        let package = session.package().await.unwrap();
        assert!(package.is_finalized());
        let day_2 = package.record_for_date(date(2026, 2, 2)).unwrap();
        assert!(day_2.is_finalized);

        let result = session.finalize_employee().await;
        assert!(
            matches!(result, Err(ActionError::PackageFinalized)),
            "A finalized month cannot be finalized twice"
        );
    }

    #[tokio::test]
    async fn test_finalize_rejects_concurrent_attempt() {
        let mock = MockBackend::new(base_review());
        mock.finalize_delay_ms.store(200, Ordering::SeqCst);
        let session = open_session(&mock, true);
        session.load(None).await.unwrap();

        let (first, second) =
            tokio::join!(session.finalize_employee(), session.finalize_employee());

        let in_flight = [&first, &second]
            .iter()
            .filter(|r| matches!(r, Err(ActionError::PackageInFlight { .. })))
            .count();
        assert_eq!(in_flight, 1, "Exactly one attempt hits the in-flight marker");
        assert!(first.is_ok() || second.is_ok());
        assert_eq!(mock.calls_of("finalize_employee"), 1);
    }

    // --- Teardown ---

    #[tokio::test]
    async fn test_load_racing_close_never_lands() {
        let mock = MockBackend::new(base_review());
        mock.review_delay_ms.store(200, Ordering::SeqCst);
        let session = Arc::new(open_session(&mock, false));

        let slow_load = tokio::spawn({
            let session = session.clone();
            async move { session.load(None).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.close().await;

        let result = slow_load.await.unwrap();
        assert!(matches!(result, Err(ActionError::SessionClosed)));
        assert!(
            session.package().await.is_none(),
            "A load that raced the close must not populate the session"
        );
    }

    #[tokio::test]
    async fn test_superseded_load_discards_its_result() {
        let mock = MockBackend::new(base_review());
        mock.review_delay_ms.store(200, Ordering::SeqCst);
        let session = Arc::new(open_session(&mock, false));

        let slow_load = tokio::spawn({
            let session = session.clone();
            async move { session.load(None).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A newer load started after the slow one; give it fresher data so
        // the surviving grid is distinguishable.
        mock.review_delay_ms.store(0, Ordering::SeqCst);
        mock.review
            .lock()
            .unwrap()
            .records
            .push(raw_row("2026-02-04", "late"));
        let fresh = session.load(None).await.unwrap();
        assert_eq!(fresh.total_records, 3);

        let result = slow_load.await.unwrap();
        assert!(matches!(result, Err(ActionError::LoadSuperseded)));

        let package = session.package().await.unwrap();
        assert_eq!(
            package.total_records, 3,
            "The newer load's grid stands; the stale result is discarded"
        );
    }

    #[tokio::test]
    async fn test_close_blocks_further_actions() {
        let mock = MockBackend::new(base_review());
        let session = open_session(&mock, true);
        session.load(None).await.unwrap();

        session.close().await;

        let result = session.load(None).await;
        assert!(matches!(result, Err(ActionError::SessionClosed)));

        let result = session
            .submit_correction(SubmitCorrectionRequest {
                employee_id: "emp-1".to_string(),
                work_date: date(2026, 2, 3),
                requested_check_in: None,
                requested_check_out: None,
                requested_status: Some(AttendanceStatus::Present),
                reason_for_edit: "Late submission after closing".to_string(),
                requested_notes: None,
            })
            .await;
        assert!(matches!(result, Err(ActionError::SessionClosed)));
    }
}
