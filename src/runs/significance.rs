//! Significance-test run manager.
//!
//! Tests are keyed by the owning run id plus an optional outcome name, so a
//! later run against a different outcome never clobbers earlier results.

use time::OffsetDateTime;

use crate::history::SignificanceTests;
use crate::model::{CheckStatus, NodeResponse, RuntimeStatus, SignificanceTest};

/// Seed the store with a pending entry at submission time.
pub fn initial_significance_entry(
    tests: &mut SignificanceTests,
    run_id: &str,
    outcome: Option<&str>,
) {
    tests.upsert(SignificanceTest {
        run_id: run_id.to_string(),
        outcome: outcome.map(str::to_string),
        status: RuntimeStatus::Pending,
        percentage: 0.0,
        simulation_completed: 0,
        total_simulations: 0,
        test_results: None,
        start_time: OffsetDateTime::now_utc(),
        status_url: None,
    });
}

/// Record the status webhook once the backend acknowledges the submission.
pub fn on_significance_started(
    tests: &mut SignificanceTests,
    run_id: &str,
    outcome: Option<&str>,
    response: &NodeResponse,
) {
    if let Some(mut entry) = tests.get(run_id, outcome).cloned() {
        entry.status = RuntimeStatus::Running;
        entry.status_url = Some(response.status_query_get_uri.clone());
        tests.upsert(entry);
    }
}

/// Fold one merged poll tick into the stored entry.
pub fn on_significance_update(
    tests: &mut SignificanceTests,
    run_id: &str,
    outcome: Option<&str>,
    status: &CheckStatus,
) {
    tests.apply_update(run_id, outcome, status);
}

/// Drop the entry for a canceled test. The backend job is already
/// terminated when this runs, so folding a `Terminated` tick keeps the
/// store in step with what a late poll would have reported.
pub fn on_significance_canceled(tests: &mut SignificanceTests, run_id: &str, outcome: Option<&str>) {
    let tick = CheckStatus {
        runtime_status: Some(RuntimeStatus::Terminated),
        ..Default::default()
    };
    tests.apply_update(run_id, outcome, &tick);
}

/// Mark a submission that never reached the backend.
pub fn on_significance_failed(tests: &mut SignificanceTests, run_id: &str, outcome: Option<&str>) {
    if let Some(mut entry) = tests.get(run_id, outcome).cloned() {
        entry.status = RuntimeStatus::Failed;
        tests.upsert(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response() -> NodeResponse {
        NodeResponse {
            id: "sig-1".into(),
            status_query_get_uri: "http://functions/runtime/webhooks/status/sig-1".into(),
            terminate_post_uri: "http://functions/runtime/webhooks/terminate/sig-1".into(),
        }
    }

    #[test]
    fn lifecycle_pending_running_completed() {
        let mut tests = SignificanceTests::new();
        initial_significance_entry(&mut tests, "run-1", Some("Recovered"));
        assert_eq!(
            tests.get("run-1", Some("Recovered")).unwrap().status,
            RuntimeStatus::Pending
        );

        on_significance_started(&mut tests, "run-1", Some("Recovered"), &response());
        let entry = tests.get("run-1", Some("Recovered")).unwrap();
        assert_eq!(entry.status, RuntimeStatus::Running);
        assert!(entry.status_url.is_some());

        let tick = CheckStatus {
            runtime_status: Some(RuntimeStatus::Completed),
            simulation_completed: Some(10),
            total_simulations: Some(10),
            ..Default::default()
        };
        on_significance_update(&mut tests, "run-1", Some("Recovered"), &tick);
        let entry = tests.get("run-1", Some("Recovered")).unwrap();
        assert_eq!(entry.status, RuntimeStatus::Completed);
        assert_eq!(entry.percentage, 100.0);
    }

    #[test]
    fn canceled_test_is_dropped_from_the_store() {
        let mut tests = SignificanceTests::new();
        initial_significance_entry(&mut tests, "run-1", Some("Recovered"));
        on_significance_started(&mut tests, "run-1", Some("Recovered"), &response());
        let tick = CheckStatus {
            runtime_status: Some(RuntimeStatus::Running),
            simulation_completed: Some(3),
            total_simulations: Some(10),
            ..Default::default()
        };
        on_significance_update(&mut tests, "run-1", Some("Recovered"), &tick);

        on_significance_canceled(&mut tests, "run-1", Some("Recovered"));
        assert!(tests.get("run-1", Some("Recovered")).is_none());
    }

    #[test]
    fn failed_submission_marks_the_entry() {
        let mut tests = SignificanceTests::new();
        initial_significance_entry(&mut tests, "run-1", None);
        on_significance_failed(&mut tests, "run-1", None);
        assert_eq!(
            tests.get("run-1", None).unwrap().status,
            RuntimeStatus::Failed
        );
    }
}
