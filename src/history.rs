//! Run history and significance-test state.
//!
//! Explicit state objects passed by reference; entries are created at
//! submission, updated on every poll tick, and never deleted, only marked
//! inactive. Significance tests are keyed by run id plus optional outcome.

use crate::model::{
    CheckStatus, NodeResponse, RunHistoryEntry, RunStatus, RuntimeStatus, SignificanceTest,
};
use crate::progress::percentage;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunHistory {
    entries: Vec<RunHistoryEntry>,
}

impl RunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[RunHistoryEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_run_number(&self) -> u32 {
        self.entries.len() as u32 + 1
    }

    /// The run the UI currently treats as active.
    pub fn default_run(&self) -> Option<&RunHistoryEntry> {
        self.entries.iter().find(|e| e.is_active)
    }

    /// Whether the active run is still being worked on by the backend.
    pub fn is_processing(&self) -> bool {
        self.default_run()
            .map(|run| run.status.status.is_processing())
            .unwrap_or(false)
    }

    pub fn find(&self, run_id: &str) -> Option<&RunHistoryEntry> {
        self.entries.iter().find(|e| e.id == run_id)
    }

    /// Insert or replace the entry with the same run number.
    pub fn upsert(&mut self, entry: RunHistoryEntry) {
        self.entries.retain(|e| e.run_number != entry.run_number);
        self.entries.push(entry);
    }

    /// Mark exactly one run active and all others inactive. Returns the
    /// newly active run's session id so the caller can restore it.
    pub fn set_default(&mut self, run_id: &str) -> Option<String> {
        let mut session_id = None;
        for entry in &mut self.entries {
            entry.is_active = entry.id == run_id;
            if entry.is_active {
                session_id = Some(entry.session_id.clone());
            }
        }
        session_id
    }

    /// Record the backend's submission response on the pending entry,
    /// promoting its placeholder id to the real instance id.
    pub fn assign_response(&mut self, run_number: u32, response: &NodeResponse, session_id: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.run_number == run_number) {
            entry.id = response.id.clone();
            entry.status_url = Some(response.status_query_get_uri.clone());
            entry.session_id = session_id.to_string();
        }
    }

    /// Replace a run's aggregated status, preserving its start time.
    pub fn update_status(&mut self, run_id: &str, mut status: RunStatus) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == run_id) {
            status.time.start = entry.status.time.start;
            entry.status = status;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignificanceTests {
    tests: Vec<SignificanceTest>,
}

impl SignificanceTests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, run_id: &str, outcome: Option<&str>) -> Option<&SignificanceTest> {
        self.tests
            .iter()
            .find(|t| t.run_id == run_id && t.outcome.as_deref() == outcome)
    }

    pub fn all(&self) -> &[SignificanceTest] {
        &self.tests
    }

    /// Insert or replace the entry for this run id + outcome.
    pub fn upsert(&mut self, test: SignificanceTest) {
        self.tests
            .retain(|t| !(t.run_id == test.run_id && t.outcome == test.outcome));
        self.tests.push(test);
    }

    pub fn remove(&mut self, run_id: &str, outcome: Option<&str>) {
        self.tests
            .retain(|t| !(t.run_id == run_id && t.outcome.as_deref() == outcome));
    }

    /// Fold a status tick into the stored entry.
    ///
    /// The update is a shallow, non-destructive merge: only fields present
    /// in the tick overwrite stored values, so folding an empty status is a
    /// no-op. A `Terminated` status drops the entry instead.
    pub fn apply_update(&mut self, run_id: &str, outcome: Option<&str>, status: &CheckStatus) {
        if status.runtime_status == Some(RuntimeStatus::Terminated) {
            self.remove(run_id, outcome);
            return;
        }
        let entry = match self
            .tests
            .iter_mut()
            .find(|t| t.run_id == run_id && t.outcome.as_deref() == outcome)
        {
            Some(entry) => entry,
            None => {
                self.tests.push(SignificanceTest {
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
                self.tests.last_mut().unwrap()
            }
        };
        if let Some(runtime) = &status.runtime_status {
            entry.status = runtime.clone();
        }
        if let Some(done) = status.simulation_completed {
            entry.simulation_completed = done;
        }
        if let Some(total) = status.total_simulations {
            entry.total_simulations = total;
        }
        if let Some(results) = &status.test_results {
            entry.test_results = Some(results.clone());
        }
        entry.percentage = percentage(entry.simulation_completed, entry.total_simulations.max(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PhaseStatus, RunTime};
    use serde_json::json;

    fn entry(id: &str, run_number: u32, is_active: bool) -> RunHistoryEntry {
        RunHistoryEntry {
            id: id.to_string(),
            run_number,
            is_active,
            session_id: format!("session-{run_number}"),
            status_url: None,
            status: RunStatus {
                status: RuntimeStatus::Running,
                percentage: 0.0,
                error: None,
                estimated_effect_completed: None,
                confidence_interval_completed: None,
                refute_completed: None,
                estimators: PhaseStatus::Running,
                confidence_intervals: PhaseStatus::Idle,
                refuters: PhaseStatus::Idle,
                time: RunTime {
                    start: OffsetDateTime::now_utc(),
                    end: None,
                },
            },
            spec_count: 10,
            has_confidence_interval: false,
            refutation_type: Default::default(),
        }
    }

    #[test]
    fn set_default_marks_exactly_one_active() {
        let mut history = RunHistory::new();
        history.upsert(entry("a", 1, true));
        history.upsert(entry("b", 2, false));
        history.upsert(entry("c", 3, false));

        let session = history.set_default("b");
        assert_eq!(session.as_deref(), Some("session-2"));
        let active: Vec<_> = history
            .entries()
            .iter()
            .filter(|e| e.is_active)
            .map(|e| e.id.as_str())
            .collect();
        assert_eq!(active, vec!["b"]);
        assert_eq!(history.default_run().unwrap().id, "b");
    }

    #[test]
    fn assign_response_promotes_placeholder_entry() {
        let mut history = RunHistory::new();
        history.upsert(entry("0", 1, true));
        let response = NodeResponse {
            id: "inst-9".into(),
            status_query_get_uri: "http://functions/status".into(),
            terminate_post_uri: "http://functions/terminate".into(),
        };
        history.assign_response(1, &response, "session-new");
        let run = history.default_run().unwrap();
        assert_eq!(run.id, "inst-9");
        assert_eq!(run.session_id, "session-new");
        assert_eq!(run.status_url.as_deref(), Some("http://functions/status"));
    }

    #[test]
    fn is_processing_reflects_active_run_only() {
        let mut history = RunHistory::new();
        assert!(!history.is_processing());
        let mut done = entry("a", 1, false);
        done.status.status = RuntimeStatus::Completed;
        history.upsert(done);
        history.upsert(entry("b", 2, true));
        assert!(history.is_processing());
        history.set_default("a");
        assert!(!history.is_processing());
    }

    #[test]
    fn significance_update_is_non_destructive() {
        let mut tests = SignificanceTests::new();
        tests.apply_update(
            "run-1",
            None,
            &CheckStatus {
                runtime_status: Some(RuntimeStatus::Running),
                simulation_completed: Some(20),
                total_simulations: Some(100),
                ..Default::default()
            },
        );
        // A tick carrying only new results must keep prior counters.
        tests.apply_update(
            "run-1",
            None,
            &CheckStatus {
                test_results: Some(json!({"p_value": 0.02})),
                ..Default::default()
            },
        );
        let test = tests.get("run-1", None).unwrap();
        assert_eq!(test.simulation_completed, 20);
        assert_eq!(test.total_simulations, 100);
        assert_eq!(test.status, RuntimeStatus::Running);
        assert_eq!(test.percentage, 20.0);
        assert_eq!(test.test_results, Some(json!({"p_value": 0.02})));
    }

    #[test]
    fn empty_update_is_identity() {
        let mut tests = SignificanceTests::new();
        tests.apply_update(
            "run-1",
            None,
            &CheckStatus {
                runtime_status: Some(RuntimeStatus::Running),
                simulation_completed: Some(5),
                total_simulations: Some(10),
                ..Default::default()
            },
        );
        let before = tests.get("run-1", None).unwrap().clone();
        tests.apply_update("run-1", None, &CheckStatus::default());
        let after = tests.get("run-1", None).unwrap();
        assert_eq!(after.simulation_completed, before.simulation_completed);
        assert_eq!(after.total_simulations, before.total_simulations);
        assert_eq!(after.status, before.status);
        assert_eq!(after.percentage, before.percentage);
    }

    #[test]
    fn terminated_run_drops_its_entry() {
        let mut tests = SignificanceTests::new();
        tests.apply_update(
            "run-1",
            None,
            &CheckStatus {
                runtime_status: Some(RuntimeStatus::Running),
                ..Default::default()
            },
        );
        tests.apply_update(
            "run-1",
            None,
            &CheckStatus {
                runtime_status: Some(RuntimeStatus::Terminated),
                ..Default::default()
            },
        );
        assert!(tests.get("run-1", None).is_none());
    }

    #[test]
    fn outcomes_key_separate_entries() {
        let mut tests = SignificanceTests::new();
        for outcome in ["cancer", "mortality"] {
            tests.apply_update(
                "run-1",
                Some(outcome),
                &CheckStatus {
                    runtime_status: Some(RuntimeStatus::Running),
                    ..Default::default()
                },
            );
        }
        assert!(tests.get("run-1", Some("cancer")).is_some());
        assert!(tests.get("run-1", Some("mortality")).is_some());
        assert_eq!(tests.all().len(), 2);
        tests.remove("run-1", Some("cancer"));
        assert_eq!(tests.all().len(), 1);
    }
}
