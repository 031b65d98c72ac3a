//! Effect-estimation run manager: dataset upload, payload assembly, and
//! folding poll ticks into the run history.

use std::path::Path;

use anyhow::{Context, Result};
use time::OffsetDateTime;
use tracing::info;

use crate::api::ApiClient;
use crate::history::RunHistory;
use crate::model::{
    CausalQuestion, CheckStatus, NodeResponse, PhaseStatus, RunHistoryEntry, RunStatus, RunTime,
    RuntimeStatus,
};
use crate::nodes::{build_estimate_node, build_load_node, NodeRequest};
use crate::progress::aggregate_status;

/// Placeholder id for an entry whose submission response has not arrived yet.
const PENDING_RUN_ID: &str = "0";

/// A fully assembled estimation job, ready to hand to the orchestrator.
pub struct PreparedEstimate {
    pub request: NodeRequest,
    pub spec_count: u64,
    pub file_name: String,
}

/// Upload the dataset, size the specification grid, and assemble the job
/// payload. Uploading rotates the client's session id; the caller should
/// persist the new one.
pub async fn prepare_estimate(
    client: &mut ApiClient,
    question: &CausalQuestion,
    dataset: &Path,
) -> Result<PreparedEstimate> {
    let file_name = dataset
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("invalid dataset path {}", dataset.display()))?
        .to_string();
    let bytes = tokio::fs::read(dataset)
        .await
        .with_context(|| format!("reading dataset {}", dataset.display()))?;

    let uploaded = client
        .upload_files(vec![(file_name.clone(), bytes)])
        .await
        .context("uploading dataset")?;
    let url = uploaded
        .get(&file_name)
        .with_context(|| format!("backend returned no upload URL for {file_name}"))?;

    // The dataframe keeps the file's stem; the load node references the
    // uploaded blob by its signed URL.
    let dataframe = file_name.split('.').next().unwrap_or(&file_name);
    let estimate = build_estimate_node(question, dataframe);
    let spec_count = client
        .execution_count(&estimate)
        .await
        .context("sizing the specification grid")?;
    info!(file_name, spec_count, "dataset uploaded");

    let request = build_load_node(url, &file_name).concat(estimate);
    Ok(PreparedEstimate {
        request,
        spec_count,
        file_name,
    })
}

/// Seed the history with a new active entry before submission. The entry
/// carries a placeholder id until the backend answers with an instance id.
pub fn initial_run_entry(
    history: &mut RunHistory,
    question: &CausalQuestion,
    spec_count: u64,
    session_id: &str,
) -> u32 {
    let run_number = history.next_run_number();
    history.upsert(RunHistoryEntry {
        id: PENDING_RUN_ID.to_string(),
        run_number,
        is_active: false,
        session_id: session_id.to_string(),
        status_url: None,
        status: RunStatus {
            status: RuntimeStatus::Running,
            percentage: 0.0,
            error: None,
            estimated_effect_completed: Some(format!("0/{spec_count}")),
            confidence_interval_completed: question
                .confidence_interval
                .then(|| format!("0/{spec_count}")),
            refute_completed: Some(format!("0/{spec_count}")),
            estimators: PhaseStatus::Running,
            confidence_intervals: PhaseStatus::Idle,
            refuters: PhaseStatus::Idle,
            time: RunTime {
                start: OffsetDateTime::now_utc(),
                end: None,
            },
        },
        spec_count,
        has_confidence_interval: question.confidence_interval,
        refutation_type: question.refutation_type,
    });
    history.set_default(PENDING_RUN_ID);
    run_number
}

/// Promote the pending entry once the backend acknowledges the submission.
/// Returns the run's real id.
pub fn on_estimate_started(
    history: &mut RunHistory,
    run_number: u32,
    response: &NodeResponse,
    session_id: &str,
) -> String {
    history.assign_response(run_number, response, session_id);
    response.id.clone()
}

/// Fold one merged poll tick into the stored run status.
pub fn on_estimate_update(
    history: &mut RunHistory,
    run_id: &str,
    status: &CheckStatus,
    question: &CausalQuestion,
) -> RunStatus {
    let start = history
        .find(run_id)
        .map(|entry| entry.status.time.start)
        .unwrap_or_else(OffsetDateTime::now_utc);
    let aggregated = aggregate_status(
        status,
        question.confidence_interval,
        question.refuter_count(),
        start,
    );
    history.update_status(run_id, aggregated.clone());
    aggregated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AlternativeModels, CausalityLevel, ElementDefinition, Estimator, EstimatorGroup,
        EstimatorType, RefutationType,
    };

    fn question() -> CausalQuestion {
        CausalQuestion {
            population: vec![ElementDefinition {
                level: CausalityLevel::Primary,
                variable: "All subjects".into(),
                column: "subject".into(),
            }],
            exposure: vec![ElementDefinition {
                level: CausalityLevel::Primary,
                variable: "Treated".into(),
                column: "treated".into(),
            }],
            outcome: vec![ElementDefinition {
                level: CausalityLevel::Primary,
                variable: "Recovered".into(),
                column: "recovered".into(),
            }],
            maximum_model: AlternativeModels::default(),
            minimum_model: AlternativeModels::default(),
            unadjusted_model: AlternativeModels::default(),
            estimators: vec![Estimator {
                group: EstimatorGroup::Exposure,
                estimator_type: EstimatorType::InversePropensityWeighting,
            }],
            refutation_type: RefutationType::QuickRefutation,
            confidence_interval: true,
        }
    }

    fn response() -> NodeResponse {
        NodeResponse {
            id: "abc-123".into(),
            status_query_get_uri: "http://functions/runtime/webhooks/status/abc-123".into(),
            terminate_post_uri: "http://functions/runtime/webhooks/terminate/abc-123".into(),
        }
    }

    #[test]
    fn initial_entry_is_active_with_zeroed_counters() {
        let mut history = RunHistory::new();
        let run_number = initial_run_entry(&mut history, &question(), 8, "session-a");
        assert_eq!(run_number, 1);

        let run = history.default_run().expect("active entry");
        assert_eq!(run.id, PENDING_RUN_ID);
        assert_eq!(run.status.status, RuntimeStatus::Running);
        assert_eq!(run.status.percentage, 0.0);
        assert_eq!(run.status.estimated_effect_completed.as_deref(), Some("0/8"));
        assert_eq!(
            run.status.confidence_interval_completed.as_deref(),
            Some("0/8")
        );
        assert!(history.is_processing());
    }

    #[test]
    fn started_event_promotes_the_placeholder_id() {
        let mut history = RunHistory::new();
        let run_number = initial_run_entry(&mut history, &question(), 8, "session-a");
        let run_id = on_estimate_started(&mut history, run_number, &response(), "session-b");

        assert_eq!(run_id, "abc-123");
        let run = history.default_run().expect("active entry");
        assert_eq!(run.id, "abc-123");
        assert_eq!(run.session_id, "session-b");
        assert!(run.status_url.is_some());
    }

    #[test]
    fn updates_preserve_the_original_start_time() {
        let mut history = RunHistory::new();
        let run_number = initial_run_entry(&mut history, &question(), 8, "session-a");
        on_estimate_started(&mut history, run_number, &response(), "session-a");
        let started = history.find("abc-123").unwrap().status.time.start;

        let tick = CheckStatus {
            runtime_status: Some(RuntimeStatus::Running),
            total_results: Some(8),
            estimated_effect_completed: Some(4),
            ..Default::default()
        };
        let status = on_estimate_update(&mut history, "abc-123", &tick, &question());

        assert_eq!(status.percentage, 50.0);
        let run = history.find("abc-123").unwrap();
        assert_eq!(run.status.time.start, started);
        assert_eq!(run.status.estimated_effect_completed.as_deref(), Some("4/8"));
    }
}
