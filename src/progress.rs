//! Progress aggregation over raw backend counters.
//!
//! The backend reports flat counters (`estimated_effect_completed`,
//! `confidence_interval_completed`, `refute_completed`, `total_results`);
//! this module folds them into a single percentage and per-phase statuses,
//! honoring the phase ordering estimation -> confidence intervals (when
//! enabled) -> refutation.

use crate::model::{CheckStatus, PhaseStatus, RunStatus, RunTime, RuntimeStatus};
use time::OffsetDateTime;

const UNDEFINED_ERROR: &str = "Undefined error. Please, execute the run again.";

/// Percentage of `completed` over `total`, rounded to two decimals and
/// clamped to 100. Zero total means nothing is expected yet, so 0.
pub fn percentage(completed: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let pct = (100.0 * completed as f64) / total as f64;
    ((pct * 100.0).round() / 100.0).min(100.0)
}

/// Estimation always runs first and depends only on its own counter.
pub fn estimator_phase(status: &CheckStatus) -> PhaseStatus {
    let done = status.estimated_effect_completed.unwrap_or(0);
    let total = status.total_results.unwrap_or(0);
    if done != 0 && done == total {
        PhaseStatus::Completed
    } else {
        PhaseStatus::Running
    }
}

/// Confidence intervals run after estimation, so their phase only becomes
/// Running once estimation is done.
pub fn confidence_interval_phase(status: &CheckStatus, estimators: PhaseStatus) -> PhaseStatus {
    let done = status.confidence_interval_completed.unwrap_or(0);
    let total = status.total_results.unwrap_or(0);
    if done != 0 && done == total {
        PhaseStatus::Completed
    } else if estimators == PhaseStatus::Completed {
        PhaseStatus::Running
    } else {
        PhaseStatus::Idle
    }
}

/// Refutation runs last, after estimation and (when enabled) confidence
/// intervals. `refute_done` must already be divided by the refuter count.
pub fn refuter_phase(
    refute_done: u64,
    total: u64,
    estimators: PhaseStatus,
    confidence_intervals: PhaseStatus,
    has_confidence_interval: bool,
) -> PhaseStatus {
    let predecessor_done = if has_confidence_interval {
        confidence_intervals == PhaseStatus::Completed
    } else {
        estimators == PhaseStatus::Completed
    };
    if refute_done != 0 && refute_done == total {
        PhaseStatus::Completed
    } else if predecessor_done {
        PhaseStatus::Running
    } else {
        PhaseStatus::Idle
    }
}

/// Surface the failure cause when the backend reports `Failed`: a traceback
/// or error from the failed partial result if one exists, otherwise the
/// top-level output, the client-side failure note, or a generic message.
pub fn find_run_error(status: &CheckStatus) -> Option<String> {
    if status.status() != RuntimeStatus::Failed {
        return None;
    }
    let from_partial = status
        .partial_results
        .iter()
        .flatten()
        .find(|r| r.state == Some(RuntimeStatus::Failed))
        .and_then(|r| r.traceback.clone().or_else(|| r.error.clone()));
    Some(
        from_partial
            .or_else(|| {
                status
                    .output
                    .as_ref()
                    .and_then(|v| v.as_str().map(str::to_string))
            })
            .or_else(|| status.failure.as_ref().map(|note| note.to_string()))
            .unwrap_or_else(|| UNDEFINED_ERROR.to_string()),
    )
}

/// Fold a merged status payload into the UI-facing [`RunStatus`].
///
/// The raw refutation counter counts refuter sub-tasks; it is floor-divided
/// by `refuter_count` before any comparison so a partial refuter round never
/// counts as a completed result.
pub fn aggregate_status(
    status: &CheckStatus,
    has_confidence_interval: bool,
    refuter_count: u64,
    start: OffsetDateTime,
) -> RunStatus {
    let total = status.total_results.unwrap_or(1);
    let estimate_done = status.estimated_effect_completed.unwrap_or(0);
    let ci_done = status.confidence_interval_completed.unwrap_or(0);
    let refute_done = status.refute_completed.unwrap_or(0) / refuter_count.max(1);

    let estimators = estimator_phase(status);
    let confidence_intervals = confidence_interval_phase(status, estimators);
    let refuters = refuter_phase(
        refute_done,
        total,
        estimators,
        confidence_intervals,
        has_confidence_interval,
    );

    let mut pct = 100.0;
    if estimators != PhaseStatus::Completed {
        pct = percentage(estimate_done, total);
    } else if has_confidence_interval && confidence_intervals != PhaseStatus::Completed {
        pct = percentage(ci_done, total);
    } else if refuters != PhaseStatus::Completed {
        pct = percentage(refute_done, total);
    }

    let counters_known = status.total_results.is_some();
    RunStatus {
        status: status.status(),
        percentage: pct,
        error: find_run_error(status),
        estimated_effect_completed: counters_known
            .then(|| format!("{}/{}", estimate_done, total)),
        confidence_interval_completed: counters_known.then(|| format!("{}/{}", ci_done, total)),
        refute_completed: counters_known.then(|| format!("{}/{}", refute_done, total)),
        estimators,
        confidence_intervals,
        refuters,
        time: RunTime {
            start,
            end: Some(OffsetDateTime::now_utc()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FailureNote, PartialResult};
    use serde_json::json;

    fn counters(
        total: u64,
        estimate: u64,
        ci: u64,
        refute: u64,
        status: RuntimeStatus,
    ) -> CheckStatus {
        CheckStatus {
            runtime_status: Some(status),
            total_results: Some(total),
            estimated_effect_completed: Some(estimate),
            confidence_interval_completed: Some(ci),
            refute_completed: Some(refute),
            ..Default::default()
        }
    }

    #[test]
    fn percentage_edge_cases() {
        assert_eq!(percentage(5, 0), 0.0);
        assert_eq!(percentage(10, 100), 10.0);
        assert_eq!(percentage(150, 100), 100.0);
        assert_eq!(percentage(1, 3), 33.33);
    }

    #[test]
    fn estimation_is_never_idle() {
        let status = counters(10, 0, 0, 0, RuntimeStatus::Running);
        assert_eq!(estimator_phase(&status), PhaseStatus::Running);
        let status = counters(10, 10, 0, 0, RuntimeStatus::Running);
        assert_eq!(estimator_phase(&status), PhaseStatus::Completed);
    }

    #[test]
    fn missing_total_never_completes_a_phase() {
        // A transition tick can carry completed counters before the backend
        // has reported the total; that must not read as a finished phase.
        let status = CheckStatus {
            runtime_status: Some(RuntimeStatus::Running),
            estimated_effect_completed: Some(1),
            confidence_interval_completed: Some(1),
            ..Default::default()
        };
        assert_eq!(estimator_phase(&status), PhaseStatus::Running);
        assert_eq!(
            confidence_interval_phase(&status, PhaseStatus::Completed),
            PhaseStatus::Running
        );
        assert_eq!(
            confidence_interval_phase(&status, PhaseStatus::Running),
            PhaseStatus::Idle
        );
    }

    #[test]
    fn later_phases_stay_idle_until_predecessor_completes() {
        let status = counters(10, 4, 0, 0, RuntimeStatus::Running);
        let agg = aggregate_status(&status, true, 5, OffsetDateTime::now_utc());
        assert_eq!(agg.estimators, PhaseStatus::Running);
        assert_eq!(agg.confidence_intervals, PhaseStatus::Idle);
        assert_eq!(agg.refuters, PhaseStatus::Idle);
        assert_eq!(agg.percentage, 40.0);
    }

    #[test]
    fn confidence_intervals_run_after_estimation() {
        let status = counters(10, 10, 3, 0, RuntimeStatus::Running);
        let agg = aggregate_status(&status, true, 5, OffsetDateTime::now_utc());
        assert_eq!(agg.estimators, PhaseStatus::Completed);
        assert_eq!(agg.confidence_intervals, PhaseStatus::Running);
        assert_eq!(agg.refuters, PhaseStatus::Idle);
        assert_eq!(agg.percentage, 30.0);
    }

    #[test]
    fn refuters_follow_estimation_when_cis_disabled() {
        let status = counters(10, 10, 0, 25, RuntimeStatus::Running);
        let agg = aggregate_status(&status, false, 5, OffsetDateTime::now_utc());
        assert_eq!(agg.confidence_intervals, PhaseStatus::Idle);
        assert_eq!(agg.refuters, PhaseStatus::Running);
        // 25 sub-tasks over 5 refuters = 5 refuted results out of 10.
        assert_eq!(agg.percentage, 50.0);
        assert_eq!(agg.refute_completed.as_deref(), Some("5/10"));
    }

    #[test]
    fn partial_refuter_round_floors_down() {
        let status = counters(10, 10, 0, 49, RuntimeStatus::Running);
        let agg = aggregate_status(&status, false, 5, OffsetDateTime::now_utc());
        assert_eq!(agg.refuters, PhaseStatus::Running);
        assert_eq!(agg.refute_completed.as_deref(), Some("9/10"));
    }

    #[test]
    fn all_phases_complete_yields_full_percentage() {
        let status = counters(10, 10, 10, 50, RuntimeStatus::Completed);
        let agg = aggregate_status(&status, true, 5, OffsetDateTime::now_utc());
        assert_eq!(agg.estimators, PhaseStatus::Completed);
        assert_eq!(agg.confidence_intervals, PhaseStatus::Completed);
        assert_eq!(agg.refuters, PhaseStatus::Completed);
        assert_eq!(agg.percentage, 100.0);
        assert!(agg.error.is_none());
    }

    #[test]
    fn run_error_prefers_failed_partial_traceback() {
        let mut status = counters(10, 2, 0, 0, RuntimeStatus::Failed);
        status.partial_results = Some(vec![
            PartialResult {
                state: Some(RuntimeStatus::Completed),
                traceback: None,
                error: None,
                fields: Default::default(),
            },
            PartialResult {
                state: Some(RuntimeStatus::Failed),
                traceback: Some("ValueError: singular matrix".into()),
                error: Some("estimation failed".into()),
                fields: Default::default(),
            },
        ]);
        assert_eq!(
            find_run_error(&status).as_deref(),
            Some("ValueError: singular matrix")
        );
    }

    #[test]
    fn run_error_falls_back_to_output_then_note_then_generic() {
        let mut status = CheckStatus::failed(FailureNote::Transport("connection refused".into()));
        assert_eq!(
            find_run_error(&status).as_deref(),
            Some("backend unreachable: connection refused")
        );

        status.output = Some(json!("orchestrator raised"));
        assert_eq!(find_run_error(&status).as_deref(), Some("orchestrator raised"));

        let bare = CheckStatus {
            runtime_status: Some(RuntimeStatus::Failed),
            ..Default::default()
        };
        assert_eq!(find_run_error(&bare).as_deref(), Some(UNDEFINED_ERROR));
    }

    #[test]
    fn no_error_while_still_running() {
        let status = counters(10, 2, 0, 0, RuntimeStatus::Running);
        assert!(find_run_error(&status).is_none());
    }
}
