//! Text summary builder for CLI output.
//!
//! This module formats human-readable lines for run history and
//! significance-test state.

use crate::model::{PhaseStatus, RunHistoryEntry, SignificanceTest};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

fn phase_label(phase: PhaseStatus) -> &'static str {
    match phase {
        PhaseStatus::Idle => "idle",
        PhaseStatus::Running => "running",
        PhaseStatus::Completed => "completed",
    }
}

/// One-line progress report for a live poll tick.
pub(crate) fn progress_line(run: &RunHistoryEntry) -> String {
    let status = &run.status;
    let mut line = format!(
        "Run #{}: {} {:.2}%",
        run.run_number,
        status.status.as_str(),
        status.percentage
    );
    if let Some(counter) = status.estimated_effect_completed.as_deref() {
        line.push_str(&format!(" | estimators {counter}"));
    }
    if run.has_confidence_interval {
        if let Some(counter) = status.confidence_interval_completed.as_deref() {
            line.push_str(&format!(" | confidence intervals {counter}"));
        }
    }
    if let Some(counter) = status.refute_completed.as_deref() {
        line.push_str(&format!(" | refuters {counter}"));
    }
    line
}

/// Build a text summary for one run history entry.
pub(crate) fn build_run_summary(run: &RunHistoryEntry) -> TextSummary {
    let mut lines = Vec::new();
    let status = &run.status;

    let marker = if run.is_active { " (default)" } else { "" };
    lines.push(format!("Run #{} [{}]{marker}", run.run_number, run.id));
    lines.push(format!(
        "Status: {} ({:.2}%), {} specifications",
        status.status.as_str(),
        status.percentage,
        run.spec_count
    ));
    lines.push(format!(
        "Estimators: {} [{}]",
        status.estimated_effect_completed.as_deref().unwrap_or("-"),
        phase_label(status.estimators)
    ));
    if run.has_confidence_interval {
        lines.push(format!(
            "Confidence intervals: {} [{}]",
            status
                .confidence_interval_completed
                .as_deref()
                .unwrap_or("-"),
            phase_label(status.confidence_intervals)
        ));
    }
    lines.push(format!(
        "Refuters: {} [{}]",
        status.refute_completed.as_deref().unwrap_or("-"),
        phase_label(status.refuters)
    ));
    if let Some(error) = status.error.as_deref() {
        lines.push(format!("Error: {error}"));
    }

    TextSummary { lines }
}

/// Build a text summary for one significance test.
pub(crate) fn build_significance_summary(test: &SignificanceTest) -> TextSummary {
    let mut lines = Vec::new();

    let outcome = test.outcome.as_deref().unwrap_or("-");
    lines.push(format!(
        "Significance test for run {} (outcome: {outcome})",
        test.run_id
    ));
    lines.push(format!(
        "Status: {} ({:.2}%), simulations {}/{}",
        test.status.as_str(),
        test.percentage,
        test.simulation_completed,
        test.total_simulations
    ));
    if let Some(results) = test.test_results.as_ref() {
        lines.push(format!("Results: {results}"));
    }

    TextSummary { lines }
}
