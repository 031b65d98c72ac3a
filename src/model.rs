use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::time::Duration;
use time::OffsetDateTime;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub base_url: String,
    #[serde(default)]
    pub keys: ApiKeys,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(3000)
}

/// Per-endpoint function keys for the compute backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiKeys {
    #[serde(default)]
    pub orchestrators: String,
    #[serde(default)]
    pub executions: String,
    #[serde(default)]
    pub upload: String,
    #[serde(default)]
    pub download: String,
    #[serde(default)]
    pub check_status: String,
    #[serde(default)]
    pub check_significance_status: String,
}

/// Which domain status endpoint a poll should hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Estimate,
    Significance,
}

/// Runtime status reported by the orchestration backend.
///
/// The backend is not consistent about casing ("Running" vs "running"), so
/// parsing is case-insensitive and unrecognized values are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeStatus {
    Pending,
    Running,
    Processing,
    InProgress,
    Completed,
    Failed,
    Terminated,
    Other(String),
}

impl RuntimeStatus {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "pending" => RuntimeStatus::Pending,
            "running" => RuntimeStatus::Running,
            "processing" => RuntimeStatus::Processing,
            "inprogress" | "in_progress" => RuntimeStatus::InProgress,
            "completed" => RuntimeStatus::Completed,
            "failed" => RuntimeStatus::Failed,
            "terminated" => RuntimeStatus::Terminated,
            _ => RuntimeStatus::Other(s.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RuntimeStatus::Pending => "Pending",
            RuntimeStatus::Running => "Running",
            RuntimeStatus::Processing => "Processing",
            RuntimeStatus::InProgress => "InProgress",
            RuntimeStatus::Completed => "Completed",
            RuntimeStatus::Failed => "Failed",
            RuntimeStatus::Terminated => "Terminated",
            RuntimeStatus::Other(s) => s,
        }
    }

    /// True while the backend is still working and polling must continue.
    pub fn is_processing(&self) -> bool {
        matches!(
            self,
            RuntimeStatus::Pending
                | RuntimeStatus::Running
                | RuntimeStatus::Processing
                | RuntimeStatus::InProgress
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_processing()
    }
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for RuntimeStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RuntimeStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(RuntimeStatus::parse(&s))
    }
}

/// Handle returned by job submission; owns the URLs for all subsequent
/// polls and for cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResponse {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "statusQueryGetUri")]
    pub status_query_get_uri: String,
    #[serde(rename = "terminatePostUri")]
    pub terminate_post_uri: String,
}

/// One row of the backend's partial results list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialResult {
    #[serde(default)]
    pub state: Option<RuntimeStatus>,
    #[serde(default)]
    pub traceback: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// Why a synthetic `Failed` status was fabricated client-side.
///
/// Lets consumers tell "the backend reported failure" apart from "the client
/// could not reach the backend", which the raw status value conflates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureNote {
    Transport(String),
    Decode(String),
}

impl fmt::Display for FailureNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureNote::Transport(msg) => write!(f, "backend unreachable: {}", msg),
            FailureNote::Decode(msg) => write!(f, "invalid backend response: {}", msg),
        }
    }
}

/// Raw status payload: the generic orchestrator status merged with whatever
/// domain-specific partial fields the backend has reported so far.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckStatus {
    #[serde(rename = "runtimeStatus", default, skip_serializing_if = "Option::is_none")]
    pub runtime_status: Option<RuntimeStatus>,
    #[serde(rename = "instanceId", default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_results: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_effect_completed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_interval_completed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refute_completed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_results: Option<Vec<PartialResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulation_completed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_simulations: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_results: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureNote>,
}

impl CheckStatus {
    /// Synthetic status fabricated when the backend could not be polled.
    pub fn failed(note: FailureNote) -> Self {
        Self {
            runtime_status: Some(RuntimeStatus::Failed),
            failure: Some(note),
            ..Default::default()
        }
    }

    pub fn status(&self) -> RuntimeStatus {
        self.runtime_status
            .clone()
            .unwrap_or(RuntimeStatus::Failed)
    }

    /// Shallow, non-destructive merge: fields present in `other` win, fields
    /// absent in `other` keep their current value. `x.merged_with(&empty)` is
    /// identical to `x`.
    pub fn merged_with(&self, other: &CheckStatus) -> CheckStatus {
        CheckStatus {
            runtime_status: other
                .runtime_status
                .clone()
                .or_else(|| self.runtime_status.clone()),
            instance_id: other.instance_id.clone().or_else(|| self.instance_id.clone()),
            name: other.name.clone().or_else(|| self.name.clone()),
            output: other.output.clone().or_else(|| self.output.clone()),
            total_results: other.total_results.or(self.total_results),
            estimated_effect_completed: other
                .estimated_effect_completed
                .or(self.estimated_effect_completed),
            confidence_interval_completed: other
                .confidence_interval_completed
                .or(self.confidence_interval_completed),
            refute_completed: other.refute_completed.or(self.refute_completed),
            partial_results: other
                .partial_results
                .clone()
                .or_else(|| self.partial_results.clone()),
            simulation_completed: other.simulation_completed.or(self.simulation_completed),
            total_simulations: other.total_simulations.or(self.total_simulations),
            test_results: other
                .test_results
                .clone()
                .or_else(|| self.test_results.clone()),
            failure: other.failure.clone().or_else(|| self.failure.clone()),
        }
    }
}

/// Per-phase progress state within one estimation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseStatus {
    Idle,
    Running,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTime {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end: Option<OffsetDateTime>,
}

/// UI-facing aggregate of a run's progress, rebuilt on each poll tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    pub status: RuntimeStatus,
    pub percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_effect_completed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_interval_completed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refute_completed: Option<String>,
    pub estimators: PhaseStatus,
    pub confidence_intervals: PhaseStatus,
    pub refuters: PhaseStatus,
    pub time: RunTime,
}

/// One estimation run's lifecycle, created at submission and updated on every
/// tick. Entries are never deleted, only marked inactive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    pub id: String,
    pub run_number: u32,
    pub is_active: bool,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_url: Option<String>,
    pub status: RunStatus,
    pub spec_count: u64,
    pub has_confidence_interval: bool,
    pub refutation_type: RefutationType,
}

/// Significance-test state for one run, upserted on each poll tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignificanceTest {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    pub status: RuntimeStatus,
    pub percentage: f64,
    pub simulation_completed: u64,
    pub total_simulations: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_results: Option<serde_json::Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_url: Option<String>,
}

/// Events emitted by the orchestrator while a job runs.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Started { response: NodeResponse },
    Update { status: CheckStatus },
    Completed { status: CheckStatus },
    Canceled,
}

/// How many refutation simulations each refuter runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefutationType {
    QuickRefutation,
    FullRefutation,
}

impl RefutationType {
    pub fn num_simulations(self) -> u64 {
        match self {
            RefutationType::QuickRefutation => 10,
            RefutationType::FullRefutation => 100,
        }
    }
}

impl Default for RefutationType {
    fn default() -> Self {
        RefutationType::QuickRefutation
    }
}

/// Whether a definition is the primary one for its role or an alternative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CausalityLevel {
    Primary,
    Secondary,
}

/// One population/exposure/outcome definition derived from the dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementDefinition {
    pub level: CausalityLevel,
    pub variable: String,
    pub column: String,
}

/// Confounders and outcome determinants for one causal-model level.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlternativeModels {
    #[serde(default)]
    pub confounders: Vec<String>,
    #[serde(default)]
    pub outcome_determinants: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstimatorGroup {
    Exposure,
    Outcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstimatorType {
    LinearRegression,
    PropensityScoreMatching,
    PropensityScoreStratification,
    InversePropensityWeighting,
    LinearDoubleMachineLearning,
    ForestDoubleMachineLearning,
    LinearDoublyRobustLearner,
    ForestDoublyRobustLearner,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Estimator {
    pub group: EstimatorGroup,
    #[serde(rename = "type")]
    pub estimator_type: EstimatorType,
}

/// A full causal question: definitions, model levels, estimators, and
/// refutation settings. Loaded from a JSON file for the `run` subcommand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CausalQuestion {
    pub population: Vec<ElementDefinition>,
    pub exposure: Vec<ElementDefinition>,
    pub outcome: Vec<ElementDefinition>,
    #[serde(default)]
    pub maximum_model: AlternativeModels,
    #[serde(default)]
    pub minimum_model: AlternativeModels,
    #[serde(default)]
    pub unadjusted_model: AlternativeModels,
    pub estimators: Vec<Estimator>,
    #[serde(default)]
    pub refutation_type: RefutationType,
    #[serde(default)]
    pub confidence_interval: bool,
}

impl CausalQuestion {
    /// Number of refuter tests the backend will run per specification.
    pub fn refuter_count(&self) -> u64 {
        crate::nodes::REFUTERS.len() as u64
    }
}
