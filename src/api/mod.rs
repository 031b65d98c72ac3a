//! HTTP surface of the compute backend.
//!
//! This module owns the request/retry plumbing against the function-based
//! estimation API: job submission, status polling, file transfer, and
//! termination. The orchestrator talks to it through the [`JobApi`] trait so
//! tests can script a backend.

mod client;
mod error;
mod urls;

pub use client::{ApiClient, DownloadOutcome, DEFAULT_CANCEL_REASON};
pub use error::ApiError;

use crate::model::{CheckStatus, NodeResponse, StatusKind};
use crate::nodes::NodeRequest;
use async_trait::async_trait;

/// The subset of backend operations the orchestrator needs to drive one job.
#[async_trait]
pub trait JobApi: Send + Sync {
    /// Submit a job. Errors propagate; submission is never retried so a job
    /// cannot be silently duplicated.
    async fn submit_job(&self, request: &NodeRequest) -> Result<NodeResponse, ApiError>;

    /// Poll the generic orchestrator status. Never fails: transport and
    /// decode errors are absorbed into a synthetic `Failed` status.
    async fn poll_status(&self, status_url: &str) -> CheckStatus;

    /// Poll the domain-specific partial status for a running instance.
    /// Retried a bounded number of times, then absorbed into `Failed`.
    async fn poll_domain_status(&self, instance_id: &str, kind: StatusKind) -> CheckStatus;

    /// Fire-and-forget termination. A missing URL is a no-op and transport
    /// failures are swallowed.
    async fn terminate_job(&self, terminate_url: &str, reason: Option<&str>);
}
