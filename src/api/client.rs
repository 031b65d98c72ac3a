use super::error::ApiError;
use super::urls::{rewrite_functions_host, rewrite_storage_host};
use super::JobApi;
use crate::model::{ApiKeys, CheckStatus, NodeResponse, Settings, StatusKind};
use crate::nodes::NodeRequest;
use async_trait::async_trait;
use reqwest::multipart;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use tracing::{debug, warn};

pub const DEFAULT_CANCEL_REASON: &str = "User canceled the run";

/// Retries for the domain status endpoints, which flake under load while the
/// generic status webhook stays reachable.
const DOMAIN_STATUS_RETRIES: u32 = 3;
const EXECUTION_COUNT_RETRIES: u32 = 1;

#[derive(Debug, Deserialize)]
struct TotalExecutionsResponse {
    total_executions: u64,
}

#[derive(Debug, Deserialize)]
struct UploadFileResponse {
    uploaded_files: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    signed_url: String,
}

/// Result of a file download.
///
/// A failed blob fetch is not an error: the caller gets the resolved URL back
/// exactly once and is expected to surface it for manual retrieval.
#[derive(Debug)]
pub enum DownloadOutcome {
    Fetched { bytes: Vec<u8>, url: String },
    Fallback { url: String },
}

/// Client for the function-based estimation backend.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    keys: ApiKeys,
    session_id: String,
}

impl ApiClient {
    pub fn new(settings: &Settings, session_id: String) -> Result<Self, ApiError> {
        // No request timeout on purpose: status polls against a busy backend
        // can legitimately take a while, and the poll loop tolerates a slow
        // tick better than a spurious failure.
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            keys: settings.keys.clone(),
            session_id,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Start a fresh session. Uploads do this so stale files from a previous
    /// run cannot leak into a new one.
    pub fn reset_session(&mut self) -> &str {
        self.session_id = uuid::Uuid::new_v4().to_string();
        &self.session_id
    }

    /// Submit a job for execution. Not retried: a duplicate submission would
    /// start a second billing job on the backend.
    pub async fn submit_job(&self, request: &NodeRequest) -> Result<NodeResponse, ApiError> {
        let url = format!(
            "{}/api/orchestrators/ExecuteNodeOrchestrator?code={}",
            self.base_url, self.keys.orchestrators
        );
        let body = serde_json::json!({
            "session_id": self.session_id,
            "nodes": request.nodes,
        });
        let response = self.http.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(ApiError::from_response(response).await);
        }
        Ok(response.json().await?)
    }

    /// Ask the backend how many specifications a request expands to.
    pub async fn execution_count(&self, request: &NodeRequest) -> Result<u64, ApiError> {
        let url = format!(
            "{}/api/getnumberofexecutions?code={}",
            self.base_url, self.keys.executions
        );
        let body = serde_json::json!({ "node_data": request.nodes.first() });
        let response = with_retries(EXECUTION_COUNT_RETRIES, || async {
            let response = self.http.post(&url).json(&body).send().await?;
            if !response.status().is_success() {
                return Err(ApiError::from_response(response).await);
            }
            Ok(response)
        })
        .await?;
        let total: TotalExecutionsResponse = response.json().await?;
        Ok(total.total_executions)
    }

    /// Upload dataset files under a fresh session. Not retried.
    pub async fn upload_files(
        &mut self,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<HashMap<String, String>, ApiError> {
        let session_id = self.reset_session().to_string();
        let url = format!(
            "{}/api/UploadFile?session_id={}&code={}",
            self.base_url, session_id, self.keys.upload
        );
        let mut form = multipart::Form::new();
        for (name, bytes) in files {
            let part = multipart::Part::bytes(bytes).file_name(name.clone());
            form = form.part(name, part);
        }
        let response = self.http.post(&url).multipart(form).send().await?;
        if !response.status().is_success() {
            return Err(ApiError::from_response(response).await);
        }
        let uploaded: UploadFileResponse = response.json().await?;
        Ok(uploaded.uploaded_files)
    }

    /// Resolve a signed URL for `file_name` and fetch its bytes.
    ///
    /// URL resolution failures propagate; a failed blob fetch degrades to
    /// [`DownloadOutcome::Fallback`] carrying the resolved URL.
    pub async fn download_file(&self, file_name: &str) -> Result<DownloadOutcome, ApiError> {
        let url = format!(
            "{}/api/getdownloadurl?session_id={}&code={}&file_name={}",
            self.base_url, self.session_id, self.keys.download, file_name
        );
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(ApiError::from_response(response).await);
        }
        let signed: SignedUrlResponse = response.json().await?;
        let signed_url = rewrite_storage_host(&signed.signed_url, &self.base_url);
        Ok(Self::fetch_or_fallback(signed_url, file_name, |url| async move {
            self.fetch_bytes(&url).await
        })
        .await)
    }

    /// Collapse a blob-fetch attempt into the download outcome. A failed
    /// fetch degrades to `Fallback` carrying the resolved URL so the caller
    /// can surface it for manual retrieval.
    async fn fetch_or_fallback<F, Fut>(url: String, file_name: &str, fetch: F) -> DownloadOutcome
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Vec<u8>, ApiError>>,
    {
        match fetch(url.clone()).await {
            Ok(bytes) => DownloadOutcome::Fetched { bytes, url },
            Err(err) => {
                warn!(%err, file_name, "blob fetch failed, falling back to signed URL");
                DownloadOutcome::Fallback { url }
            }
        }
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, ApiError> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ApiError::from_response(response).await);
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// Poll the generic orchestrator status webhook. Absorbing errors keeps
    /// the poll loop free of rejected futures.
    pub async fn poll_status(&self, status_url: &str) -> CheckStatus {
        let url = rewrite_functions_host(status_url);
        let result: Result<CheckStatus, ApiError> = async {
            let response = self.http.get(&url).send().await?;
            if !response.status().is_success() {
                return Err(ApiError::from_response(response).await);
            }
            Ok(response.json().await?)
        }
        .await;
        match result {
            Ok(status) => status,
            Err(err) => {
                warn!(%err, "status poll failed, reporting synthetic Failed");
                CheckStatus::failed(err.failure_note())
            }
        }
    }

    /// Poll the domain-specific partial status for `instance_id`.
    pub async fn poll_domain_status(&self, instance_id: &str, kind: StatusKind) -> CheckStatus {
        let (path, code) = match kind {
            StatusKind::Estimate => ("checkinferencestatus", &self.keys.check_status),
            StatusKind::Significance => (
                "checksignificanceteststatus",
                &self.keys.check_significance_status,
            ),
        };
        let url = format!(
            "{}/api/{}?session={}&code={}&instance={}",
            self.base_url, path, self.session_id, code, instance_id
        );
        let result = with_retries(DOMAIN_STATUS_RETRIES, || async {
            let response = self.http.get(&url).send().await?;
            if !response.status().is_success() {
                return Err(ApiError::from_response(response).await);
            }
            Ok(response.json::<CheckStatus>().await?)
        })
        .await;
        match result {
            Ok(status) => status,
            Err(err) => {
                warn!(%err, instance_id, "domain status poll exhausted retries");
                CheckStatus::failed(err.failure_note())
            }
        }
    }

    /// Best-effort termination. An empty URL is a no-op; failures are logged
    /// and swallowed, since the backend stops answering non-terminal status
    /// once the instance winds down anyway.
    pub async fn terminate_job(&self, terminate_url: &str, reason: Option<&str>) {
        if terminate_url.is_empty() {
            return;
        }
        let reason = reason.unwrap_or(DEFAULT_CANCEL_REASON);
        let url = rewrite_functions_host(terminate_url).replace("{text}", reason);
        match self.http.post(&url).send().await {
            Ok(response) => debug!(status = %response.status(), "terminate requested"),
            Err(err) => debug!(%err, "terminate request failed"),
        }
    }
}

#[async_trait]
impl JobApi for ApiClient {
    async fn submit_job(&self, request: &NodeRequest) -> Result<NodeResponse, ApiError> {
        ApiClient::submit_job(self, request).await
    }

    async fn poll_status(&self, status_url: &str) -> CheckStatus {
        ApiClient::poll_status(self, status_url).await
    }

    async fn poll_domain_status(&self, instance_id: &str, kind: StatusKind) -> CheckStatus {
        ApiClient::poll_domain_status(self, instance_id, kind).await
    }

    async fn terminate_job(&self, terminate_url: &str, reason: Option<&str>) {
        ApiClient::terminate_job(self, terminate_url, reason).await
    }
}

/// Re-issue `op` until it succeeds or `max_retries` extra attempts are spent.
/// With `max_retries = N` a persistently failing operation runs exactly
/// `N + 1` times. There is no backoff: the natural polling interval paces
/// retried status calls, and nothing else is retried more than once.
pub(crate) async fn with_retries<T, F, Fut>(max_retries: u32, mut op: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_retries => {
                attempt += 1;
                debug!(%err, attempt, max_retries, "retrying request");
            }
            Err(err) => return Err(err),
        }
    }
}
