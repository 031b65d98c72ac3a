use crate::api::{ApiError, JobApi, DEFAULT_CANCEL_REASON};
use crate::model::{CheckStatus, JobEvent, NodeResponse, StatusKind};
use crate::nodes::NodeRequest;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Cooperative cancellation handle for one run.
///
/// Cancellation does not abort an in-flight poll tick; the tick that is
/// already dispatched finishes and the next one does not start.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: watch::Sender<Option<String>>,
}

impl CancelToken {
    /// Request cancellation, with the default reason when none is supplied.
    pub fn cancel(&self, reason: Option<&str>) {
        let reason = reason.unwrap_or(DEFAULT_CANCEL_REASON).to_string();
        let _ = self.tx.send(Some(reason));
    }
}

/// Drives one job's lifecycle: submit, poll until terminal, cancel.
///
/// Exactly one polling loop exists per job handle; the loop is a plain
/// sequential loop, so no re-entrancy is possible. All polling failures are
/// values (a synthetic `Failed` status), never errors, which is what lets
/// the loop always terminate cleanly.
pub struct Orchestrator<A> {
    api: A,
    poll_interval: Duration,
    events: mpsc::UnboundedSender<JobEvent>,
    cancel_rx: watch::Receiver<Option<String>>,
}

impl<A: JobApi> Orchestrator<A> {
    pub fn new(
        api: A,
        poll_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<JobEvent>, CancelToken) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(None);
        (
            Self {
                api,
                poll_interval,
                events: event_tx,
                cancel_rx,
            },
            event_rx,
            CancelToken { tx: cancel_tx },
        )
    }

    /// Submit the job and poll it to a terminal state.
    ///
    /// Submission errors propagate to the caller; nothing after submission
    /// can fail this future. Exactly one `Started` event fires after the
    /// submission resolves, and exactly one of `Completed` or `Canceled`
    /// fires before this returns.
    pub async fn execute(mut self, request: NodeRequest, kind: StatusKind) -> Result<(), ApiError> {
        let response = self.api.submit_job(&request).await?;
        let _ = self.events.send(JobEvent::Started {
            response: response.clone(),
        });
        self.poll_until_terminal(&response, kind).await;
        Ok(())
    }

    async fn poll_until_terminal(&mut self, response: &NodeResponse, kind: StatusKind) {
        let mut merged = self.api.poll_status(&response.status_query_get_uri).await;
        loop {
            let _ = self.events.send(JobEvent::Update {
                status: merged.clone(),
            });
            if merged.status().is_terminal() {
                break;
            }
            if let Some(reason) = self.cancel_requested() {
                debug!(%reason, "run canceled, terminating backend instance");
                self.api
                    .terminate_job(&response.terminate_post_uri, Some(&reason))
                    .await;
                let _ = self.events.send(JobEvent::Canceled);
                return;
            }

            // One tick: both status fetches plus the fixed delay, awaited
            // together. The delay is a minimum tick period, not a timeout.
            let instance_id = merged.instance_id.clone();
            let (primary, domain, _) = futures::join!(
                self.api.poll_status(&response.status_query_get_uri),
                async {
                    match instance_id.as_deref() {
                        Some(id) => self.api.poll_domain_status(id, kind).await,
                        // No instance id yet on the tick after submission.
                        None => CheckStatus::default(),
                    }
                },
                tokio::time::sleep(self.poll_interval),
            );
            merged = primary.merged_with(&domain);
        }
        let _ = self.events.send(JobEvent::Completed { status: merged });
    }

    fn cancel_requested(&self) -> Option<String> {
        self.cancel_rx.borrow().clone()
    }
}
