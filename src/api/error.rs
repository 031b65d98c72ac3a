use crate::model::FailureNote;
use thiserror::Error;

/// Errors surfaced by the backend client.
///
/// Polling paths never let these escape; they are converted into a synthetic
/// `Failed` status carrying a [`FailureNote`] at the documented absorption
/// points. Submission and file-transfer paths propagate them to the caller.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Network-level failure: the backend could not be reached at all.
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The backend answered, but with a non-success status.
    #[error("HTTP error with status {status}: {message}")]
    Http { status: u16, message: String },

    /// The backend answered, but the payload could not be decoded.
    #[error("could not decode backend response: {0}")]
    Decode(String),
}

impl ApiError {
    pub async fn from_response(response: reqwest::Response) -> ApiError {
        let status = response.status().as_u16();
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "failed to read response body".to_string());
        ApiError::Http { status, message }
    }

    /// Classify this error for attachment to a synthetic `Failed` status.
    pub fn failure_note(&self) -> FailureNote {
        match self {
            ApiError::Transport(e) if e.is_decode() => FailureNote::Decode(e.to_string()),
            ApiError::Transport(e) => FailureNote::Transport(e.to_string()),
            ApiError::Http { status, message } => {
                FailureNote::Transport(format!("HTTP {}: {}", status, message))
            }
            ApiError::Decode(msg) => FailureNote::Decode(msg.clone()),
        }
    }
}
