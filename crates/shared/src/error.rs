use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable reason carried by REST error bodies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    PayloadTooLarge,
    RateLimited,
    Internal,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Error body returned on non-2xx responses. Older endpoints only send `{"error": "..."}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: ErrorCode,
    #[serde(default, alias = "error")]
    pub message: String,
}

/// A request the REST collaborator answered with a failure status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("request rejected with status {status} ({code:?}): {message}")]
pub struct RequestRejected {
    pub status: u16,
    pub code: ErrorCode,
    pub message: String,
}

impl RequestRejected {
    /// Reads a response body, falling back to the raw text when it is not an [`ApiError`].
    pub fn from_body(status: u16, body: &str) -> Self {
        let parsed = serde_json::from_str::<ApiError>(body).unwrap_or_else(|_| ApiError {
            code: ErrorCode::Unknown,
            message: body.trim().to_string(),
        });
        Self {
            status,
            code: parsed.code,
            message: parsed.message,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == 401 || self.code == ErrorCode::Unauthorized
    }
}
