use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    Blocked,
    TransientStoreFailure,
    UploadFailure,
}

impl ErrorCode {
    /// Business outcomes the caller is expected to handle, as opposed to
    /// failures worth retrying.
    pub fn is_expected_outcome(self) -> bool {
        matches!(self, ErrorCode::AlreadyExists | ErrorCode::Blocked)
    }

    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::TransientStoreFailure | ErrorCode::UploadFailure
        )
    }
}

/// Serializable error surfaced to a presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
