use shared::{
    domain::UserId,
    error::{ApiError, ErrorCode},
    store::StoreError,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("a conversation with user {counterpart} already exists")]
    AlreadyExists { counterpart: UserId },
    #[error("messaging between {viewer} and {counterpart} is blocked")]
    Blocked { viewer: UserId, counterpart: UserId },
    #[error("store request failed: {0}")]
    TransientStoreFailure(String),
    #[error("attachment upload failed: {0}")]
    UploadFailure(String),
}

impl ChatError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ChatError::NotFound(_) => ErrorCode::NotFound,
            ChatError::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            ChatError::Blocked { .. } => ErrorCode::Blocked,
            ChatError::TransientStoreFailure(_) => ErrorCode::TransientStoreFailure,
            ChatError::UploadFailure(_) => ErrorCode::UploadFailure,
        }
    }
}

impl From<StoreError> for ChatError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(path) => ChatError::NotFound(path.to_string()),
            other => ChatError::TransientStoreFailure(other.to_string()),
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(value: ChatError) -> Self {
        ApiError::new(value.code(), value.to_string())
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
