//! Error types for the search service.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Main error type for store, stream and transport operations.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    #[error("Author not found: {0}")]
    AuthorNotFound(String),

    #[error("Author already exists: {0}")]
    AuthorExists(String),

    #[error("Book not found: {0}")]
    BookNotFound(String),

    #[error("Book already exists: {0}")]
    BookExists(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },
}

impl StreamError {
    /// Classify this error into a wire status code.
    pub fn code(&self) -> StatusCode {
        match self {
            StreamError::InvalidArgument(_) => StatusCode::InvalidArgument,
            StreamError::Unavailable(_) | StreamError::Io(_) => StatusCode::Unavailable,
            StreamError::Cancelled => StatusCode::Cancelled,
            StreamError::DeadlineExceeded => StatusCode::DeadlineExceeded,
            StreamError::ResourceExhausted(_) => StatusCode::ResourceExhausted,
            StreamError::Unimplemented(_) => StatusCode::Unimplemented,
            StreamError::AuthorNotFound(_) | StreamError::BookNotFound(_) => StatusCode::NotFound,
            StreamError::AuthorExists(_) | StreamError::BookExists(_) => {
                StatusCode::AlreadyExists
            }
            StreamError::Internal(_)
            | StreamError::Serialization(_)
            | StreamError::Deserialization(_)
            | StreamError::Corruption(_)
            | StreamError::ChecksumMismatch { .. } => StatusCode::Internal,
        }
    }

    /// Wire form of this error.
    pub fn status(&self) -> Status {
        let message = match self {
            StreamError::InvalidArgument(m)
            | StreamError::Unavailable(m)
            | StreamError::Internal(m)
            | StreamError::ResourceExhausted(m)
            | StreamError::Unimplemented(m) => m.clone(),
            other => other.to_string(),
        };
        Status {
            code: self.code(),
            message,
        }
    }

    pub(crate) fn connection_closed() -> Self {
        StreamError::Unavailable("connection closed".into())
    }
}

/// Status codes carried by error frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    Unavailable,
    Internal,
    Cancelled,
    DeadlineExceeded,
    ResourceExhausted,
    Unimplemented,
}

/// Serializable terminal error of a remote call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl From<Status> for StreamError {
    fn from(status: Status) -> Self {
        match status.code {
            StatusCode::InvalidArgument => StreamError::InvalidArgument(status.message),
            StatusCode::Unavailable => StreamError::Unavailable(status.message),
            StatusCode::Cancelled => StreamError::Cancelled,
            StatusCode::DeadlineExceeded => StreamError::DeadlineExceeded,
            StatusCode::ResourceExhausted => StreamError::ResourceExhausted(status.message),
            StatusCode::Unimplemented => StreamError::Unimplemented(status.message),
            StatusCode::NotFound | StatusCode::AlreadyExists | StatusCode::Internal => {
                StreamError::Internal(status.message)
            }
        }
    }
}

impl From<rmp_serde::encode::Error> for StreamError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StreamError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StreamError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StreamError::Deserialization(e.to_string())
    }
}

/// Result type for search service operations.
pub type Result<T> = std::result::Result<T, StreamError>;
