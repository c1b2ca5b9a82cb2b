//! Error types for the Timesketch worker

use thiserror::Error;

/// Result type alias for task operations
pub type Result<T> = std::result::Result<T, TaskError>;

/// Everything that can go wrong while running an upload task.
///
/// Only [`TaskError::Upload`] is recoverable: it is recorded against a single
/// input file. Every other variant aborts the task.
#[derive(Error, Debug)]
pub enum TaskError {
    /// Credentials rejected by the Timesketch server
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Sketch does not exist or is not visible to the account
    #[error("Not found: {0}")]
    NotFound(String),

    /// Server unreachable or request timed out
    #[error("Network error: {0}")]
    Network(String),

    /// A single file was rejected
    #[error("Upload failed: {0}")]
    Upload(String),

    /// Unexpected response from the Timesketch API
    #[error("Timesketch API error: {0}")]
    Api(String),

    /// Malformed task payload
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// Missing or invalid worker configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Could not acquire the sketch lock
    #[error("Lock error: {0}")]
    Lock(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TaskError {
    /// Stable label reported in failed task results
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "AuthenticationError",
            Self::NotFound(_) => "NotFoundError",
            Self::Network(_) => "NetworkError",
            Self::Upload(_) => "UploadError",
            Self::Api(_) => "ApiError",
            Self::InvalidTask(_) => "InvalidTaskError",
            Self::Config(_) => "ConfigError",
            Self::Lock(_) => "LockError",
            Self::Io(_) => "IoError",
            Self::Json(_) => "JsonError",
        }
    }

    /// Whether this error only affects the file it was raised for
    pub fn is_per_file(&self) -> bool {
        matches!(self, Self::Upload(_))
    }

    pub fn invalid_task(msg: impl Into<String>) -> Self {
        Self::InvalidTask(msg.into())
    }

    pub fn upload(msg: impl Into<String>) -> Self {
        Self::Upload(msg.into())
    }

    /// Classify a transport-level `reqwest` failure.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            Self::Network(err.to_string())
        } else {
            Self::Api(err.to_string())
        }
    }
}
