//! Error handling for the capture relay

use crate::collaborators::{CaptureError, ProcessingError, UploadError};

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error (bad camera or policy configuration)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Conflict (duplicate camera, already running)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Queue ceiling reached, image rejected
    #[error("Queue full for camera {camera_id}: {message}")]
    QueueFull { camera_id: String, message: String },

    /// Camera capture failed
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    /// Image processing failed
    #[error("Processing error: {0}")]
    Processing(#[from] ProcessingError),

    /// Delivery failed
    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    /// Operation cancelled (camera removed or shutdown)
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Timed out waiting for a bounded resource
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config error
    #[error("Config error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable code for structured log fields
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NOT_FOUND",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Conflict(_) => "CONFLICT",
            Error::QueueFull { .. } => "QUEUE_FULL",
            Error::Capture(_) => "CAPTURE_ERROR",
            Error::Processing(_) => "PROCESSING_ERROR",
            Error::Upload(e) => e.error_code(),
            Error::Cancelled(_) => "CANCELLED",
            Error::Timeout(_) => "TIMEOUT",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
