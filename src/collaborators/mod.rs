//! Collaborators - Capabilities consumed by the capture engine
//!
//! ## Responsibilities
//!
//! - Camera capture: `capture(timeout) -> bytes`
//! - Image processing: `process(bytes) -> bytes`
//! - Remote delivery: `upload / rename / remove / test_connection`
//! - Clock health: `is_time_healthy()`
//!
//! Protocol clients live outside this crate. The reference implementations here
//! (HTTP snapshot, mounted-directory uploader, passthrough processor) keep the
//! binary runnable on a bare device.

mod dir_uploader;
mod http_snapshot;
mod local;

pub use dir_uploader::DirectoryUploader;
pub use http_snapshot::HttpSnapshotCamera;
pub use local::{ManualTimeAuthority, PassthroughProcessor, SystemTimeAuthority};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Camera capture failure
#[derive(Debug, Clone, thiserror::Error)]
pub enum CaptureError {
    /// Camera could not be reached
    #[error("camera unreachable: {0}")]
    Unreachable(String),

    /// Camera did not answer within the capture timeout
    #[error("capture timed out after {0:?}")]
    Timeout(Duration),

    /// Camera answered with something that is not an image
    #[error("bad response: {0}")]
    BadResponse(String),
}

/// Image processing failure
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessingError {
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Delivery failure, classified for retry policy
#[derive(Debug, Clone, thiserror::Error)]
pub enum UploadError {
    /// Remote unreachable or connection dropped
    #[error("connection error: {0}")]
    Connection(String),

    /// Credentials rejected; needs operator action
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Remote did not answer in time
    #[error("upload timed out: {0}")]
    Timeout(String),

    /// Any other remote write failure
    #[error("upload failed: {0}")]
    Upload(String),
}

/// Upload failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadErrorKind {
    Connection,
    Auth,
    Timeout,
    Upload,
}

impl UploadError {
    pub fn kind(&self) -> UploadErrorKind {
        match self {
            UploadError::Connection(_) => UploadErrorKind::Connection,
            UploadError::Auth(_) => UploadErrorKind::Auth,
            UploadError::Timeout(_) => UploadErrorKind::Timeout,
            UploadError::Upload(_) => UploadErrorKind::Upload,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            UploadError::Connection(_) => "UPLOAD_CONNECTION",
            UploadError::Auth(_) => "UPLOAD_AUTH",
            UploadError::Timeout(_) => "UPLOAD_TIMEOUT",
            UploadError::Upload(_) => "UPLOAD_FAILED",
        }
    }

    /// Classify a local I/O failure the way a transfer client would
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::PermissionDenied => UploadError::Auth(err.to_string()),
            ErrorKind::TimedOut | ErrorKind::WouldBlock => UploadError::Timeout(err.to_string()),
            ErrorKind::NotFound
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::AddrNotAvailable => UploadError::Connection(err.to_string()),
            _ => UploadError::Upload(err.to_string()),
        }
    }
}

/// A camera that can produce one encoded image per call
#[async_trait]
pub trait CameraSource: Send + Sync {
    /// Stable camera identity
    fn camera_id(&self) -> &str;

    /// Capture one image. Implementations should honour `timeout`; the worker
    /// enforces it as well.
    async fn capture(&self, timeout: Duration) -> Result<Vec<u8>, CaptureError>;
}

/// Resize / re-encode stage
#[async_trait]
pub trait ImageProcessor: Send + Sync {
    async fn process(&self, data: Vec<u8>) -> Result<Vec<u8>, ProcessingError>;

    /// Capture time embedded in the image (EXIF DateTimeOriginal), if readable
    async fn capture_time(&self, _data: &[u8]) -> Option<DateTime<Utc>> {
        None
    }
}

/// Remote file store (SFTP/FTPS or a mounted share)
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, path: &str, data: &[u8]) -> Result<(), UploadError>;

    /// Rename within the remote; must replace atomically or fail
    async fn rename(&self, from: &str, to: &str) -> Result<(), UploadError>;

    /// Best-effort delete; missing files are not an error
    async fn remove(&self, path: &str) -> Result<(), UploadError>;

    async fn test_connection(&self) -> Result<(), UploadError>;
}

/// Clock health as reported by the time-sync checker
pub trait TimeAuthority: Send + Sync {
    fn is_time_healthy(&self) -> bool;
}

/// Preview sink for the operator UI: latest raw bytes and their capture time
pub type PreviewCallback = Arc<dyn Fn(Vec<u8>, DateTime<Utc>) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_io_classification() {
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(UploadError::from_io(&denied).kind(), UploadErrorKind::Auth);

        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(UploadError::from_io(&timed_out).kind(), UploadErrorKind::Timeout);

        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(UploadError::from_io(&refused).kind(), UploadErrorKind::Connection);

        let other = io::Error::new(io::ErrorKind::Other, "disk quota");
        assert_eq!(UploadError::from_io(&other).kind(), UploadErrorKind::Upload);
    }
}
