//! HTTP snapshot camera (`/snapshot.jpg`-style endpoints)

use super::{CameraSource, CaptureError};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;

/// JPEG start-of-image marker
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// Camera that serves a still image over plain HTTP
pub struct HttpSnapshotCamera {
    camera_id: String,
    url: String,
    username: Option<String>,
    password: Option<String>,
    client: reqwest::Client,
}

impl HttpSnapshotCamera {
    /// Create new HttpSnapshotCamera
    pub fn new(camera_id: impl Into<String>, url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Config(format!("HTTP client build failed: {}", e)))?;

        Ok(Self {
            camera_id: camera_id.into(),
            url: url.into(),
            username: None,
            password: None,
            client,
        })
    }

    /// Use HTTP basic auth for every request
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl CameraSource for HttpSnapshotCamera {
    fn camera_id(&self) -> &str {
        &self.camera_id
    }

    async fn capture(&self, timeout: Duration) -> std::result::Result<Vec<u8>, CaptureError> {
        let mut request = self.client.get(&self.url).timeout(timeout);
        if let Some(ref username) = self.username {
            request = request.basic_auth(username, self.password.as_ref());
        }

        let resp = request.send().await.map_err(|e| classify(e, timeout))?;

        if !resp.status().is_success() {
            return Err(CaptureError::BadResponse(format!(
                "Snapshot HTTP error: {}",
                resp.status()
            )));
        }

        let bytes = resp.bytes().await.map_err(|e| classify(e, timeout))?;

        if bytes.is_empty() {
            return Err(CaptureError::BadResponse("empty body".to_string()));
        }
        if !bytes.starts_with(&JPEG_SOI) {
            tracing::debug!(
                camera_id = %self.camera_id,
                size = bytes.len(),
                "Snapshot body is not JPEG, passing through"
            );
        }

        Ok(bytes.to_vec())
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> CaptureError {
    if err.is_timeout() {
        CaptureError::Timeout(timeout)
    } else if err.is_connect() {
        CaptureError::Unreachable(err.to_string())
    } else {
        CaptureError::BadResponse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_keeps_identity() {
        let camera = HttpSnapshotCamera::new("cam-001", "http://192.0.2.10/snapshot.jpg")
            .unwrap()
            .with_credentials("admin", "secret");
        assert_eq!(camera.camera_id(), "cam-001");
        assert_eq!(camera.url(), "http://192.0.2.10/snapshot.jpg");
    }
}
