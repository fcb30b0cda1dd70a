//! Orchestrator types

use crate::camera_worker::CameraWorkerStatus;
use crate::collaborators::{ImageProcessor, PassthroughProcessor};
use crate::config::QueueCameraConfig;
use crate::image_queue::CameraQueueState;
use crate::queue_manager::GlobalQueueStats;
use crate::resource_limiter::ResourceLimiterStats;
use crate::upload_pipeline::{UploadLaneStatus, UploadStats};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Per-camera registration options
#[derive(Clone)]
pub struct CameraOptions {
    /// Remote directory for this camera's files
    pub remote_path: String,
    pub processor: Arc<dyn ImageProcessor>,
    /// Replaces the global queue defaults entirely when set
    pub queue_override: Option<QueueCameraConfig>,
    /// Disabled cameras keep draining their queue but do not capture
    pub enabled: bool,
}

impl CameraOptions {
    pub fn new(remote_path: impl Into<String>) -> Self {
        Self {
            remote_path: remote_path.into(),
            processor: Arc::new(PassthroughProcessor),
            queue_override: None,
            enabled: true,
        }
    }

    pub fn with_processor(mut self, processor: Arc<dyn ImageProcessor>) -> Self {
        self.processor = processor;
        self
    }

    pub fn with_queue_override(mut self, config: QueueCameraConfig) -> Self {
        self.queue_override = Some(config);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Per-camera status
#[derive(Debug, Clone, Serialize)]
pub struct CameraStatus {
    pub camera_id: String,
    pub enabled: bool,
    pub capturing: bool,
    pub uploading: bool,
    pub is_backing_off: bool,
    pub degraded: bool,
    pub paused: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub capture_stats: CameraWorkerStatus,
    pub queue_stats: CameraQueueState,
    pub upload: UploadLaneStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeInfo {
    pub time_healthy: bool,
}

/// Aggregate status
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: u64,
    pub cameras: BTreeMap<String, CameraStatus>,
    pub upload_stats: UploadStats,
    pub global_queue_stats: GlobalQueueStats,
    pub resource_limiter: ResourceLimiterStats,
    pub time_info: TimeInfo,
}
