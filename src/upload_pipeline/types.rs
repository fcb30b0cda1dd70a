//! UploadPipeline types

use crate::collaborators::UploadErrorKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Pipeline-wide delivery counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct UploadStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub auth_failures: u64,
    /// Images waiting in all queues
    pub queued: u64,
}

#[derive(Debug, Default)]
pub(crate) struct UploadCounters {
    pub total: AtomicU64,
    pub success: AtomicU64,
    pub failed: AtomicU64,
    pub auth_failures: AtomicU64,
}

impl UploadCounters {
    pub fn on_success(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_failure(&self, kind: UploadErrorKind) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
        if kind == UploadErrorKind::Auth {
            self.auth_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self, queued: u64) -> UploadStats {
        UploadStats {
            total: self.total.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            queued,
        }
    }
}

/// Per-camera upload lane status
#[derive(Debug, Clone, Serialize)]
pub struct UploadLaneStatus {
    pub camera_id: String,
    pub remote_path: String,
    pub running: bool,
    pub uploading: bool,
    pub uploads_success: u64,
    pub uploads_failed: u64,
    pub consecutive_failures: u32,
    pub is_backing_off: bool,
    pub current_delay_ms: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_remote_file: Option<String>,
    pub last_error: Option<String>,
    pub last_error_kind: Option<UploadErrorKind>,
    /// Set after an auth failure; cleared on the next success
    pub auth_blocked_until: Option<DateTime<Utc>>,
}

impl UploadLaneStatus {
    pub fn new(camera_id: &str, remote_path: &str) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            remote_path: remote_path.to_string(),
            running: false,
            uploading: false,
            uploads_success: 0,
            uploads_failed: 0,
            consecutive_failures: 0,
            is_backing_off: false,
            current_delay_ms: 0,
            last_success_at: None,
            last_remote_file: None,
            last_error: None,
            last_error_kind: None,
            auth_blocked_until: None,
        }
    }
}
