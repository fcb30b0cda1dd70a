//! CameraWorker types

use crate::backoff_policy::PauseReason;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Where the worker loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Idle,
    Capturing,
    Processing,
    Enqueuing,
    BackoffWait,
    /// Queue back-pressure; only probe captures run
    Paused,
    Stopped,
}

/// Capture counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureStats {
    pub attempts: u64,
    pub captured: u64,
    pub enqueued: u64,
    pub capture_failures: u64,
    pub processing_failures: u64,
    /// Local queue write failures
    pub storage_failures: u64,
    /// Enqueue refused by the system ceiling
    pub rejected_full: u64,
    /// Ticks skipped because the clock was not trusted
    pub skipped_time_sync: u64,
    /// Captures taken while paused, not enqueued
    pub probes: u64,
    /// Frames not shown because the previous preview call was still running
    pub previews_skipped: u64,
}

/// Per-camera worker status
#[derive(Debug, Clone, Serialize)]
pub struct CameraWorkerStatus {
    pub camera_id: String,
    pub running: bool,
    pub phase: WorkerPhase,
    pub interval_seconds: u64,
    pub effective_interval_seconds: f64,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub error_count: u64,
    pub consecutive_failures: u32,
    pub is_backing_off: bool,
    pub current_delay_ms: u64,
    pub degraded: bool,
    pub degraded_since: Option<DateTime<Utc>>,
    pub paused: bool,
    pub pause_reason: Option<PauseReason>,
    pub paused_since: Option<DateTime<Utc>>,
    pub capturing: bool,
    pub next_capture_at: Option<DateTime<Utc>>,
    pub stats: CaptureStats,
}

impl CameraWorkerStatus {
    pub fn new(camera_id: &str, interval_seconds: u64) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            running: false,
            phase: WorkerPhase::Idle,
            interval_seconds,
            effective_interval_seconds: interval_seconds as f64,
            last_attempt_at: None,
            last_success_at: None,
            last_error: None,
            last_error_at: None,
            error_count: 0,
            consecutive_failures: 0,
            is_backing_off: false,
            current_delay_ms: 0,
            degraded: false,
            degraded_since: None,
            paused: false,
            pause_reason: None,
            paused_since: None,
            capturing: false,
            next_capture_at: None,
            stats: CaptureStats::default(),
        }
    }
}
