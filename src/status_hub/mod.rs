//! StatusHub - Status event distribution
//!
//! ## Responsibilities
//!
//! - Fan out state transitions (capture failures, degraded mode, pauses,
//!   evictions, deliveries, auth failures, camera lifecycle) to subscribers
//!
//! Events are fire-and-forget: with no subscriber attached they are dropped,
//! and a slow subscriber sees `RecvError::Lagged` rather than blocking workers.

use crate::backoff_policy::PauseReason;
use crate::collaborators::UploadErrorKind;
use crate::image_queue::EvictionReason;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// Status event
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum StatusEvent {
    CameraAdded {
        camera_id: String,
    },
    CameraRemoved {
        camera_id: String,
    },
    CaptureFailed {
        camera_id: String,
        error: String,
        consecutive_failures: u32,
        retry_in_ms: u64,
    },
    DegradedEntered {
        camera_id: String,
        consecutive_failures: u32,
    },
    DegradedExited {
        camera_id: String,
    },
    CapturePaused {
        camera_id: String,
        reason: PauseReason,
        occupancy: f64,
    },
    CaptureResumed {
        camera_id: String,
        occupancy: f64,
    },
    ImagesEvicted {
        camera_id: String,
        count: usize,
        bytes: u64,
        reason: EvictionReason,
    },
    UploadSucceeded {
        camera_id: String,
        sequence: u64,
        remote_path: String,
    },
    UploadFailed {
        camera_id: String,
        sequence: u64,
        kind: UploadErrorKind,
        error: String,
    },
    AuthFailure {
        camera_id: String,
        error: String,
        retry_at: DateTime<Utc>,
    },
}

impl StatusEvent {
    pub fn camera_id(&self) -> &str {
        match self {
            StatusEvent::CameraAdded { camera_id }
            | StatusEvent::CameraRemoved { camera_id }
            | StatusEvent::CaptureFailed { camera_id, .. }
            | StatusEvent::DegradedEntered { camera_id, .. }
            | StatusEvent::DegradedExited { camera_id }
            | StatusEvent::CapturePaused { camera_id, .. }
            | StatusEvent::CaptureResumed { camera_id, .. }
            | StatusEvent::ImagesEvicted { camera_id, .. }
            | StatusEvent::UploadSucceeded { camera_id, .. }
            | StatusEvent::UploadFailed { camera_id, .. }
            | StatusEvent::AuthFailure { camera_id, .. } => camera_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            StatusEvent::CameraAdded { .. } => "camera_added",
            StatusEvent::CameraRemoved { .. } => "camera_removed",
            StatusEvent::CaptureFailed { .. } => "capture_failed",
            StatusEvent::DegradedEntered { .. } => "degraded_entered",
            StatusEvent::DegradedExited { .. } => "degraded_exited",
            StatusEvent::CapturePaused { .. } => "capture_paused",
            StatusEvent::CaptureResumed { .. } => "capture_resumed",
            StatusEvent::ImagesEvicted { .. } => "images_evicted",
            StatusEvent::UploadSucceeded { .. } => "upload_succeeded",
            StatusEvent::UploadFailed { .. } => "upload_failed",
            StatusEvent::AuthFailure { .. } => "auth_failure",
        }
    }
}

/// Broadcast hub for status events
pub struct StatusHub {
    tx: broadcast::Sender<StatusEvent>,
    published: AtomicU64,
}

impl StatusHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            published: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: StatusEvent) {
        tracing::trace!(
            camera_id = %event.camera_id(),
            event_type = event.event_type(),
            "Publishing status event"
        );
        self.published.fetch_add(1, Ordering::Relaxed);
        // Err only means nobody is listening
        let _ = self.tx.send(event);
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let hub = StatusHub::new();
        let mut rx = hub.subscribe();

        hub.publish(StatusEvent::DegradedEntered {
            camera_id: "cam-001".to_string(),
            consecutive_failures: 5,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.camera_id(), "cam-001");
        assert_eq!(event.event_type(), "degraded_entered");
        assert_eq!(hub.published_count(), 1);
    }

    #[test]
    fn test_publish_without_subscribers_is_dropped() {
        let hub = StatusHub::new();
        hub.publish(StatusEvent::CameraAdded {
            camera_id: "cam-001".to_string(),
        });
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serializes_tagged() {
        let json = serde_json::to_value(StatusEvent::CaptureResumed {
            camera_id: "cam-001".to_string(),
            occupancy: 0.4,
        })
        .unwrap();
        assert_eq!(json["type"], "capture_resumed");
        assert_eq!(json["data"]["camera_id"], "cam-001");
    }
}
