//! UploadPipeline - Queue draining with atomic remote delivery
//!
//! ## Responsibilities
//!
//! - One lane per camera draining its queue oldest-first
//! - Global cap on concurrent uploads
//! - Temp-name upload followed by rename (no partial final files)
//! - Failure classification, lane backoff and auth hold-off
//!
//! ## Design
//!
//! - An image is removed from its queue only after the rename succeeded
//! - Lane backoff is independent of the camera's capture backoff
//! - The uploader is read per attempt so it can be swapped at runtime

mod types;

pub use types::*;

use crate::backoff_policy::BackoffState;
use crate::collaborators::{UploadError, UploadErrorKind, Uploader};
use crate::config::UploadConfig;
use crate::image_queue::{ImageQueue, QueuedImage};
use crate::status_hub::{StatusEvent, StatusHub};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

/// Swappable uploader for one camera
pub type SharedUploader = Arc<RwLock<Arc<dyn Uploader>>>;

/// Remote file name: `{camera_id}_{YYYYmmdd_HHMMSS_mmm}_{seq:06}.jpg`
pub fn remote_file_name(camera_id: &str, captured_at: DateTime<Utc>, sequence: u64) -> String {
    format!(
        "{}_{}_{:06}.jpg",
        camera_id,
        captured_at.format("%Y%m%d_%H%M%S_%3f"),
        sequence
    )
}

pub fn remote_final_path(remote_path: &str, camera_id: &str, captured_at: DateTime<Utc>, sequence: u64) -> String {
    let name = remote_file_name(camera_id, captured_at, sequence);
    let dir = remote_path.trim_end_matches('/');
    if dir.is_empty() {
        name
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Shared pipeline state: concurrency cap and counters
pub struct UploadPipeline {
    config: UploadConfig,
    semaphore: Arc<Semaphore>,
    counters: Arc<UploadCounters>,
    hub: Arc<StatusHub>,
}

impl UploadPipeline {
    pub fn new(config: UploadConfig, hub: Arc<StatusHub>) -> Self {
        tracing::info!(
            max_concurrent_uploads = config.max_concurrent_uploads,
            upload_timeout_sec = config.upload_timeout_seconds,
            "UploadPipeline initialized"
        );
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_uploads.max(1))),
            counters: Arc::new(UploadCounters::default()),
            config,
            hub,
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn stats(&self, queued: u64) -> UploadStats {
        self.counters.snapshot(queued)
    }

    /// Build the lane for one camera
    pub fn lane(
        &self,
        queue: Arc<ImageQueue>,
        remote_path: &str,
        uploader: SharedUploader,
        enqueued: Arc<Notify>,
        uploader_changed: Arc<Notify>,
    ) -> UploadLane {
        let camera_id = queue.camera_id().to_string();
        UploadLane {
            status: Arc::new(RwLock::new(UploadLaneStatus::new(&camera_id, remote_path))),
            backoff: BackoffState::new(self.config.backoff.clone()),
            camera_id,
            remote_path: remote_path.to_string(),
            queue,
            uploader,
            enqueued,
            uploader_changed,
            semaphore: self.semaphore.clone(),
            counters: self.counters.clone(),
            hub: self.hub.clone(),
            config: self.config.clone(),
        }
    }
}

/// What the lane does after one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaneStep {
    Delivered,
    Empty,
    Backoff(Duration),
    Cancelled,
}

/// Upload lane for one camera
pub struct UploadLane {
    camera_id: String,
    remote_path: String,
    queue: Arc<ImageQueue>,
    uploader: SharedUploader,
    enqueued: Arc<Notify>,
    uploader_changed: Arc<Notify>,
    semaphore: Arc<Semaphore>,
    counters: Arc<UploadCounters>,
    hub: Arc<StatusHub>,
    config: UploadConfig,
    backoff: BackoffState,
    status: Arc<RwLock<UploadLaneStatus>>,
}

impl UploadLane {
    pub fn status_handle(&self) -> Arc<RwLock<UploadLaneStatus>> {
        self.status.clone()
    }

    /// Drain until cancelled
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::debug!(camera_id = %self.camera_id, remote_path = %self.remote_path, "Upload lane started");
        self.status.write().await.running = true;

        let idle_poll = Duration::from_secs(self.config.idle_poll_seconds.max(1));

        loop {
            match self.step(&cancel).await {
                LaneStep::Delivered => continue,
                LaneStep::Cancelled => break,
                LaneStep::Empty => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.enqueued.notified() => {}
                        _ = tokio::time::sleep(idle_poll) => {}
                    }
                }
                LaneStep::Backoff(delay) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.uploader_changed.notified() => {
                            tracing::info!(camera_id = %self.camera_id, "Uploader changed, retrying now");
                            self.backoff.record_success();
                            self.update_backoff_status().await;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        let mut status = self.status.write().await;
        status.running = false;
        status.uploading = false;
        drop(status);
        tracing::debug!(camera_id = %self.camera_id, "Upload lane stopped");
    }

    /// Try to deliver the oldest queued image
    async fn step(&mut self, cancel: &CancellationToken) -> LaneStep {
        let image = match self.queue.dequeue().await {
            Ok(Some(image)) => image,
            Ok(None) => return LaneStep::Empty,
            Err(e) => {
                tracing::warn!(camera_id = %self.camera_id, error = %e, "Failed to read queued image");
                return LaneStep::Backoff(Duration::from_secs(self.config.idle_poll_seconds.max(1)));
            }
        };
        let sequence = image.sequence;

        let _permit = tokio::select! {
            _ = cancel.cancelled() => {
                self.queue.release(sequence).await;
                return LaneStep::Cancelled;
            }
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    self.queue.release(sequence).await;
                    return LaneStep::Cancelled;
                }
            }
        };

        self.status.write().await.uploading = true;
        let uploader = self.uploader.read().await.clone();
        let timeout = Duration::from_secs(self.config.upload_timeout_seconds.max(1));

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                self.queue.release(sequence).await;
                self.status.write().await.uploading = false;
                return LaneStep::Cancelled;
            }
            result = tokio::time::timeout(timeout, self.deliver(uploader.as_ref(), &image)) => match result {
                Ok(result) => result,
                Err(_) => Err(UploadError::Timeout(format!("no response within {:?}", timeout))),
            }
        };

        self.status.write().await.uploading = false;

        match result {
            Ok(remote_file) => {
                self.queue.complete(sequence).await;
                self.on_success(&image, remote_file).await;
                LaneStep::Delivered
            }
            Err(e) => {
                self.queue.release(sequence).await;
                LaneStep::Backoff(self.on_failure(&image, e).await)
            }
        }
    }

    /// Temp write, then rename into place
    async fn deliver(&self, uploader: &dyn Uploader, image: &QueuedImage) -> Result<String, UploadError> {
        let final_path = remote_final_path(&self.remote_path, &self.camera_id, image.captured_at, image.sequence);
        let temp_path = format!("{}{}", final_path, self.config.temp_suffix);

        uploader.upload(&temp_path, &image.data).await?;

        if let Err(e) = uploader.rename(&temp_path, &final_path).await {
            if let Err(cleanup) = uploader.remove(&temp_path).await {
                tracing::debug!(
                    camera_id = %self.camera_id,
                    path = %temp_path,
                    error = %cleanup,
                    "Temp file cleanup failed"
                );
            }
            return Err(e);
        }

        Ok(final_path)
    }

    async fn on_success(&mut self, image: &QueuedImage, remote_file: String) {
        self.backoff.record_success();
        self.counters.on_success();

        tracing::debug!(
            camera_id = %self.camera_id,
            sequence = image.sequence,
            size_bytes = image.size_bytes,
            remote = %remote_file,
            "Image delivered"
        );
        self.hub.publish(StatusEvent::UploadSucceeded {
            camera_id: self.camera_id.clone(),
            sequence: image.sequence,
            remote_path: remote_file.clone(),
        });

        let mut status = self.status.write().await;
        status.uploads_success += 1;
        status.consecutive_failures = 0;
        status.is_backing_off = false;
        status.current_delay_ms = 0;
        status.last_success_at = Some(Utc::now());
        status.last_remote_file = Some(remote_file);
        status.auth_blocked_until = None;
    }

    /// Returns the wait before the next attempt
    async fn on_failure(&mut self, image: &QueuedImage, error: UploadError) -> Duration {
        let kind = error.kind();
        self.counters.on_failure(kind);

        let (delay, auth_blocked_until) = match kind {
            UploadErrorKind::Auth => {
                let hold = Duration::from_secs(self.config.auth_retry_seconds);
                self.backoff.hold_for(hold);
                let retry_at = Utc::now() + chrono::Duration::seconds(self.config.auth_retry_seconds as i64);

                tracing::error!(
                    camera_id = %self.camera_id,
                    error = %error,
                    retry_in_sec = hold.as_secs(),
                    "Upload authentication failed; check credentials"
                );
                self.hub.publish(StatusEvent::AuthFailure {
                    camera_id: self.camera_id.clone(),
                    error: error.to_string(),
                    retry_at,
                });
                (hold, Some(retry_at))
            }
            _ => {
                let delay = self.backoff.record_failure();
                tracing::warn!(
                    camera_id = %self.camera_id,
                    sequence = image.sequence,
                    kind = ?kind,
                    error = %error,
                    consecutive_failures = self.backoff.consecutive_failures(),
                    retry_in_ms = delay.as_millis() as u64,
                    "Upload failed"
                );
                (delay, None)
            }
        };

        self.hub.publish(StatusEvent::UploadFailed {
            camera_id: self.camera_id.clone(),
            sequence: image.sequence,
            kind,
            error: error.to_string(),
        });

        let mut status = self.status.write().await;
        status.uploads_failed += 1;
        status.consecutive_failures = self.backoff.consecutive_failures();
        status.is_backing_off = true;
        status.current_delay_ms = delay.as_millis() as u64;
        status.last_error = Some(error.to_string());
        status.last_error_kind = Some(kind);
        if auth_blocked_until.is_some() {
            status.auth_blocked_until = auth_blocked_until;
        }

        delay
    }

    async fn update_backoff_status(&self) {
        let mut status = self.status.write().await;
        status.consecutive_failures = self.backoff.consecutive_failures();
        status.is_backing_off = self.backoff.is_backing_off();
        status.current_delay_ms = self.backoff.current_delay().as_millis() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackoffConfig, QueueCameraConfig};
    use crate::image_queue::{NewImage, QueueUsage};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory remote with injectable failures
    #[derive(Default)]
    struct MemoryRemote {
        files: Mutex<HashMap<String, Vec<u8>>>,
        fail_renames: AtomicUsize,
        fail_connects: AtomicUsize,
        reject_auth: AtomicBool,
        delay_ms: u64,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl MemoryRemote {
        fn names(&self) -> Vec<String> {
            let mut names: Vec<String> = self.files.lock().unwrap().keys().cloned().collect();
            names.sort();
            names
        }
    }

    #[async_trait]
    impl Uploader for MemoryRemote {
        async fn upload(&self, path: &str, data: &[u8]) -> Result<(), UploadError> {
            if self.reject_auth.load(Ordering::SeqCst) {
                return Err(UploadError::Auth("permission denied (publickey)".to_string()));
            }
            if self.fail_connects.load(Ordering::SeqCst) > 0 {
                self.fail_connects.fetch_sub(1, Ordering::SeqCst);
                return Err(UploadError::Connection("connection reset".to_string()));
            }

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            self.files.lock().unwrap().insert(path.to_string(), data.to_vec());
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        async fn rename(&self, from: &str, to: &str) -> Result<(), UploadError> {
            if self.fail_renames.load(Ordering::SeqCst) > 0 {
                self.fail_renames.fetch_sub(1, Ordering::SeqCst);
                return Err(UploadError::Connection("link dropped during rename".to_string()));
            }
            let mut files = self.files.lock().unwrap();
            let data = files
                .remove(from)
                .ok_or_else(|| UploadError::Upload(format!("no such file: {}", from)))?;
            files.insert(to.to_string(), data);
            Ok(())
        }

        async fn remove(&self, path: &str) -> Result<(), UploadError> {
            self.files.lock().unwrap().remove(path);
            Ok(())
        }

        async fn test_connection(&self) -> Result<(), UploadError> {
            Ok(())
        }
    }

    fn upload_config(max_concurrent_uploads: usize) -> UploadConfig {
        UploadConfig {
            max_concurrent_uploads,
            backoff: BackoffConfig {
                initial_seconds: 5.0,
                max_seconds: 300.0,
                multiplier: 2.0,
                jitter: false,
            },
            ..Default::default()
        }
    }

    async fn queue_with(dir: &std::path::Path, camera_id: &str, images: usize) -> Arc<ImageQueue> {
        let queue = ImageQueue::open(camera_id, dir, QueueCameraConfig::default(), Arc::new(QueueUsage::new()))
            .await
            .unwrap();
        for i in 0..images {
            queue
                .append(NewImage {
                    data: vec![i as u8 + 1; 2048],
                    captured_at: Utc::now(),
                    time_trusted: true,
                })
                .await
                .unwrap();
        }
        Arc::new(queue)
    }

    fn lane_for(
        pipeline: &UploadPipeline,
        queue: Arc<ImageQueue>,
        remote: Arc<MemoryRemote>,
    ) -> UploadLane {
        let uploader: Arc<dyn Uploader> = remote;
        pipeline.lane(
            queue,
            "site-a/front",
            Arc::new(RwLock::new(uploader)),
            Arc::new(Notify::new()),
            Arc::new(Notify::new()),
        )
    }

    #[test]
    fn test_remote_name_format() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 8, 5, 9).unwrap() + chrono::Duration::milliseconds(42);
        assert_eq!(
            remote_final_path("site-a/front/", "cam-001", at, 17),
            "site-a/front/cam-001_20240301_080509_042_000017.jpg"
        );
        assert_eq!(remote_final_path("", "cam-001", at, 17), "cam-001_20240301_080509_042_000017.jpg");
    }

    #[tokio::test]
    async fn test_failed_rename_leaves_no_final_file() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_with(dir.path(), "cam-001", 1).await;
        let remote = Arc::new(MemoryRemote::default());
        remote.fail_renames.store(1, Ordering::SeqCst);
        let pipeline = UploadPipeline::new(upload_config(2), Arc::new(StatusHub::new()));
        let mut lane = lane_for(&pipeline, queue.clone(), remote.clone());
        let cancel = CancellationToken::new();

        // Temp written, rename fails: nothing visible, image kept
        assert_eq!(lane.step(&cancel).await, LaneStep::Backoff(Duration::from_secs(5)));
        assert!(remote.names().is_empty());
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.state().await.in_flight, None);

        assert_eq!(lane.step(&cancel).await, LaneStep::Delivered);
        let names = remote.names();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("site-a/front/cam-001_"));
        assert!(names[0].ends_with("_000001.jpg"));
        assert_eq!(remote.files.lock().unwrap()[&names[0]], vec![1u8; 2048]);
        assert!(queue.is_empty().await);

        let stats = pipeline.stats(0);
        assert_eq!((stats.total, stats.success, stats.failed), (2, 1, 1));
        assert_eq!(lane.status.read().await.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_connection_failures_back_off() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_with(dir.path(), "cam-001", 1).await;
        let remote = Arc::new(MemoryRemote::default());
        remote.fail_connects.store(3, Ordering::SeqCst);
        let pipeline = UploadPipeline::new(upload_config(2), Arc::new(StatusHub::new()));
        let mut lane = lane_for(&pipeline, queue.clone(), remote);
        let cancel = CancellationToken::new();

        assert_eq!(lane.step(&cancel).await, LaneStep::Backoff(Duration::from_secs(5)));
        assert_eq!(lane.step(&cancel).await, LaneStep::Backoff(Duration::from_secs(10)));
        assert_eq!(lane.step(&cancel).await, LaneStep::Backoff(Duration::from_secs(20)));
        assert_eq!(lane.step(&cancel).await, LaneStep::Delivered);
        assert_eq!(lane.backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(lane.step(&cancel).await, LaneStep::Empty);
    }

    #[tokio::test]
    async fn test_auth_failure_holds_off_and_is_counted() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_with(dir.path(), "cam-001", 1).await;
        let remote = Arc::new(MemoryRemote::default());
        remote.reject_auth.store(true, Ordering::SeqCst);
        let hub = Arc::new(StatusHub::new());
        let mut events = hub.subscribe();
        let pipeline = UploadPipeline::new(upload_config(2), hub);
        let mut lane = lane_for(&pipeline, queue.clone(), remote);

        let step = lane.step(&CancellationToken::new()).await;
        assert_eq!(step, LaneStep::Backoff(Duration::from_secs(600)));
        assert_eq!(pipeline.stats(1).auth_failures, 1);
        assert_eq!(queue.len().await, 1);
        // Auth does not advance the failure streak
        assert_eq!(lane.backoff.consecutive_failures(), 0);

        let status = lane.status.read().await;
        assert_eq!(status.last_error_kind, Some(UploadErrorKind::Auth));
        assert!(status.auth_blocked_until.is_some());

        let first = events.try_recv().unwrap();
        assert_eq!(first.event_type(), "auth_failure");
    }

    #[tokio::test]
    async fn test_global_cap_across_lanes() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote {
            delay_ms: 30,
            ..Default::default()
        });
        let pipeline = UploadPipeline::new(upload_config(1), Arc::new(StatusHub::new()));
        let cancel = CancellationToken::new();

        let mut queues = Vec::new();
        let mut handles = Vec::new();
        for camera in ["cam-001", "cam-002", "cam-003"] {
            let queue = queue_with(dir.path(), camera, 3).await;
            let lane = lane_for(&pipeline, queue.clone(), remote.clone());
            handles.push(tokio::spawn(lane.run(cancel.clone())));
            queues.push(queue);
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let mut left = 0;
            for queue in &queues {
                left += queue.len().await;
            }
            if left == 0 || tokio::time::Instant::now() > deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(pipeline.stats(0).success, 9);
        assert_eq!(remote.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(remote.names().iter().all(|n| n.ends_with(".jpg")));
    }

    #[tokio::test]
    async fn test_cancel_mid_upload_keeps_image() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_with(dir.path(), "cam-001", 1).await;
        let remote = Arc::new(MemoryRemote {
            delay_ms: 10_000,
            ..Default::default()
        });
        let pipeline = UploadPipeline::new(upload_config(1), Arc::new(StatusHub::new()));
        let lane = lane_for(&pipeline, queue.clone(), remote.clone());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(lane.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(remote.names().iter().all(|n| !n.ends_with(".jpg")));
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.state().await.in_flight, None);
    }
}
