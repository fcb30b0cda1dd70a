//! CameraWorker - Per-camera capture loop
//!
//! ## Responsibilities
//!
//! - Capture on the camera's interval (stretched in degraded mode)
//! - Process under a resource limiter permit
//! - Enqueue through the global ceiling and wake the upload lane
//! - Feed failures into backoff / degraded mode
//! - Pause enqueuing under queue back-pressure, probing the camera meanwhile
//!
//! ## Design
//!
//! - One tokio task per camera; captures never overlap
//! - The worker owns its policy state; status is published through a shared
//!   snapshot that readers lock briefly
//! - Cancellation is checked at every suspension point

mod types;

pub use types::*;

use crate::backoff_policy::{
    BackoffState, DegradedModeState, DegradedTransition, PauseGate, PauseReason, PauseTransition,
};
use crate::collaborators::{
    CameraSource, CaptureError, ImageProcessor, PreviewCallback, TimeAuthority,
};
use crate::config::{BackoffConfig, CaptureConfig, DegradedModeConfig};
use crate::error::{Error, Result};
use crate::image_queue::{HealthBucket, ImageQueue, NewImage};
use crate::queue_manager::GlobalQueueManager;
use crate::resource_limiter::{ResourceClass, ResourceLimiter};
use crate::status_hub::{StatusEvent, StatusHub};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Swappable time authority shared by all workers
pub type SharedTimeAuthority = Arc<RwLock<Arc<dyn TimeAuthority>>>;

/// Dependencies shared by every worker
#[derive(Clone)]
pub struct WorkerContext {
    pub limiter: Arc<ResourceLimiter>,
    pub queues: Arc<GlobalQueueManager>,
    pub hub: Arc<StatusHub>,
    pub time_authority: SharedTimeAuthority,
    pub capture: CaptureConfig,
    pub backoff: BackoffConfig,
    pub degraded: DegradedModeConfig,
}

#[derive(Debug, Clone, Copy)]
enum FailureKind {
    Capture,
    Processing,
    Storage,
}

/// CameraWorker instance
pub struct CameraWorker {
    camera_id: String,
    camera: Arc<dyn CameraSource>,
    processor: Arc<dyn ImageProcessor>,
    queue: Arc<ImageQueue>,
    preview: Option<PreviewCallback>,
    preview_busy: Arc<AtomicBool>,
    interval: Duration,
    ctx: WorkerContext,
    status: Arc<RwLock<CameraWorkerStatus>>,
    upload_notify: Arc<Notify>,
    backoff: BackoffState,
    degraded: DegradedModeState,
    pause: PauseGate,
}

impl CameraWorker {
    pub fn new(
        ctx: WorkerContext,
        camera: Arc<dyn CameraSource>,
        processor: Arc<dyn ImageProcessor>,
        queue: Arc<ImageQueue>,
        interval: Duration,
        preview: Option<PreviewCallback>,
        upload_notify: Arc<Notify>,
    ) -> Self {
        let camera_id = camera.camera_id().to_string();
        let status = CameraWorkerStatus::new(&camera_id, interval.as_secs());

        Self {
            backoff: BackoffState::new(ctx.backoff.clone()),
            degraded: DegradedModeState::new(ctx.degraded.clone()),
            pause: PauseGate::new(),
            camera_id,
            camera,
            processor,
            queue,
            preview,
            preview_busy: Arc::new(AtomicBool::new(false)),
            interval,
            ctx,
            status: Arc::new(RwLock::new(status)),
            upload_notify,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn status_handle(&self) -> Arc<RwLock<CameraWorkerStatus>> {
        self.status.clone()
    }

    /// Run until cancelled; the first capture happens immediately
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(
            camera_id = %self.camera_id,
            interval_sec = self.interval.as_secs(),
            "Camera worker started"
        );
        self.update(|s| {
            s.running = true;
            s.phase = WorkerPhase::Idle;
        })
        .await;

        let mut next = Instant::now();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(next) => {}
            }

            let delay = self.tick(&cancel).await;
            if cancel.is_cancelled() {
                break;
            }

            next = Instant::now() + delay;
            let next_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            self.update(|s| s.next_capture_at = Some(next_at)).await;
        }

        self.update(|s| {
            s.running = false;
            s.capturing = false;
            s.phase = WorkerPhase::Stopped;
            s.next_capture_at = None;
        })
        .await;
        tracing::info!(camera_id = %self.camera_id, "Camera worker stopped");
    }

    /// One scheduling step; returns the wait before the next one
    async fn tick(&mut self, cancel: &CancellationToken) -> Duration {
        if self.pause.is_paused() {
            let occupancy = self.queue.occupancy().await;
            let resume_threshold = self.queue.config().resume_threshold;
            match self
                .pause
                .evaluate(occupancy, resume_threshold, self.ctx.queues.has_room())
            {
                Some(PauseTransition::Resumed) => {
                    tracing::info!(
                        camera_id = %self.camera_id,
                        occupancy = occupancy,
                        "Capture resumed"
                    );
                    self.ctx.hub.publish(StatusEvent::CaptureResumed {
                        camera_id: self.camera_id.clone(),
                        occupancy,
                    });
                    self.update(|s| {
                        s.paused = false;
                        s.pause_reason = None;
                        s.paused_since = None;
                        s.phase = WorkerPhase::Idle;
                    })
                    .await;
                }
                _ => return self.probe(cancel).await,
            }
        }

        let time_healthy = self.time_healthy().await;
        if self.ctx.capture.require_time_sync && !time_healthy {
            tracing::warn!(camera_id = %self.camera_id, "Clock not synchronized, capture skipped");
            self.update(|s| {
                s.last_error = Some("clock not synchronized; capture skipped".to_string());
                s.last_error_at = Some(Utc::now());
                s.stats.skipped_time_sync += 1;
            })
            .await;
            return self.degraded.effective_interval(self.interval);
        }

        let captured_at = Utc::now();
        self.update(|s| {
            s.phase = WorkerPhase::Capturing;
            s.capturing = true;
            s.last_attempt_at = Some(captured_at);
            s.stats.attempts += 1;
        })
        .await;

        let raw = match self.capture_once(cancel).await {
            Some(Ok(raw)) => raw,
            Some(Err(e)) => return self.on_failure(FailureKind::Capture, e.to_string()).await,
            None => return Duration::ZERO,
        };

        tracing::trace!(camera_id = %self.camera_id, size_bytes = raw.len(), "Image captured");
        self.update(|s| {
            s.stats.captured += 1;
            s.phase = WorkerPhase::Processing;
        })
        .await;

        self.send_preview(&raw, captured_at).await;

        let processed = match self.process(raw, cancel).await {
            Ok(processed) => processed,
            Err(Error::Cancelled(_)) => return Duration::ZERO,
            Err(e) => return self.on_failure(FailureKind::Processing, e.to_string()).await,
        };

        let (captured_at, time_trusted) = if time_healthy {
            (captured_at, true)
        } else {
            let embedded = self.embedded_time(&processed, cancel).await;
            (embedded.unwrap_or(captured_at), false)
        };

        self.update(|s| s.phase = WorkerPhase::Enqueuing).await;

        let image = NewImage {
            data: processed,
            captured_at,
            time_trusted,
        };
        match self.ctx.queues.enqueue(&self.camera_id, image).await {
            Ok(outcome) => {
                self.on_success().await;
                self.update(|s| s.stats.enqueued += 1).await;
                self.upload_notify.notify_one();

                if self.queue.config().pause_capture_on_critical
                    && outcome.peak_bucket == HealthBucket::Critical
                {
                    self.enter_pause(PauseReason::QueueCritical, outcome.state.occupancy)
                        .await;
                }
                self.degraded.effective_interval(self.interval)
            }
            Err(Error::QueueFull { .. }) => {
                let occupancy = self.queue.occupancy().await;
                self.update(|s| {
                    s.stats.rejected_full += 1;
                    s.capturing = false;
                })
                .await;
                self.enter_pause(PauseReason::QueueFull, occupancy).await;
                self.degraded.effective_interval(self.interval)
            }
            Err(e) => {
                tracing::error!(
                    camera_id = %self.camera_id,
                    error_code = e.error_code(),
                    error = %e,
                    "Failed to enqueue image"
                );
                self.on_failure(FailureKind::Storage, e.to_string()).await
            }
        }
    }

    /// Paused: capture once to track camera health, enqueue nothing
    async fn probe(&mut self, cancel: &CancellationToken) -> Duration {
        let slow = self
            .interval
            .mul_f64(self.ctx.degraded.slow_interval_multiplier.max(1.0));

        self.update(|s| {
            s.phase = WorkerPhase::Paused;
            s.last_attempt_at = Some(Utc::now());
            s.stats.probes += 1;
        })
        .await;

        let wait = match self.capture_once(cancel).await {
            None => return Duration::ZERO,
            Some(Ok(_)) => {
                self.on_success().await;
                slow
            }
            Some(Err(e)) => self
                .on_failure(FailureKind::Capture, e.to_string())
                .await
                .max(slow),
        };

        tracing::debug!(
            camera_id = %self.camera_id,
            next_probe_sec = wait.as_secs(),
            "Capture paused, camera probed"
        );
        self.update(|s| s.phase = WorkerPhase::Paused).await;
        wait
    }

    /// Capture with the worker-enforced timeout; `None` when cancelled
    async fn capture_once(
        &self,
        cancel: &CancellationToken,
    ) -> Option<std::result::Result<Vec<u8>, CaptureError>> {
        let timeout = self.ctx.capture.timeout();
        tokio::select! {
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(timeout, self.camera.capture(timeout)) => Some(match result {
                Ok(Ok(bytes)) if bytes.is_empty() => {
                    Err(CaptureError::BadResponse("empty image".to_string()))
                }
                Ok(other) => other,
                Err(_) => Err(CaptureError::Timeout(timeout)),
            }),
        }
    }

    /// One preview call in flight at most; frames arriving meanwhile are skipped
    async fn send_preview(&self, raw: &[u8], captured_at: DateTime<Utc>) {
        let Some(preview) = &self.preview else {
            return;
        };
        if self
            .preview_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::trace!(camera_id = %self.camera_id, "Preview busy, frame skipped");
            self.update(|s| s.stats.previews_skipped += 1).await;
            return;
        }

        let preview = preview.clone();
        let slot = PreviewSlot(self.preview_busy.clone());
        let bytes = raw.to_vec();
        tokio::task::spawn_blocking(move || {
            let _slot = slot;
            preview(bytes, captured_at);
        });
    }

    async fn process(&self, raw: Vec<u8>, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let _permit = self
            .ctx
            .limiter
            .acquire(ResourceClass::ImageProcessing, &self.camera_id, cancel)
            .await?;
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled(format!(
                "processing for camera {}",
                self.camera_id
            ))),
            result = self.processor.process(raw) => Ok(result?),
        }
    }

    /// Capture time embedded by the camera, read under a metadata permit
    async fn embedded_time(&self, data: &[u8], cancel: &CancellationToken) -> Option<DateTime<Utc>> {
        let _permit = match self
            .ctx
            .limiter
            .acquire(ResourceClass::Metadata, &self.camera_id, cancel)
            .await
        {
            Ok(permit) => permit,
            Err(e) => {
                tracing::debug!(camera_id = %self.camera_id, error = %e, "Metadata permit unavailable");
                return None;
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => None,
            at = self.processor.capture_time(data) => at,
        }
    }

    async fn time_healthy(&self) -> bool {
        self.ctx.time_authority.read().await.is_time_healthy()
    }

    async fn on_success(&mut self) {
        self.backoff.record_success();

        if let Some(DegradedTransition::Exited) = self.degraded.on_success() {
            self.ctx
                .limiter
                .set_camera_cap(&self.camera_id, self.ctx.limiter.uncapped())
                .await;
            tracing::info!(camera_id = %self.camera_id, "Degraded mode exited");
            self.ctx.hub.publish(StatusEvent::DegradedExited {
                camera_id: self.camera_id.clone(),
            });
        }

        let effective = self.degraded.effective_interval(self.interval);
        let paused = self.pause.is_paused();
        self.update(|s| {
            s.last_success_at = Some(Utc::now());
            s.consecutive_failures = 0;
            s.is_backing_off = false;
            s.current_delay_ms = 0;
            s.degraded = false;
            s.degraded_since = None;
            s.capturing = false;
            s.effective_interval_seconds = effective.as_secs_f64();
            s.phase = if paused { WorkerPhase::Paused } else { WorkerPhase::Idle };
        })
        .await;
    }

    async fn on_failure(&mut self, kind: FailureKind, message: String) -> Duration {
        let delay = self.backoff.record_failure();
        let failures = self.backoff.consecutive_failures();

        if let Some(DegradedTransition::Entered) = self.degraded.on_failure(failures) {
            let cap = self.degraded.permit_cap(self.ctx.limiter.uncapped());
            self.ctx.limiter.set_camera_cap(&self.camera_id, cap).await;
            tracing::warn!(
                camera_id = %self.camera_id,
                consecutive_failures = failures,
                permit_cap = cap,
                "Degraded mode entered"
            );
            self.ctx.hub.publish(StatusEvent::DegradedEntered {
                camera_id: self.camera_id.clone(),
                consecutive_failures: failures,
            });
        }

        let effective = self.degraded.effective_interval(self.interval);
        let wait = if self.degraded.is_active() {
            delay.max(effective)
        } else {
            delay
        };

        tracing::warn!(
            camera_id = %self.camera_id,
            kind = ?kind,
            error = %message,
            consecutive_failures = failures,
            retry_in_ms = wait.as_millis() as u64,
            "Capture failed"
        );
        self.ctx.hub.publish(StatusEvent::CaptureFailed {
            camera_id: self.camera_id.clone(),
            error: message.clone(),
            consecutive_failures: failures,
            retry_in_ms: wait.as_millis() as u64,
        });

        let degraded = self.degraded.is_active();
        let degraded_since = self.degraded.entered_at();
        self.update(|s| {
            s.error_count += 1;
            s.last_error = Some(message);
            s.last_error_at = Some(Utc::now());
            s.consecutive_failures = failures;
            s.is_backing_off = true;
            s.current_delay_ms = wait.as_millis() as u64;
            s.degraded = degraded;
            s.degraded_since = degraded_since;
            s.effective_interval_seconds = effective.as_secs_f64();
            s.capturing = false;
            s.phase = WorkerPhase::BackoffWait;
            match kind {
                FailureKind::Capture => s.stats.capture_failures += 1,
                FailureKind::Processing => s.stats.processing_failures += 1,
                FailureKind::Storage => s.stats.storage_failures += 1,
            }
        })
        .await;

        wait
    }

    async fn enter_pause(&mut self, reason: PauseReason, occupancy: f64) {
        if let Some(PauseTransition::Paused) = self.pause.pause(reason) {
            tracing::warn!(
                camera_id = %self.camera_id,
                reason = ?reason,
                occupancy = occupancy,
                "Capture paused by queue back-pressure"
            );
            self.ctx.hub.publish(StatusEvent::CapturePaused {
                camera_id: self.camera_id.clone(),
                reason,
                occupancy,
            });
            let since = self.pause.paused_since();
            self.update(|s| {
                s.paused = true;
                s.pause_reason = Some(reason);
                s.paused_since = since;
                s.phase = WorkerPhase::Paused;
            })
            .await;
        }
    }

    async fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut CameraWorkerStatus),
    {
        let mut status = self.status.write().await;
        f(&mut status);
    }
}

/// Clears the preview in-flight flag when the call returns or panics
struct PreviewSlot(Arc<AtomicBool>);

impl Drop for PreviewSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
