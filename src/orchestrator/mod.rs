//! Orchestrator - Top-level coordinator
//!
//! ## Responsibilities
//!
//! - Camera registration (queue, capture worker, upload lane per camera)
//! - Start / stop of all tasks with a bounded shutdown
//! - Aggregate status and status event subscription
//! - Runtime swap of the time authority and per-camera uploaders
//!
//! ## Design
//!
//! - Each camera's tasks run under a child of the orchestrator's cancellation
//!   token: removing one camera cancels only its tasks
//! - A camera that fails to register never affects the others

mod types;

pub use types::*;

use crate::camera_worker::{CameraWorker, CameraWorkerStatus, SharedTimeAuthority, WorkerContext};
use crate::collaborators::{
    CameraSource, PreviewCallback, SystemTimeAuthority, TimeAuthority, UploadError, UploadErrorKind,
    Uploader,
};
use crate::config::{OrchestratorConfig, MAX_DELAY_SECONDS};
use crate::error::{Error, Result};
use crate::image_queue::ImageQueue;
use crate::queue_manager::GlobalQueueManager;
use crate::resource_limiter::ResourceLimiter;
use crate::status_hub::{StatusEvent, StatusHub};
use crate::upload_pipeline::{SharedUploader, UploadLaneStatus, UploadPipeline};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

struct CameraTasks {
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
    lane: JoinHandle<()>,
}

impl CameraTasks {
    fn into_handles(self) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.lane];
        handles.extend(self.worker);
        handles
    }
}

struct CameraSlot {
    camera: Arc<dyn CameraSource>,
    options: CameraOptions,
    interval: Duration,
    preview: Option<PreviewCallback>,
    queue: Arc<ImageQueue>,
    uploader: SharedUploader,
    enqueued: Arc<Notify>,
    uploader_changed: Arc<Notify>,
    worker_status: Arc<RwLock<CameraWorkerStatus>>,
    lane_status: Arc<RwLock<UploadLaneStatus>>,
    tasks: Option<CameraTasks>,
}

struct RunState {
    cancel: CancellationToken,
    monitor: JoinHandle<()>,
    started: Instant,
    started_at: DateTime<Utc>,
}

/// Orchestrator instance
pub struct Orchestrator {
    config: OrchestratorConfig,
    limiter: Arc<ResourceLimiter>,
    queues: Arc<GlobalQueueManager>,
    uploads: UploadPipeline,
    hub: Arc<StatusHub>,
    time_authority: SharedTimeAuthority,
    cameras: RwLock<HashMap<String, CameraSlot>>,
    run: Mutex<Option<RunState>>,
}

impl Orchestrator {
    /// Create new Orchestrator
    pub fn new(config: OrchestratorConfig, limiter: Arc<ResourceLimiter>) -> Result<Self> {
        config.validate()?;

        let hub = Arc::new(StatusHub::new());
        let queues = Arc::new(GlobalQueueManager::new(config.queue.clone(), hub.clone())?);
        let uploads = UploadPipeline::new(config.upload.clone(), hub.clone());
        let authority: Arc<dyn TimeAuthority> = Arc::new(SystemTimeAuthority);

        Ok(Self {
            config,
            limiter,
            queues,
            uploads,
            hub,
            time_authority: Arc::new(RwLock::new(authority)),
            cameras: RwLock::new(HashMap::new()),
            run: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn queue_manager(&self) -> &Arc<GlobalQueueManager> {
        &self.queues
    }

    /// Status event stream
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.hub.subscribe()
    }

    pub async fn is_running(&self) -> bool {
        self.run.lock().await.is_some()
    }

    /// Register a camera; starts its tasks immediately when running
    ///
    /// `interval_seconds == 0` selects the configured default interval.
    pub async fn add_camera(
        &self,
        camera: Arc<dyn CameraSource>,
        options: CameraOptions,
        interval_seconds: u64,
        uploader: Arc<dyn Uploader>,
        preview: Option<PreviewCallback>,
    ) -> Result<()> {
        let camera_id = camera.camera_id().to_string();
        if camera_id.trim().is_empty() {
            return Err(Error::Validation("camera id must not be empty".to_string()));
        }

        let interval_seconds = if interval_seconds == 0 {
            self.config.capture.default_interval_seconds
        } else {
            interval_seconds
        };
        if interval_seconds < self.config.capture.min_interval_seconds
            || interval_seconds > MAX_DELAY_SECONDS
        {
            return Err(Error::Validation(format!(
                "interval {}s for camera {} must be between {}s and {}s",
                interval_seconds, camera_id, self.config.capture.min_interval_seconds, MAX_DELAY_SECONDS
            )));
        }

        if self.cameras.read().await.contains_key(&camera_id) {
            return Err(Error::Conflict(format!("camera already registered: {}", camera_id)));
        }

        let queue = self
            .queues
            .register(&camera_id, options.queue_override.clone())
            .await?;

        self.check_uploader(&camera_id, uploader.as_ref()).await;

        let mut slot = CameraSlot {
            camera,
            interval: Duration::from_secs(interval_seconds),
            preview,
            worker_status: Arc::new(RwLock::new(CameraWorkerStatus::new(&camera_id, interval_seconds))),
            lane_status: Arc::new(RwLock::new(UploadLaneStatus::new(&camera_id, &options.remote_path))),
            options,
            queue,
            uploader: Arc::new(RwLock::new(uploader)),
            enqueued: Arc::new(Notify::new()),
            uploader_changed: Arc::new(Notify::new()),
            tasks: None,
        };

        {
            let run = self.run.lock().await;
            let mut cameras = self.cameras.write().await;
            if cameras.contains_key(&camera_id) {
                drop(cameras);
                drop(run);
                self.queues.unregister(&camera_id).await;
                return Err(Error::Conflict(format!("camera already registered: {}", camera_id)));
            }
            if let Some(run) = run.as_ref() {
                self.spawn_tasks(&mut slot, &run.cancel);
            }
            cameras.insert(camera_id.clone(), slot);
        }

        tracing::info!(
            camera_id = %camera_id,
            interval_sec = interval_seconds,
            "Camera added"
        );
        self.hub.publish(StatusEvent::CameraAdded { camera_id });
        Ok(())
    }

    /// Cancel a camera's tasks and deregister it; queued files stay on disk
    pub async fn remove_camera(&self, camera_id: &str) -> Result<()> {
        let slot = self
            .cameras
            .write()
            .await
            .remove(camera_id)
            .ok_or_else(|| Error::NotFound(format!("camera {}", camera_id)))?;

        if let Some(tasks) = slot.tasks {
            tasks.cancel.cancel();
            self.join_with_timeout(tasks.into_handles()).await;
        }

        self.queues.unregister(camera_id).await;
        self.limiter.remove_camera(camera_id).await;

        tracing::info!(camera_id = %camera_id, "Camera removed");
        self.hub.publish(StatusEvent::CameraRemoved {
            camera_id: camera_id.to_string(),
        });
        Ok(())
    }

    /// Start every registered camera and the queue monitor
    pub async fn start(&self) -> Result<()> {
        let mut run = self.run.lock().await;
        if run.is_some() {
            return Err(Error::Conflict("orchestrator already running".to_string()));
        }

        let cancel = CancellationToken::new();
        let monitor = self.queues.spawn_monitor(cancel.child_token());

        let mut cameras = self.cameras.write().await;
        for slot in cameras.values_mut() {
            self.spawn_tasks(slot, &cancel);
        }
        let count = cameras.len();
        drop(cameras);

        *run = Some(RunState {
            cancel,
            monitor,
            started: Instant::now(),
            started_at: Utc::now(),
        });

        tracing::info!(cameras = count, "Orchestrator started");
        Ok(())
    }

    /// Cancel and await every task within the shutdown timeout
    pub async fn stop(&self) {
        let Some(state) = self.run.lock().await.take() else {
            return;
        };

        tracing::info!("Stopping orchestrator");
        state.cancel.cancel();

        let mut handles = vec![state.monitor];
        {
            let mut cameras = self.cameras.write().await;
            for slot in cameras.values_mut() {
                if let Some(tasks) = slot.tasks.take() {
                    handles.extend(tasks.into_handles());
                }
            }
        }

        self.join_with_timeout(handles).await;
        tracing::info!("Orchestrator stopped");
    }

    /// Aggregate status snapshot
    pub async fn get_status(&self) -> OrchestratorStatus {
        let (running, started_at, uptime_seconds) = match self.run.lock().await.as_ref() {
            Some(state) => (true, Some(state.started_at), state.started.elapsed().as_secs()),
            None => (false, None, 0),
        };

        let mut cameras = BTreeMap::new();
        {
            let slots = self.cameras.read().await;
            for (camera_id, slot) in slots.iter() {
                let capture = slot.worker_status.read().await.clone();
                let upload = slot.lane_status.read().await.clone();
                let queue = slot.queue.state().await;

                cameras.insert(
                    camera_id.clone(),
                    CameraStatus {
                        camera_id: camera_id.clone(),
                        enabled: slot.options.enabled,
                        capturing: capture.capturing,
                        uploading: upload.uploading,
                        is_backing_off: capture.is_backing_off || upload.is_backing_off,
                        degraded: capture.degraded,
                        paused: capture.paused,
                        last_success: capture.last_success_at,
                        last_error: capture.last_error.clone().or_else(|| upload.last_error.clone()),
                        capture_stats: capture,
                        queue_stats: queue,
                        upload,
                    },
                );
            }
        }

        OrchestratorStatus {
            running,
            started_at,
            uptime_seconds,
            cameras,
            upload_stats: self.uploads.stats(self.queues.total_images()),
            global_queue_stats: self.queues.global_stats().await,
            resource_limiter: self.limiter.stats().await,
            time_info: TimeInfo {
                time_healthy: self.time_authority.read().await.is_time_healthy(),
            },
        }
    }

    /// Swap the clock-health source for all cameras
    pub async fn set_time_authority(&self, authority: Arc<dyn TimeAuthority>) {
        let healthy = authority.is_time_healthy();
        *self.time_authority.write().await = authority;
        tracing::info!(time_healthy = healthy, "Time authority replaced");
    }

    /// Swap a camera's uploader; a lane waiting out a backoff retries at once
    pub async fn set_uploader(&self, camera_id: &str, uploader: Arc<dyn Uploader>) -> Result<()> {
        let (shared, changed) = {
            let cameras = self.cameras.read().await;
            let slot = cameras
                .get(camera_id)
                .ok_or_else(|| Error::NotFound(format!("camera {}", camera_id)))?;
            (slot.uploader.clone(), slot.uploader_changed.clone())
        };

        self.check_uploader(camera_id, uploader.as_ref()).await;
        *shared.write().await = uploader;
        changed.notify_one();

        tracing::info!(camera_id = %camera_id, "Uploader replaced");
        Ok(())
    }

    fn spawn_tasks(&self, slot: &mut CameraSlot, parent: &CancellationToken) {
        let cancel = parent.child_token();

        let lane = self.uploads.lane(
            slot.queue.clone(),
            &slot.options.remote_path,
            slot.uploader.clone(),
            slot.enqueued.clone(),
            slot.uploader_changed.clone(),
        );
        slot.lane_status = lane.status_handle();
        let lane = tokio::spawn(lane.run(cancel.clone()));

        let worker = if slot.options.enabled {
            let worker = CameraWorker::new(
                self.worker_context(),
                slot.camera.clone(),
                slot.options.processor.clone(),
                slot.queue.clone(),
                slot.interval,
                slot.preview.clone(),
                slot.enqueued.clone(),
            );
            slot.worker_status = worker.status_handle();
            Some(tokio::spawn(worker.run(cancel.clone())))
        } else {
            None
        };

        slot.tasks = Some(CameraTasks { cancel, worker, lane });
    }

    fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            limiter: self.limiter.clone(),
            queues: self.queues.clone(),
            hub: self.hub.clone(),
            time_authority: self.time_authority.clone(),
            capture: self.config.capture.clone(),
            backoff: self.config.backoff.clone(),
            degraded: self.config.degraded.clone(),
        }
    }

    /// Connection test; failure is reported but never rejects the camera
    async fn check_uploader(&self, camera_id: &str, uploader: &dyn Uploader) {
        let timeout = Duration::from_secs(self.config.upload.upload_timeout_seconds.max(1));
        let result = match tokio::time::timeout(timeout, uploader.test_connection()).await {
            Ok(result) => result,
            Err(_) => Err(UploadError::Timeout(format!(
                "connection test gave no answer within {}s",
                timeout.as_secs()
            ))),
        };

        if let Err(e) = result {
            tracing::warn!(
                camera_id = %camera_id,
                kind = ?e.kind(),
                error = %e,
                "Uploader connection test failed"
            );
            if e.kind() == UploadErrorKind::Auth {
                self.hub.publish(StatusEvent::AuthFailure {
                    camera_id: camera_id.to_string(),
                    error: e.to_string(),
                    retry_at: Utc::now(),
                });
            }
        }
    }

    async fn join_with_timeout(&self, handles: Vec<JoinHandle<()>>) {
        let aborts: Vec<AbortHandle> = handles.iter().map(|h| h.abort_handle()).collect();
        let timeout = self.config.shutdown_timeout();

        if tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!(
                timeout_sec = timeout.as_secs(),
                tasks = aborts.len(),
                "Tasks did not stop in time, aborting"
            );
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        CaptureError, DirectoryUploader, ImageProcessor, ManualTimeAuthority, ProcessingError, UploadError,
    };
    use crate::config::{QueueCameraConfig, ResourceLimits};
    use crate::resource_limiter::ResourceClass;
    use async_trait::async_trait;

    struct StaticCamera(String);

    #[async_trait]
    impl CameraSource for StaticCamera {
        fn camera_id(&self) -> &str {
            &self.0
        }

        async fn capture(&self, _timeout: Duration) -> std::result::Result<Vec<u8>, CaptureError> {
            Ok(vec![0xD8; 512])
        }
    }

    struct LockedOut;

    #[async_trait]
    impl Uploader for LockedOut {
        async fn upload(&self, _path: &str, _data: &[u8]) -> std::result::Result<(), UploadError> {
            Err(UploadError::Auth("bad password".to_string()))
        }

        async fn rename(&self, _from: &str, _to: &str) -> std::result::Result<(), UploadError> {
            Err(UploadError::Auth("bad password".to_string()))
        }

        async fn remove(&self, _path: &str) -> std::result::Result<(), UploadError> {
            Ok(())
        }

        async fn test_connection(&self) -> std::result::Result<(), UploadError> {
            Err(UploadError::Auth("bad password".to_string()))
        }
    }

    struct HungRemote;

    #[async_trait]
    impl Uploader for HungRemote {
        async fn upload(&self, _path: &str, _data: &[u8]) -> std::result::Result<(), UploadError> {
            Ok(())
        }

        async fn rename(&self, _from: &str, _to: &str) -> std::result::Result<(), UploadError> {
            Ok(())
        }

        async fn remove(&self, _path: &str) -> std::result::Result<(), UploadError> {
            Ok(())
        }

        async fn test_connection(&self) -> std::result::Result<(), UploadError> {
            std::future::pending().await
        }
    }

    struct HangingCamera(String);

    #[async_trait]
    impl CameraSource for HangingCamera {
        fn camera_id(&self) -> &str {
            &self.0
        }

        async fn capture(&self, _timeout: Duration) -> std::result::Result<Vec<u8>, CaptureError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(vec![1])
        }
    }

    struct StuckProcessor;

    #[async_trait]
    impl ImageProcessor for StuckProcessor {
        async fn process(&self, _data: Vec<u8>) -> std::result::Result<Vec<u8>, ProcessingError> {
            std::future::pending().await
        }
    }

    fn orchestrator(base: &std::path::Path) -> Orchestrator {
        let mut config = OrchestratorConfig::default();
        config.queue.base_path = base.join("queue");
        config.shutdown_timeout_seconds = 2;
        let limiter = Arc::new(ResourceLimiter::new(ResourceLimits::default()).unwrap());
        Orchestrator::new(config, limiter).unwrap()
    }

    fn camera(id: &str) -> Arc<dyn CameraSource> {
        Arc::new(StaticCamera(id.to_string()))
    }

    #[tokio::test]
    async fn test_add_camera_validation() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let uploader: Arc<dyn Uploader> = Arc::new(DirectoryUploader::new(dir.path()));

        let too_fast = orch
            .add_camera(camera("cam-001"), CameraOptions::new("front"), 1, uploader.clone(), None)
            .await;
        assert!(matches!(too_fast, Err(Error::Validation(_))));
        let too_slow = orch
            .add_camera(
                camera("cam-001"),
                CameraOptions::new("front"),
                MAX_DELAY_SECONDS + 1,
                uploader.clone(),
                None,
            )
            .await;
        assert!(matches!(too_slow, Err(Error::Validation(_))));

        orch.add_camera(camera("cam-001"), CameraOptions::new("front"), 0, uploader.clone(), None)
            .await
            .unwrap();
        let duplicate = orch
            .add_camera(camera("cam-001"), CameraOptions::new("front"), 60, uploader.clone(), None)
            .await;
        assert!(matches!(duplicate, Err(Error::Conflict(_))));

        let bad_override = QueueCameraConfig {
            max_files: 2,
            protect_newest: 2,
            protect_oldest: 1,
            ..Default::default()
        };
        let result = orch
            .add_camera(
                camera("cam-002"),
                CameraOptions::new("side").with_queue_override(bad_override),
                60,
                uploader,
                None,
            )
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));

        let status = orch.get_status().await;
        assert_eq!(status.cameras.len(), 1);
        assert_eq!(status.cameras["cam-001"].capture_stats.interval_seconds, 60);
    }

    #[tokio::test]
    async fn test_start_stop_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let remote = dir.path().join("remote");
        std::fs::create_dir_all(&remote).unwrap();
        let orch = orchestrator(dir.path());
        let mut events = orch.subscribe();
        let uploader: Arc<dyn Uploader> = Arc::new(DirectoryUploader::new(&remote));

        orch.add_camera(camera("cam-001"), CameraOptions::new("front"), 60, uploader.clone(), None)
            .await
            .unwrap();
        orch.start().await.unwrap();
        assert!(matches!(orch.start().await, Err(Error::Conflict(_))));

        // Added while running: starts straight away
        orch.add_camera(camera("cam-002"), CameraOptions::new("side"), 60, uploader, None)
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let status = orch.get_status().await;
            if status.upload_stats.success >= 2 || tokio::time::Instant::now() > deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let status = orch.get_status().await;
        assert!(status.running);
        assert_eq!(status.upload_stats.success, 2);
        assert!(std::fs::read_dir(remote.join("front")).unwrap().count() == 1);

        orch.remove_camera("cam-002").await.unwrap();
        assert!(matches!(orch.remove_camera("cam-002").await, Err(Error::NotFound(_))));

        orch.stop().await;
        let status = orch.get_status().await;
        assert!(!status.running);
        assert!(!status.cameras["cam-001"].capture_stats.running);

        let mut removed = false;
        while let Ok(event) = events.try_recv() {
            if let StatusEvent::CameraRemoved { camera_id } = event {
                removed = camera_id == "cam-002";
            }
        }
        assert!(removed);
    }

    #[tokio::test]
    async fn test_hot_swaps() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let mut events = orch.subscribe();

        orch.add_camera(camera("cam-001"), CameraOptions::new("front"), 60, Arc::new(LockedOut), None)
            .await
            .unwrap();
        // Rejected credentials are reported, not fatal
        let event = events.try_recv().unwrap();
        assert_eq!(event.event_type(), "auth_failure");

        let fixed: Arc<dyn Uploader> = Arc::new(DirectoryUploader::new(dir.path()));
        orch.set_uploader("cam-001", fixed.clone()).await.unwrap();
        assert!(matches!(
            orch.set_uploader("cam-404", fixed).await,
            Err(Error::NotFound(_))
        ));

        assert!(orch.get_status().await.time_info.time_healthy);
        orch.set_time_authority(Arc::new(ManualTimeAuthority::new(false))).await;
        assert!(!orch.get_status().await.time_info.time_healthy);
    }

    #[tokio::test]
    async fn test_unanswered_connection_test_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OrchestratorConfig::default();
        config.queue.base_path = dir.path().join("queue");
        config.upload.upload_timeout_seconds = 1;
        let limiter = Arc::new(ResourceLimiter::new(ResourceLimits::default()).unwrap());
        let orch = Orchestrator::new(config, limiter).unwrap();

        let added = tokio::time::timeout(
            Duration::from_secs(5),
            orch.add_camera(camera("cam-001"), CameraOptions::new("front"), 60, Arc::new(HungRemote), None),
        )
        .await;
        assert!(matches!(added, Ok(Ok(()))));

        let swapped = tokio::time::timeout(
            Duration::from_secs(5),
            orch.set_uploader("cam-001", Arc::new(HungRemote)),
        )
        .await;
        assert!(matches!(swapped, Ok(Ok(()))));
        assert_eq!(orch.get_status().await.cameras.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_camera_interrupts_hung_work() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OrchestratorConfig::default();
        config.queue.base_path = dir.path().join("queue");
        config.shutdown_timeout_seconds = 10;
        let limiter = Arc::new(ResourceLimiter::new(ResourceLimits::default()).unwrap());
        let orch = Orchestrator::new(config, limiter.clone()).unwrap();
        let uploader: Arc<dyn Uploader> = Arc::new(DirectoryUploader::new(dir.path()));
        let max = limiter.max_permits(ResourceClass::ImageProcessing);

        orch.add_camera(
            camera("cam-001"),
            CameraOptions::new("front").with_processor(Arc::new(StuckProcessor)),
            60,
            uploader.clone(),
            None,
        )
        .await
        .unwrap();
        orch.add_camera(
            Arc::new(HangingCamera("cam-002".to_string())),
            CameraOptions::new("side"),
            60,
            uploader,
            None,
        )
        .await
        .unwrap();
        orch.start().await.unwrap();

        // cam-001 ends up parked inside the processor holding its permit
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while limiter.available(ResourceClass::ImageProcessing) != max - 1
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(limiter.available(ResourceClass::ImageProcessing), max - 1);

        for id in ["cam-001", "cam-002"] {
            let started = Instant::now();
            orch.remove_camera(id).await.unwrap();
            assert!(started.elapsed() < Duration::from_secs(1), "{} took {:?}", id, started.elapsed());
        }
        assert_eq!(limiter.available(ResourceClass::ImageProcessing), max);
        assert!(orch.get_status().await.cameras.is_empty());

        orch.stop().await;
    }
}
