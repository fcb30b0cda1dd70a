//! GlobalQueueManager - System-wide queue ceiling
//!
//! ## Responsibilities
//!
//! - Registry of per-camera queues sharing one storage pool
//! - Reject enqueues once the byte ceiling is reached
//! - Emergency thinning across all cameras (ceiling or memory pressure)
//! - Periodic memory/filesystem check and per-queue thinning
//! - Aggregate queue statistics
//!
//! ## Design
//!
//! - Queue writes go through the owning camera; the manager only reads and evicts
//! - Emergency thinning is serialized by its own lock; per-camera appends are not
//! - Emergency order: globally oldest unprotected images first, protected ones
//!   only while still over the ceiling

mod monitor;

pub use monitor::{SysinfoProbe, SystemProbe, SystemSample};

use crate::config::{QueueCameraConfig, QueueGlobalConfig};
use crate::error::{Error, Result};
use crate::image_queue::{
    EnqueueOutcome, EvictedImage, EvictionReason, ImageQueue, NewImage, QueueEntry, QueueUsage,
};
use crate::status_hub::{StatusEvent, StatusHub};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const MB: u64 = 1024 * 1024;

/// Aggregate queue statistics
#[derive(Debug, Clone, Serialize)]
pub struct GlobalQueueStats {
    pub total_images: u64,
    pub total_size_mb: f64,
    pub max_total_mb: u64,
    pub memory_usage_mb: f64,
    pub memory_limit_mb: u64,
    pub filesystem_free_mb: f64,
    pub filesystem_used_mb: f64,
    pub queue_in_memory: bool,
    pub cameras: usize,
    pub emergency_thinning_runs: u64,
}

/// What triggered an emergency thinning run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureSource {
    Ceiling,
    Memory,
}

/// GlobalQueueManager instance
pub struct GlobalQueueManager {
    config: QueueGlobalConfig,
    usage: Arc<QueueUsage>,
    queues: RwLock<HashMap<String, Arc<ImageQueue>>>,
    thin_lock: Mutex<()>,
    probe: Arc<dyn SystemProbe>,
    last_sample: RwLock<Option<SystemSample>>,
    hub: Arc<StatusHub>,
    emergency_runs: AtomicU64,
}

impl GlobalQueueManager {
    pub fn new(config: QueueGlobalConfig, hub: Arc<StatusHub>) -> Result<Self> {
        Self::with_probe(config, hub, Arc::new(SysinfoProbe::new()))
    }

    pub fn with_probe(
        config: QueueGlobalConfig,
        hub: Arc<StatusHub>,
        probe: Arc<dyn SystemProbe>,
    ) -> Result<Self> {
        config.validate()?;

        tracing::info!(
            base_path = %config.base_path.display(),
            max_total_mb = config.max_total_mb,
            memory_limit_mb = config.memory_limit_mb,
            "GlobalQueueManager initialized"
        );

        Ok(Self {
            config,
            usage: Arc::new(QueueUsage::new()),
            queues: RwLock::new(HashMap::new()),
            thin_lock: Mutex::new(()),
            probe,
            last_sample: RwLock::new(None),
            hub,
            emergency_runs: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &QueueGlobalConfig {
        &self.config
    }

    /// Open (or recover) a camera's queue
    ///
    /// `queue_override` replaces the global defaults entirely.
    pub async fn register(
        &self,
        camera_id: &str,
        queue_override: Option<QueueCameraConfig>,
    ) -> Result<Arc<ImageQueue>> {
        if self.queues.read().await.contains_key(camera_id) {
            return Err(Error::Conflict(format!("queue already registered: {}", camera_id)));
        }

        let config = queue_override.unwrap_or_else(|| self.config.defaults.clone());
        let queue = Arc::new(
            ImageQueue::open(camera_id, &self.config.base_path, config, self.usage.clone()).await?,
        );

        let mut queues = self.queues.write().await;
        if queues.contains_key(camera_id) {
            queue.close().await;
            return Err(Error::Conflict(format!("queue already registered: {}", camera_id)));
        }
        queues.insert(camera_id.to_string(), queue.clone());
        drop(queues);

        tracing::debug!(camera_id = %camera_id, "Queue registered");
        Ok(queue)
    }

    /// Deregister a queue; its files stay on disk
    pub async fn unregister(&self, camera_id: &str) -> Option<Arc<ImageQueue>> {
        let removed = self.queues.write().await.remove(camera_id);
        if let Some(queue) = &removed {
            queue.close().await;
            tracing::debug!(camera_id = %camera_id, "Queue unregistered");
        }
        removed
    }

    pub async fn get(&self, camera_id: &str) -> Option<Arc<ImageQueue>> {
        self.queues.read().await.get(camera_id).cloned()
    }

    pub fn total_bytes(&self) -> u64 {
        self.usage.bytes()
    }

    pub fn total_images(&self) -> u64 {
        self.usage.images()
    }

    /// Room left below the system ceiling
    pub fn has_room(&self) -> bool {
        self.usage.bytes() < self.config.max_total_bytes()
    }

    /// Enqueue through the ceiling check
    pub async fn enqueue(&self, camera_id: &str, image: NewImage) -> Result<EnqueueOutcome> {
        let queue = self
            .get(camera_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("queue for camera {}", camera_id)))?;

        let ceiling = self.config.max_total_bytes();
        let used = self.usage.bytes();
        if used >= ceiling {
            tracing::warn!(
                camera_id = %camera_id,
                used_bytes = used,
                ceiling_bytes = ceiling,
                "Queue ceiling reached, rejecting image"
            );
            return Err(Error::QueueFull {
                camera_id: camera_id.to_string(),
                message: format!("{} of {} bytes in use", used, ceiling),
            });
        }

        let mut outcome = queue.append(image).await?;
        self.publish_evictions(camera_id, &outcome.evicted);

        if self.usage.bytes() > ceiling {
            self.emergency_thin(PressureSource::Ceiling).await;
            outcome.state = queue.state().await;
        }

        Ok(outcome)
    }

    /// Cut the pool to `ceiling * (1 - emergency_thin_ratio)` (ceiling pressure)
    /// or by `emergency_thin_ratio` of current usage (memory pressure)
    pub async fn emergency_thin(&self, source: PressureSource) -> usize {
        let _guard = self.thin_lock.lock().await;

        let ceiling = self.config.max_total_bytes();
        let keep = 1.0 - self.config.emergency_thin_ratio;
        let target = match source {
            PressureSource::Ceiling => {
                if self.usage.bytes() <= ceiling {
                    return 0;
                }
                (ceiling as f64 * keep) as u64
            }
            PressureSource::Memory => (self.usage.bytes() as f64 * keep) as u64,
        };

        self.emergency_runs.fetch_add(1, Ordering::Relaxed);
        let before = self.usage.bytes();

        let mut evicted = self.evict_oldest_until(target, false).await;
        if self.usage.bytes() > ceiling {
            evicted += self.evict_oldest_until(target, true).await;
        }

        tracing::warn!(
            source = ?source,
            before_bytes = before,
            after_bytes = self.usage.bytes(),
            target_bytes = target,
            evicted = evicted,
            "Emergency thinning"
        );

        evicted
    }

    async fn evict_oldest_until(&self, target: u64, include_protected: bool) -> usize {
        let queues: Vec<Arc<ImageQueue>> = self.queues.read().await.values().cloned().collect();

        let mut candidates: Vec<(usize, QueueEntry)> = Vec::new();
        for (index, queue) in queues.iter().enumerate() {
            for entry in queue.eviction_candidates(include_protected).await {
                candidates.push((index, entry));
            }
        }
        candidates.sort_by(|a, b| {
            a.1.captured_at
                .cmp(&b.1.captured_at)
                .then(a.1.sequence.cmp(&b.1.sequence))
        });

        let mut projected = self.usage.bytes();
        let mut picks: HashMap<usize, Vec<u64>> = HashMap::new();
        for (index, entry) in candidates {
            if projected <= target {
                break;
            }
            projected = projected.saturating_sub(entry.size_bytes);
            picks.entry(index).or_default().push(entry.sequence);
        }

        let mut evicted = 0;
        for (index, sequences) in picks {
            let queue = &queues[index];
            let gone = queue.evict(&sequences, EvictionReason::Emergency).await;
            evicted += gone.len();
            self.publish_evictions(queue.camera_id(), &gone);
        }
        evicted
    }

    /// Periodic per-queue thinning (age limits, drift)
    pub async fn thin_all(&self) -> usize {
        let queues: Vec<Arc<ImageQueue>> = self.queues.read().await.values().cloned().collect();
        let mut evicted = 0;
        for queue in queues {
            let gone = queue.thin().await;
            evicted += gone.len();
            self.publish_evictions(queue.camera_id(), &gone);
        }
        evicted
    }

    /// Sample memory/filesystem and thin if over either limit
    pub async fn check_system(&self) -> SystemSample {
        let sample = self.sample().await;

        let queue_bytes = self.usage.bytes();
        let memory = sample.process_memory_bytes
            + if sample.queue_in_memory { queue_bytes } else { 0 };

        if queue_bytes > self.config.max_total_bytes() {
            self.emergency_thin(PressureSource::Ceiling).await;
        } else if memory > self.config.memory_limit_bytes() && queue_bytes > 0 {
            tracing::warn!(
                memory_mb = memory / MB,
                memory_limit_mb = self.config.memory_limit_mb,
                "Memory limit exceeded"
            );
            self.emergency_thin(PressureSource::Memory).await;
        }

        sample
    }

    async fn sample(&self) -> SystemSample {
        let probe = self.probe.clone();
        let path = self.config.base_path.clone();
        let sample = match tokio::task::spawn_blocking(move || probe.sample(&path)).await {
            Ok(sample) => sample,
            Err(e) => {
                tracing::warn!(error = %e, "System sampling task failed");
                SystemSample::default()
            }
        };
        *self.last_sample.write().await = Some(sample.clone());
        sample
    }

    /// Periodic check loop, independent of enqueues
    pub fn spawn_monitor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        let period = Duration::from_secs(self.config.memory_check_seconds);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                manager.thin_all().await;
                manager.check_system().await;
            }

            tracing::debug!("Queue monitor stopped");
        })
    }

    pub async fn global_stats(&self) -> GlobalQueueStats {
        let cached = self.last_sample.read().await.clone();
        let sample = match cached {
            Some(sample) => sample,
            None => self.sample().await,
        };

        let queue_bytes = self.usage.bytes();
        let memory = sample.process_memory_bytes
            + if sample.queue_in_memory { queue_bytes } else { 0 };

        GlobalQueueStats {
            total_images: self.usage.images(),
            total_size_mb: queue_bytes as f64 / MB as f64,
            max_total_mb: self.config.max_total_mb,
            memory_usage_mb: memory as f64 / MB as f64,
            memory_limit_mb: self.config.memory_limit_mb,
            filesystem_free_mb: sample.filesystem_free_bytes as f64 / MB as f64,
            filesystem_used_mb: sample.filesystem_used_bytes as f64 / MB as f64,
            queue_in_memory: sample.queue_in_memory,
            cameras: self.queues.read().await.len(),
            emergency_thinning_runs: self.emergency_runs.load(Ordering::Relaxed),
        }
    }

    fn publish_evictions(&self, camera_id: &str, evicted: &[EvictedImage]) {
        let mut by_reason: Vec<(EvictionReason, usize, u64)> = Vec::new();
        for image in evicted {
            match by_reason.iter_mut().find(|(r, _, _)| *r == image.reason) {
                Some((_, count, bytes)) => {
                    *count += 1;
                    *bytes += image.size_bytes;
                }
                None => by_reason.push((image.reason, 1, image.size_bytes)),
            }
        }
        for (reason, count, bytes) in by_reason {
            self.hub.publish(StatusEvent::ImagesEvicted {
                camera_id: camera_id.to_string(),
                count,
                bytes,
                reason,
            });
        }
    }
}
