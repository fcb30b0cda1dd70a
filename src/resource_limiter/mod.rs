//! ResourceLimiter - Bounded concurrency for heavy operations
//!
//! ## Responsibilities
//!
//! - One fixed-size permit pool per operation class, sized at startup
//! - Per-camera lanes so a degraded camera holds at most its cap
//! - Cancellation and timeout aware acquisition
//!
//! ## Design
//!
//! - Pools are tokio semaphores (FIFO admission bounds starvation)
//! - Lane permit first, then class permit; both released on drop
//! - Pool sizes are not reconfigurable at runtime

mod types;

pub use types::*;

use crate::config::ResourceLimits;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

/// Per-camera admission lane
struct CameraLane {
    cap: usize,
    semaphore: Arc<Semaphore>,
}

struct ClassPool {
    max: usize,
    semaphore: Arc<Semaphore>,
    counters: Arc<ClassCounters>,
}

/// ResourceLimiter instance
pub struct ResourceLimiter {
    processing: ClassPool,
    metadata: ClassPool,
    acquire_timeout: Duration,
    lanes: RwLock<HashMap<String, CameraLane>>,
}

impl ResourceLimiter {
    /// Create new ResourceLimiter
    pub fn new(limits: ResourceLimits) -> Result<Self> {
        limits.validate()?;

        tracing::info!(
            processing_permits = limits.processing_permits,
            metadata_permits = limits.metadata_permits,
            acquire_timeout_sec = limits.acquire_timeout_seconds,
            "ResourceLimiter initialized"
        );

        Ok(Self {
            processing: ClassPool {
                max: limits.processing_permits,
                semaphore: Arc::new(Semaphore::new(limits.processing_permits)),
                counters: Arc::new(ClassCounters::default()),
            },
            metadata: ClassPool {
                max: limits.metadata_permits,
                semaphore: Arc::new(Semaphore::new(limits.metadata_permits)),
                counters: Arc::new(ClassCounters::default()),
            },
            acquire_timeout: Duration::from_secs(limits.acquire_timeout_seconds.max(1)),
            lanes: RwLock::new(HashMap::new()),
        })
    }

    fn pool(&self, class: ResourceClass) -> &ClassPool {
        match class {
            ResourceClass::ImageProcessing => &self.processing,
            ResourceClass::Metadata => &self.metadata,
        }
    }

    /// Largest cap a camera can have (no restriction)
    pub fn uncapped(&self) -> usize {
        self.processing.max + self.metadata.max
    }

    pub fn max_permits(&self, class: ResourceClass) -> usize {
        self.pool(class).max
    }

    pub fn available(&self, class: ResourceClass) -> usize {
        self.pool(class).semaphore.available_permits()
    }

    /// Acquire a permit for `class` on behalf of `camera_id`
    ///
    /// - Waits in FIFO order while the pool or the camera lane is exhausted
    /// - Fails with `Cancelled` when `cancel` fires, `Timeout` after the
    ///   configured acquire timeout
    /// - Dropping the returned permit releases it
    pub async fn acquire(
        &self,
        class: ResourceClass,
        camera_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ResourcePermit> {
        let lane = self.lane_semaphore(camera_id).await;
        let pool = self.pool(class);
        let class_semaphore = pool.semaphore.clone();

        let acquire = async move {
            let lane_permit = lane.acquire_owned().await;
            let class_permit = class_semaphore.acquire_owned().await;
            (lane_permit, class_permit)
        };

        let (lane_permit, class_permit) = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled(format!(
                    "{} permit wait cancelled for camera {}",
                    class.as_str(),
                    camera_id
                )));
            }
            result = tokio::time::timeout(self.acquire_timeout, acquire) => match result {
                Ok(permits) => permits,
                Err(_) => {
                    pool.counters.timeouts.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    tracing::warn!(
                        camera_id = %camera_id,
                        class = class.as_str(),
                        timeout_ms = self.acquire_timeout.as_millis() as u64,
                        "Resource permit timeout"
                    );
                    return Err(Error::Timeout(format!(
                        "{} permit not available within {:?}",
                        class.as_str(),
                        self.acquire_timeout
                    )));
                }
            }
        };

        // Semaphores are never closed
        let lane_permit = lane_permit.map_err(|e| Error::Internal(e.to_string()))?;
        let class_permit = class_permit.map_err(|e| Error::Internal(e.to_string()))?;

        pool.counters.on_grant();
        tracing::trace!(camera_id = %camera_id, class = class.as_str(), "Resource permit acquired");

        Ok(ResourcePermit {
            class,
            camera_id: camera_id.to_string(),
            counters: pool.counters.clone(),
            _class_permit: class_permit,
            _lane_permit: lane_permit,
        })
    }

    /// Cap how many permits (all classes) a camera may hold at once
    ///
    /// Permits already held against a previous cap drain naturally.
    pub async fn set_camera_cap(&self, camera_id: &str, cap: usize) {
        let cap = cap.clamp(1, self.uncapped());
        let mut lanes = self.lanes.write().await;
        let lane = lanes
            .entry(camera_id.to_string())
            .or_insert_with(|| CameraLane {
                cap,
                semaphore: Arc::new(Semaphore::new(cap)),
            });

        if lane.cap != cap {
            tracing::info!(
                camera_id = %camera_id,
                previous_cap = lane.cap,
                cap = cap,
                "Camera permit cap changed"
            );
            lane.cap = cap;
            lane.semaphore = Arc::new(Semaphore::new(cap));
        }
    }

    pub async fn camera_cap(&self, camera_id: &str) -> usize {
        self.lanes
            .read()
            .await
            .get(camera_id)
            .map(|lane| lane.cap)
            .unwrap_or_else(|| self.uncapped())
    }

    /// Forget a removed camera's lane
    pub async fn remove_camera(&self, camera_id: &str) {
        self.lanes.write().await.remove(camera_id);
    }

    /// Lane semaphore for a camera (created uncapped on first use)
    async fn lane_semaphore(&self, camera_id: &str) -> Arc<Semaphore> {
        {
            let lanes = self.lanes.read().await;
            if let Some(lane) = lanes.get(camera_id) {
                return lane.semaphore.clone();
            }
        }

        let uncapped = self.uncapped();
        let mut lanes = self.lanes.write().await;
        lanes
            .entry(camera_id.to_string())
            .or_insert_with(|| CameraLane {
                cap: uncapped,
                semaphore: Arc::new(Semaphore::new(uncapped)),
            })
            .semaphore
            .clone()
    }

    /// Snapshot for status reporting
    pub async fn stats(&self) -> ResourceLimiterStats {
        use std::sync::atomic::Ordering;

        let classes = [ResourceClass::ImageProcessing, ResourceClass::Metadata]
            .into_iter()
            .map(|class| {
                let pool = self.pool(class);
                ClassStats {
                    class,
                    max_permits: pool.max,
                    available: pool.semaphore.available_permits(),
                    in_use: pool.counters.in_use.load(Ordering::SeqCst),
                    peak_in_use: pool.counters.peak.load(Ordering::SeqCst),
                    granted_total: pool.counters.granted.load(Ordering::Relaxed),
                    timeouts_total: pool.counters.timeouts.load(Ordering::Relaxed),
                }
            })
            .collect();

        let uncapped = self.uncapped();
        let capped_cameras = self
            .lanes
            .read()
            .await
            .iter()
            .filter(|(_, lane)| lane.cap < uncapped)
            .map(|(id, _)| id.clone())
            .collect();

        ResourceLimiterStats {
            classes,
            capped_cameras,
        }
    }
}

/// Held permit - Drop releases both the class and lane slot
pub struct ResourcePermit {
    class: ResourceClass,
    camera_id: String,
    counters: Arc<ClassCounters>,
    _class_permit: OwnedSemaphorePermit,
    _lane_permit: OwnedSemaphorePermit,
}

impl ResourcePermit {
    pub fn class(&self) -> ResourceClass {
        self.class
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }
}

impl Drop for ResourcePermit {
    fn drop(&mut self) {
        self.counters.on_release();
        tracing::trace!(camera_id = %self.camera_id, class = self.class.as_str(), "Resource permit released");
    }
}
