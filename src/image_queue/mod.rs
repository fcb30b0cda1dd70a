//! ImageQueue - Durable per-camera FIFO of undelivered images
//!
//! ## Responsibilities
//!
//! - Persist captured images in the shared storage pool
//! - Hand out the oldest image for delivery (at-least-once)
//! - Enforce count/size/age limits via thinning
//! - Report occupancy and health bucket
//!
//! ## Design
//!
//! - One file per image; the index is rebuilt from file names on open
//! - Sequence numbers are allocated before the file write so the index lock
//!   is held only for bookkeeping, never for I/O
//! - An image leaves the queue only through `complete` (delivered) or eviction

mod storage;
pub mod thinning;
mod types;

pub use storage::QueueStorage;
pub use types::*;

use crate::config::QueueCameraConfig;
use crate::error::{Error, Result};
use chrono::Utc;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

struct QueueInner {
    entries: VecDeque<QueueEntry>,
    total_bytes: u64,
    in_flight: Option<u64>,
    evicted_total: u64,
    enqueued_total: u64,
}

impl QueueInner {
    fn position(&self, sequence: u64) -> Option<usize> {
        self.entries.iter().position(|e| e.sequence == sequence)
    }

    fn remove(&mut self, sequence: u64, usage: &QueueUsage) -> Option<QueueEntry> {
        let index = self.position(sequence)?;
        let entry = self.entries.remove(index)?;
        self.total_bytes -= entry.size_bytes;
        usage.sub(entry.size_bytes);
        if self.in_flight == Some(sequence) {
            self.in_flight = None;
        }
        Some(entry)
    }
}

/// Per-camera image queue
pub struct ImageQueue {
    camera_id: String,
    config: QueueCameraConfig,
    storage: QueueStorage,
    usage: Arc<QueueUsage>,
    next_sequence: AtomicU64,
    inner: Mutex<QueueInner>,
}

impl ImageQueue {
    /// Open (or recover) the queue for a camera under `base_path/<camera_id>`
    pub async fn open(
        camera_id: &str,
        base_path: &Path,
        config: QueueCameraConfig,
        usage: Arc<QueueUsage>,
    ) -> Result<Self> {
        config.validate()?;
        if camera_id.is_empty() || camera_id.contains(['/', '\\']) || camera_id.starts_with('.') {
            return Err(Error::Validation(format!("invalid camera id: {:?}", camera_id)));
        }

        let storage = QueueStorage::new(base_path.join(camera_id));
        let recovered = storage.scan().await?;

        let total_bytes: u64 = recovered.iter().map(|e| e.size_bytes).sum();
        for entry in &recovered {
            usage.add(entry.size_bytes);
        }
        let next_sequence = recovered.last().map(|e| e.sequence + 1).unwrap_or(1);

        if !recovered.is_empty() {
            tracing::info!(
                camera_id = %camera_id,
                images = recovered.len(),
                bytes = total_bytes,
                "Recovered queued images"
            );
        }

        let queue = Self {
            camera_id: camera_id.to_string(),
            config,
            storage,
            usage,
            next_sequence: AtomicU64::new(next_sequence),
            inner: Mutex::new(QueueInner {
                entries: recovered.into(),
                total_bytes,
                in_flight: None,
                evicted_total: 0,
                enqueued_total: 0,
            }),
        };

        // Limits may have shrunk since the images were written
        let evicted = queue.thin().await;
        if !evicted.is_empty() {
            tracing::info!(
                camera_id = %camera_id,
                evicted = evicted.len(),
                "Thinned recovered queue to current limits"
            );
        }

        Ok(queue)
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn config(&self) -> &QueueCameraConfig {
        &self.config
    }

    pub fn dir(&self) -> &Path {
        self.storage.dir()
    }

    /// Store an image, then thin
    pub async fn append(&self, image: NewImage) -> Result<EnqueueOutcome> {
        if image.data.is_empty() {
            return Err(Error::Validation("refusing to queue an empty image".to_string()));
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let size_bytes = image.data.len() as u64;
        let path = self
            .storage
            .write(sequence, image.captured_at, image.time_trusted, &image.data)
            .await?;

        let entry = QueueEntry {
            sequence,
            captured_at: image.captured_at,
            size_bytes,
            time_trusted: image.time_trusted,
            path,
        };

        let (peak_bucket, evicted, doomed, state) = {
            let mut inner = self.inner.lock().await;

            let at = inner
                .entries
                .iter()
                .rposition(|e| e.sequence < sequence)
                .map(|i| i + 1)
                .unwrap_or(0);
            inner.entries.insert(at, entry);
            inner.total_bytes += size_bytes;
            inner.enqueued_total += 1;
            self.usage.add(size_bytes);

            let peak = thinning::bucket(
                thinning::occupancy(inner.entries.len(), inner.total_bytes, &self.config),
                &self.config,
            );
            let (evicted, doomed) = self.apply_plan(&mut inner);
            (peak, evicted, doomed, self.snapshot(&inner))
        };

        self.delete_files(doomed).await;

        tracing::debug!(
            camera_id = %self.camera_id,
            sequence = sequence,
            size_bytes = size_bytes,
            images = state.image_count,
            health = state.health.as_str(),
            "Image queued"
        );
        self.log_evictions(&evicted);

        Ok(EnqueueOutcome {
            sequence,
            peak_bucket,
            evicted,
            state,
        })
    }

    /// Oldest image for delivery, marked in flight
    ///
    /// Calling again before `complete`/`release` returns the same image.
    pub async fn dequeue(&self) -> Result<Option<QueuedImage>> {
        loop {
            let entry = {
                let mut inner = self.inner.lock().await;
                let current = inner
                    .in_flight
                    .and_then(|seq| inner.position(seq))
                    .or(if inner.entries.is_empty() { None } else { Some(0) });
                match current {
                    Some(index) => {
                        let entry = inner.entries[index].clone();
                        inner.in_flight = Some(entry.sequence);
                        entry
                    }
                    None => {
                        inner.in_flight = None;
                        return Ok(None);
                    }
                }
            };

            match self.storage.read(&entry.path).await {
                Ok(data) => {
                    return Ok(Some(QueuedImage {
                        camera_id: self.camera_id.clone(),
                        sequence: entry.sequence,
                        captured_at: entry.captured_at,
                        size_bytes: entry.size_bytes,
                        time_trusted: entry.time_trusted,
                        data,
                    }))
                }
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!(
                        camera_id = %self.camera_id,
                        sequence = entry.sequence,
                        "Queue file vanished, dropping index entry"
                    );
                    let mut inner = self.inner.lock().await;
                    inner.remove(entry.sequence, &self.usage);
                }
                Err(e) => {
                    self.release(entry.sequence).await;
                    return Err(e);
                }
            }
        }
    }

    /// Delivery confirmed: remove the image for good
    pub async fn complete(&self, sequence: u64) -> bool {
        let removed = {
            let mut inner = self.inner.lock().await;
            inner.remove(sequence, &self.usage)
        };
        match removed {
            Some(entry) => {
                self.storage.delete(&entry.path).await;
                true
            }
            None => false,
        }
    }

    /// Delivery abandoned: the image stays at the head
    pub async fn release(&self, sequence: u64) {
        let mut inner = self.inner.lock().await;
        if inner.in_flight == Some(sequence) {
            inner.in_flight = None;
        }
    }

    /// Run the thinning policy now
    pub async fn thin(&self) -> Vec<EvictedImage> {
        let (evicted, doomed) = {
            let mut inner = self.inner.lock().await;
            self.apply_plan(&mut inner)
        };
        self.delete_files(doomed).await;
        self.log_evictions(&evicted);
        evicted
    }

    /// Candidates for cross-queue emergency eviction, oldest first
    ///
    /// The in-flight image is never offered. Protected images are only offered
    /// when `include_protected` is set.
    pub async fn eviction_candidates(&self, include_protected: bool) -> Vec<QueueEntry> {
        let inner = self.inner.lock().await;
        let len = inner.entries.len();
        let start = self.config.protect_oldest.min(len);
        let end = len.saturating_sub(self.config.protect_newest).max(start);

        inner
            .entries
            .iter()
            .enumerate()
            .filter(|(i, e)| {
                Some(e.sequence) != inner.in_flight
                    && (include_protected || (*i >= start && *i < end))
            })
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Evict specific sequences; unknown or in-flight ones are skipped
    pub async fn evict(&self, sequences: &[u64], reason: EvictionReason) -> Vec<EvictedImage> {
        let mut evicted = Vec::new();
        let mut doomed = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            for &sequence in sequences {
                if inner.in_flight == Some(sequence) {
                    continue;
                }
                if let Some(entry) = inner.remove(sequence, &self.usage) {
                    inner.evicted_total += 1;
                    evicted.push(EvictedImage {
                        sequence,
                        captured_at: entry.captured_at,
                        size_bytes: entry.size_bytes,
                        reason,
                    });
                    doomed.push(entry.path);
                }
            }
        }
        self.delete_files(doomed).await;
        self.log_evictions(&evicted);
        evicted
    }

    /// Stop accounting for this queue; files stay on disk for the next `open`
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        for entry in inner.entries.drain(..) {
            self.usage.sub(entry.size_bytes);
        }
        inner.total_bytes = 0;
        inner.in_flight = None;
    }

    pub async fn state(&self) -> CameraQueueState {
        let inner = self.inner.lock().await;
        self.snapshot(&inner)
    }

    pub async fn occupancy(&self) -> f64 {
        let inner = self.inner.lock().await;
        thinning::occupancy(inner.entries.len(), inner.total_bytes, &self.config)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }

    fn snapshot(&self, inner: &QueueInner) -> CameraQueueState {
        let occupancy = thinning::occupancy(inner.entries.len(), inner.total_bytes, &self.config);
        CameraQueueState {
            camera_id: self.camera_id.clone(),
            image_count: inner.entries.len(),
            total_bytes: inner.total_bytes,
            oldest_at: inner.entries.front().map(|e| e.captured_at),
            newest_at: inner.entries.back().map(|e| e.captured_at),
            occupancy,
            health: thinning::bucket(occupancy, &self.config),
            in_flight: inner.in_flight,
            evicted_total: inner.evicted_total,
            enqueued_total: inner.enqueued_total,
        }
    }

    /// Plan and apply thinning under the lock; returns files to delete afterwards
    fn apply_plan(&self, inner: &mut QueueInner) -> (Vec<EvictedImage>, Vec<PathBuf>) {
        let entries: Vec<QueueEntry> = inner.entries.iter().cloned().collect();
        let plan = thinning::plan(&entries, inner.in_flight, &self.config, Utc::now());

        let mut evicted = Vec::with_capacity(plan.len());
        let mut doomed = Vec::with_capacity(plan.len());
        for (sequence, reason) in plan {
            if let Some(entry) = inner.remove(sequence, &self.usage) {
                inner.evicted_total += 1;
                evicted.push(EvictedImage {
                    sequence,
                    captured_at: entry.captured_at,
                    size_bytes: entry.size_bytes,
                    reason,
                });
                doomed.push(entry.path);
            }
        }
        (evicted, doomed)
    }

    async fn delete_files(&self, paths: Vec<PathBuf>) {
        for path in paths {
            self.storage.delete(&path).await;
        }
    }

    fn log_evictions(&self, evicted: &[EvictedImage]) {
        if evicted.is_empty() {
            return;
        }
        let bytes: u64 = evicted.iter().map(|e| e.size_bytes).sum();
        tracing::info!(
            camera_id = %self.camera_id,
            evicted = evicted.len(),
            bytes = bytes,
            reason = ?evicted[0].reason,
            first_sequence = evicted[0].sequence,
            "Evicted queued images"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(bytes: usize) -> NewImage {
        NewImage {
            data: vec![0xAB; bytes],
            captured_at: Utc::now(),
            time_trusted: true,
        }
    }

    fn scenario_config() -> QueueCameraConfig {
        QueueCameraConfig {
            max_files: 5,
            max_size_mb: 100,
            max_age_seconds: 0,
            protect_newest: 2,
            protect_oldest: 1,
            threshold_catching_up: 0.5,
            threshold_degraded: 1.1,
            threshold_critical: 1.5,
            pause_capture_on_critical: true,
            resume_threshold: 0.5,
        }
    }

    #[tokio::test]
    async fn test_enqueue_eight_evicts_middle() {
        let dir = tempfile::tempdir().unwrap();
        let usage = Arc::new(QueueUsage::new());
        let queue = ImageQueue::open("cam-001", dir.path(), scenario_config(), usage.clone())
            .await
            .unwrap();

        let mut evicted = Vec::new();
        for _ in 0..8 {
            let outcome = queue.append(image(100)).await.unwrap();
            evicted.extend(outcome.evicted.iter().map(|e| e.sequence));
            assert!(outcome.state.image_count <= 5);
        }

        assert_eq!(evicted, vec![3, 4, 5]);
        assert_eq!(queue.len().await, 5);
        assert_eq!(usage.images(), 5);
        assert_eq!(usage.bytes(), 500);

        let on_disk = std::fs::read_dir(queue.dir()).unwrap().count();
        assert_eq!(on_disk, 5);
    }

    #[tokio::test]
    async fn test_dequeue_is_fifo_and_at_least_once() {
        let dir = tempfile::tempdir().unwrap();
        let usage = Arc::new(QueueUsage::new());
        let queue = ImageQueue::open("cam-001", dir.path(), QueueCameraConfig::default(), usage)
            .await
            .unwrap();

        queue.append(image(10)).await.unwrap();
        queue.append(image(20)).await.unwrap();

        let first = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(first.sequence, 1);

        // Not confirmed: the same image comes back
        let again = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(again.sequence, 1);

        queue.release(1).await;
        assert_eq!(queue.dequeue().await.unwrap().unwrap().sequence, 1);

        assert!(queue.complete(1).await);
        let second = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(second.sequence, 2);
        assert_eq!(second.data.len(), 20);
        assert!(queue.complete(2).await);
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reopen_recovers_order_and_sequence() {
        let dir = tempfile::tempdir().unwrap();
        {
            let queue = ImageQueue::open(
                "cam-001",
                dir.path(),
                QueueCameraConfig::default(),
                Arc::new(QueueUsage::new()),
            )
            .await
            .unwrap();
            for _ in 0..3 {
                queue.append(image(10)).await.unwrap();
            }
            queue.complete(1).await;
        }

        let usage = Arc::new(QueueUsage::new());
        let queue = ImageQueue::open("cam-001", dir.path(), QueueCameraConfig::default(), usage.clone())
            .await
            .unwrap();
        assert_eq!(queue.len().await, 2);
        assert_eq!(usage.images(), 2);
        assert_eq!(queue.dequeue().await.unwrap().unwrap().sequence, 2);

        let outcome = queue.append(image(10)).await.unwrap();
        assert_eq!(outcome.sequence, 4);
    }

    #[tokio::test]
    async fn test_in_flight_survives_critical_thinning() {
        let dir = tempfile::tempdir().unwrap();
        let config = QueueCameraConfig {
            max_files: 10,
            protect_newest: 1,
            protect_oldest: 1,
            threshold_degraded: 0.85,
            threshold_critical: 0.9,
            ..Default::default()
        };
        let queue = ImageQueue::open("cam-001", dir.path(), config, Arc::new(QueueUsage::new()))
            .await
            .unwrap();

        for _ in 0..8 {
            queue.append(image(10)).await.unwrap();
        }
        let head = queue.dequeue().await.unwrap().unwrap();

        // The ninth image hits critical; oldest-first skips the in-flight head
        let outcome = queue.append(image(10)).await.unwrap();
        assert_eq!(outcome.peak_bucket, HealthBucket::Critical);
        assert_eq!(outcome.evicted[0].sequence, head.sequence + 1);
        assert_eq!(outcome.evicted[0].reason, EvictionReason::Critical);

        let state = queue.state().await;
        assert_eq!(state.in_flight, Some(head.sequence));
        assert!(queue.complete(head.sequence).await);
    }

    #[tokio::test]
    async fn test_eviction_candidates_respect_protection() {
        let dir = tempfile::tempdir().unwrap();
        let config = QueueCameraConfig {
            max_files: 20,
            protect_newest: 2,
            protect_oldest: 2,
            ..Default::default()
        };
        let queue = ImageQueue::open("cam-001", dir.path(), config, Arc::new(QueueUsage::new()))
            .await
            .unwrap();
        for _ in 0..6 {
            queue.append(image(10)).await.unwrap();
        }

        let unprotected: Vec<u64> = queue
            .eviction_candidates(false)
            .await
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(unprotected, vec![3, 4]);
        assert_eq!(queue.eviction_candidates(true).await.len(), 6);

        let evicted = queue.evict(&[3, 99], EvictionReason::Emergency).await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(queue.state().await.evicted_total, 1);
    }

    #[tokio::test]
    async fn test_rejects_invalid_camera_id() {
        let dir = tempfile::tempdir().unwrap();
        let result = ImageQueue::open(
            "../escape",
            dir.path(),
            QueueCameraConfig::default(),
            Arc::new(QueueUsage::new()),
        )
        .await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
