//! ImageQueue types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Image handed to the queue by a camera worker
#[derive(Debug, Clone)]
pub struct NewImage {
    pub data: Vec<u8>,
    pub captured_at: DateTime<Utc>,
    /// False when the clock was not trusted at capture time
    pub time_trusted: bool,
}

/// Image handed out for delivery
#[derive(Debug, Clone)]
pub struct QueuedImage {
    pub camera_id: String,
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub time_trusted: bool,
    pub data: Vec<u8>,
}

/// Index entry for one stored image
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub time_trusted: bool,
    pub path: PathBuf,
}

/// Occupancy bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthBucket {
    Normal,
    CatchingUp,
    Degraded,
    Critical,
}

impl HealthBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthBucket::Normal => "normal",
            HealthBucket::CatchingUp => "catching_up",
            HealthBucket::Degraded => "degraded",
            HealthBucket::Critical => "critical",
        }
    }
}

/// Why an image left the queue without delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Older than max_age_seconds
    Expired,
    /// Decimation of the unprotected middle
    Thinned,
    /// Critical occupancy, protection ignored
    Critical,
    /// Protection would leave the queue over a hard limit
    HardLimit,
    /// System ceiling or memory limit exceeded
    Emergency,
}

/// Evicted image record
#[derive(Debug, Clone, Serialize)]
pub struct EvictedImage {
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub reason: EvictionReason,
}

/// Result of one enqueue + thinning cycle
#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    pub sequence: u64,
    /// Bucket right after the append, before thinning
    pub peak_bucket: HealthBucket,
    pub evicted: Vec<EvictedImage>,
    pub state: CameraQueueState,
}

/// Per-camera queue snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraQueueState {
    pub camera_id: String,
    pub image_count: usize,
    pub total_bytes: u64,
    pub oldest_at: Option<DateTime<Utc>>,
    pub newest_at: Option<DateTime<Utc>>,
    pub occupancy: f64,
    pub health: HealthBucket,
    pub in_flight: Option<u64>,
    pub evicted_total: u64,
    pub enqueued_total: u64,
}

/// Byte/image counters shared by every queue in the storage pool
#[derive(Debug, Default)]
pub struct QueueUsage {
    bytes: AtomicU64,
    images: AtomicU64,
}

impl QueueUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::SeqCst);
        self.images.fetch_add(1, Ordering::SeqCst);
    }

    pub fn sub(&self, bytes: u64) {
        self.bytes.fetch_sub(bytes, Ordering::SeqCst);
        self.images.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    pub fn images(&self) -> u64 {
        self.images.load(Ordering::SeqCst)
    }
}
