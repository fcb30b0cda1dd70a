//! ResourceLimiter types

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Bounded operation class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    /// Resize / re-encode
    ImageProcessing,
    /// EXIF / metadata extraction
    Metadata,
}

impl ResourceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceClass::ImageProcessing => "image_processing",
            ResourceClass::Metadata => "metadata",
        }
    }
}

/// Live counters for one class
#[derive(Debug, Default)]
pub(crate) struct ClassCounters {
    pub in_use: AtomicUsize,
    pub peak: AtomicUsize,
    pub granted: AtomicU64,
    pub timeouts: AtomicU64,
}

impl ClassCounters {
    pub fn on_grant(&self) {
        let now = self.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.granted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_release(&self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Snapshot of one pool
#[derive(Debug, Clone, Serialize)]
pub struct ClassStats {
    pub class: ResourceClass,
    pub max_permits: usize,
    pub available: usize,
    pub in_use: usize,
    pub peak_in_use: usize,
    pub granted_total: u64,
    pub timeouts_total: u64,
}

/// Limiter snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ResourceLimiterStats {
    pub classes: Vec<ClassStats>,
    pub capped_cameras: Vec<String>,
}
