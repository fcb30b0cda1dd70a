//! Policy types
//!
//! All policies are plain serde structs with defaults sized for a 512MB board.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Longest backoff, auth hold-off, upload timeout or capture interval (one day)
pub const MAX_DELAY_SECONDS: u64 = 86_400;
/// Largest backoff multiplier and degraded slow factor
pub const MAX_MULTIPLIER: f64 = 100.0;
/// Longest queue retention (one year)
pub const MAX_QUEUE_AGE_SECONDS: u64 = 365 * 86_400;
/// Largest size ceiling in MB (1TB)
pub const MAX_SIZE_MB: u64 = 1 << 20;

/// Per-camera queue policy
///
/// A camera either uses the global defaults or supplies a complete replacement;
/// fields are never merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueCameraConfig {
    pub max_files: usize,
    pub max_size_mb: u64,
    /// 0 disables age eviction
    pub max_age_seconds: u64,
    pub protect_newest: usize,
    pub protect_oldest: usize,
    pub threshold_catching_up: f64,
    pub threshold_degraded: f64,
    pub threshold_critical: f64,
    /// Stop enqueuing new captures once occupancy reaches critical
    pub pause_capture_on_critical: bool,
    /// Occupancy below which a paused camera resumes
    pub resume_threshold: f64,
}

impl Default for QueueCameraConfig {
    fn default() -> Self {
        Self {
            max_files: 500,
            max_size_mb: 64,
            max_age_seconds: 86_400,
            protect_newest: 10,
            protect_oldest: 5,
            threshold_catching_up: 0.5,
            threshold_degraded: 0.75,
            threshold_critical: 0.9,
            pause_capture_on_critical: true,
            resume_threshold: 0.6,
        }
    }
}

impl QueueCameraConfig {
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb * 1024 * 1024
    }

    pub fn max_age(&self) -> Option<chrono::Duration> {
        if self.max_age_seconds == 0 {
            None
        } else {
            let seconds = self.max_age_seconds.min(MAX_QUEUE_AGE_SECONDS);
            Some(chrono::Duration::seconds(seconds as i64))
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_files == 0 {
            return Err(Error::Validation("max_files must be at least 1".to_string()));
        }
        if self.max_size_mb == 0 || self.max_size_mb > MAX_SIZE_MB {
            return Err(Error::Validation(format!(
                "max_size_mb ({}) must be between 1 and {}",
                self.max_size_mb, MAX_SIZE_MB
            )));
        }
        if self.max_age_seconds > MAX_QUEUE_AGE_SECONDS {
            return Err(Error::Validation(format!(
                "max_age_seconds ({}) must not exceed {}",
                self.max_age_seconds, MAX_QUEUE_AGE_SECONDS
            )));
        }
        if self.protect_newest + self.protect_oldest >= self.max_files {
            return Err(Error::Validation(format!(
                "protect_newest ({}) + protect_oldest ({}) must be below max_files ({})",
                self.protect_newest, self.protect_oldest, self.max_files
            )));
        }
        if !(self.threshold_catching_up > 0.0
            && self.threshold_catching_up <= self.threshold_degraded
            && self.threshold_degraded < self.threshold_critical)
        {
            return Err(Error::Validation(format!(
                "thresholds must satisfy 0 < catching_up ({}) <= degraded ({}) < critical ({})",
                self.threshold_catching_up, self.threshold_degraded, self.threshold_critical
            )));
        }
        if !self.threshold_critical.is_finite() {
            return Err(Error::Validation(format!(
                "threshold_critical ({}) must be finite",
                self.threshold_critical
            )));
        }
        if !(self.resume_threshold > 0.0 && self.resume_threshold < self.threshold_critical) {
            return Err(Error::Validation(format!(
                "resume_threshold ({}) must be between 0 and threshold_critical ({})",
                self.resume_threshold, self.threshold_critical
            )));
        }
        Ok(())
    }
}

/// System-wide queue policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueGlobalConfig {
    /// Root of the queue storage pool (tmpfs on the device)
    pub base_path: PathBuf,
    /// Ceiling for queued bytes across all cameras
    pub max_total_mb: u64,
    /// Ceiling for process memory plus tmpfs-resident queue bytes
    pub memory_limit_mb: u64,
    pub memory_check_seconds: u64,
    /// Fraction of the ceiling cut away by emergency thinning
    pub emergency_thin_ratio: f64,
    /// Queue policy for cameras without an override
    pub defaults: QueueCameraConfig,
}

impl Default for QueueGlobalConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("/run/edgecap/queue"),
            max_total_mb: 192,
            memory_limit_mb: 384,
            memory_check_seconds: 30,
            emergency_thin_ratio: 0.25,
            defaults: QueueCameraConfig::default(),
        }
    }
}

impl QueueGlobalConfig {
    pub fn max_total_bytes(&self) -> u64 {
        self.max_total_mb * 1024 * 1024
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb * 1024 * 1024
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_total_mb == 0 || self.max_total_mb > MAX_SIZE_MB {
            return Err(Error::Validation(format!(
                "max_total_mb ({}) must be between 1 and {}",
                self.max_total_mb, MAX_SIZE_MB
            )));
        }
        if self.memory_limit_mb > MAX_SIZE_MB {
            return Err(Error::Validation(format!(
                "memory_limit_mb ({}) must not exceed {}",
                self.memory_limit_mb, MAX_SIZE_MB
            )));
        }
        if self.memory_check_seconds == 0 {
            return Err(Error::Validation(
                "memory_check_seconds must be at least 1".to_string(),
            ));
        }
        if !(self.emergency_thin_ratio > 0.0 && self.emergency_thin_ratio < 1.0) {
            return Err(Error::Validation(format!(
                "emergency_thin_ratio ({}) must be in (0, 1)",
                self.emergency_thin_ratio
            )));
        }
        self.defaults.validate()
    }
}

/// Exponential backoff policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_seconds: f64,
    pub max_seconds: f64,
    pub multiplier: f64,
    /// Spread delays ±50%
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_seconds: 5.0,
            max_seconds: 300.0,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<()> {
        let limit = MAX_DELAY_SECONDS as f64;
        if !(self.initial_seconds > 0.0
            && self.initial_seconds <= self.max_seconds
            && self.max_seconds <= limit)
        {
            return Err(Error::Validation(format!(
                "backoff requires 0 < initial ({}) <= max ({}) <= {}",
                self.initial_seconds, self.max_seconds, limit
            )));
        }
        if !(self.multiplier >= 1.0 && self.multiplier <= MAX_MULTIPLIER) {
            return Err(Error::Validation(format!(
                "backoff multiplier ({}) must be between 1 and {}",
                self.multiplier, MAX_MULTIPLIER
            )));
        }
        Ok(())
    }
}

/// Degraded mode policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradedModeConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub slow_interval_multiplier: f64,
    /// Resource limiter permits a degraded camera may hold at once
    pub concurrency_limit: usize,
}

impl Default for DegradedModeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            slow_interval_multiplier: 2.0,
            concurrency_limit: 1,
        }
    }
}

impl DegradedModeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::Validation(
                "degraded failure_threshold must be at least 1".to_string(),
            ));
        }
        if !(self.slow_interval_multiplier >= 1.0 && self.slow_interval_multiplier <= MAX_MULTIPLIER) {
            return Err(Error::Validation(format!(
                "slow_interval_multiplier ({}) must be between 1 and {}",
                self.slow_interval_multiplier, MAX_MULTIPLIER
            )));
        }
        if self.concurrency_limit == 0 {
            return Err(Error::Validation(
                "degraded concurrency_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Capture scheduling policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub timeout_seconds: u64,
    pub default_interval_seconds: u64,
    pub min_interval_seconds: u64,
    /// Skip captures while the time authority reports drift
    pub require_time_sync: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 10,
            default_interval_seconds: 60,
            min_interval_seconds: 5,
            require_time_sync: false,
        }
    }
}

impl CaptureConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_seconds == 0 || self.timeout_seconds > MAX_DELAY_SECONDS {
            return Err(Error::Validation(format!(
                "capture timeout_seconds ({}) must be between 1 and {}",
                self.timeout_seconds, MAX_DELAY_SECONDS
            )));
        }
        if self.min_interval_seconds == 0
            || self.default_interval_seconds < self.min_interval_seconds
            || self.default_interval_seconds > MAX_DELAY_SECONDS
        {
            return Err(Error::Validation(format!(
                "capture intervals require 1 <= min ({}) <= default ({}) <= {}",
                self.min_interval_seconds, self.default_interval_seconds, MAX_DELAY_SECONDS
            )));
        }
        Ok(())
    }
}

/// Upload pipeline policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub max_concurrent_uploads: usize,
    pub upload_timeout_seconds: u64,
    /// Hold-off after an authentication failure
    pub auth_retry_seconds: u64,
    /// Queue re-check period when no enqueue notification arrives
    pub idle_poll_seconds: u64,
    pub temp_suffix: String,
    /// Upload-path backoff, independent of capture backoff
    pub backoff: BackoffConfig,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: 2,
            upload_timeout_seconds: 60,
            auth_retry_seconds: 600,
            idle_poll_seconds: 10,
            temp_suffix: ".tmp".to_string(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl UploadConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_uploads == 0 {
            return Err(Error::Validation(
                "max_concurrent_uploads must be at least 1".to_string(),
            ));
        }
        if self.temp_suffix.is_empty() {
            return Err(Error::Validation("temp_suffix must not be empty".to_string()));
        }
        if self.upload_timeout_seconds == 0 || self.upload_timeout_seconds > MAX_DELAY_SECONDS {
            return Err(Error::Validation(format!(
                "upload_timeout_seconds ({}) must be between 1 and {}",
                self.upload_timeout_seconds, MAX_DELAY_SECONDS
            )));
        }
        if self.auth_retry_seconds > MAX_DELAY_SECONDS {
            return Err(Error::Validation(format!(
                "auth_retry_seconds ({}) must not exceed {}",
                self.auth_retry_seconds, MAX_DELAY_SECONDS
            )));
        }
        self.backoff.validate()
    }
}

/// Permit pool sizes for the resource limiter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub processing_permits: usize,
    pub metadata_permits: usize,
    pub acquire_timeout_seconds: u64,
}

/// RAM budget per concurrent image-processing operation
const MB_PER_PROCESSING_PERMIT: u64 = 128;

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            processing_permits: 1,
            metadata_permits: 2,
            acquire_timeout_seconds: 30,
        }
    }
}

impl ResourceLimits {
    /// Size pools from CPU count and RAM budget
    pub fn from_host(ram_budget_mb: u64) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::for_host(cpus, ram_budget_mb)
    }

    pub fn for_host(cpus: usize, ram_budget_mb: u64) -> Self {
        let by_ram = (ram_budget_mb / MB_PER_PROCESSING_PERMIT).max(1) as usize;
        let processing = by_ram.min(cpus.max(1));
        Self {
            processing_permits: processing,
            metadata_permits: (processing * 2).min(cpus.max(1) * 2),
            acquire_timeout_seconds: 30,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.processing_permits == 0 || self.metadata_permits == 0 {
            return Err(Error::Validation(
                "resource limiter pools need at least one permit".to_string(),
            ));
        }
        Ok(())
    }
}

/// Orchestrator construction config
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub queue: QueueGlobalConfig,
    pub capture: CaptureConfig,
    pub backoff: BackoffConfig,
    pub degraded: DegradedModeConfig,
    pub upload: UploadConfig,
    pub shutdown_timeout_seconds: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            queue: QueueGlobalConfig::default(),
            capture: CaptureConfig::default(),
            backoff: BackoffConfig::default(),
            degraded: DegradedModeConfig::default(),
            upload: UploadConfig::default(),
            shutdown_timeout_seconds: 10,
        }
    }
}

impl OrchestratorConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        self.queue.validate()?;
        self.backoff.validate()?;
        self.degraded.validate()?;
        self.upload.validate()?;
        self.capture.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        OrchestratorConfig::default().validate().unwrap();
    }

    #[test]
    fn test_protect_windows_must_leave_room() {
        let config = QueueCameraConfig {
            max_files: 5,
            protect_newest: 3,
            protect_oldest: 2,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_backoff_rejects_non_finite_and_huge() {
        let base = BackoffConfig::default();
        let huge_max = BackoffConfig {
            max_seconds: 1e30,
            ..base.clone()
        };
        assert!(matches!(huge_max.validate(), Err(Error::Validation(_))));

        let nan_max = BackoffConfig {
            max_seconds: f64::NAN,
            ..base.clone()
        };
        assert!(nan_max.validate().is_err());

        let inf_multiplier = BackoffConfig {
            multiplier: f64::INFINITY,
            ..base.clone()
        };
        assert!(inf_multiplier.validate().is_err());

        let nan_initial = BackoffConfig {
            initial_seconds: f64::NAN,
            ..base.clone()
        };
        assert!(nan_initial.validate().is_err());

        let one_day = BackoffConfig {
            max_seconds: MAX_DELAY_SECONDS as f64,
            ..base
        };
        one_day.validate().unwrap();
    }

    #[test]
    fn test_degraded_slow_factor_bounded() {
        for factor in [f64::NAN, f64::INFINITY, 0.5, MAX_MULTIPLIER + 1.0] {
            let config = DegradedModeConfig {
                slow_interval_multiplier: factor,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "factor {} accepted", factor);
        }
    }

    #[test]
    fn test_queue_age_and_size_bounded() {
        let forever = QueueCameraConfig {
            max_age_seconds: u64::MAX,
            ..Default::default()
        };
        assert!(matches!(forever.validate(), Err(Error::Validation(_))));
        // Never negative, even when unvalidated
        assert!(forever.max_age().unwrap() > chrono::Duration::zero());

        let huge = QueueCameraConfig {
            max_size_mb: u64::MAX,
            ..Default::default()
        };
        assert!(huge.validate().is_err());

        let nan_resume = QueueCameraConfig {
            resume_threshold: f64::NAN,
            ..Default::default()
        };
        assert!(nan_resume.validate().is_err());

        let year = QueueCameraConfig {
            max_age_seconds: MAX_QUEUE_AGE_SECONDS,
            ..Default::default()
        };
        year.validate().unwrap();
    }

    #[test]
    fn test_capture_and_upload_bounds() {
        let slow = CaptureConfig {
            default_interval_seconds: MAX_DELAY_SECONDS + 1,
            ..Default::default()
        };
        assert!(slow.validate().is_err());

        let below_min = CaptureConfig {
            default_interval_seconds: 2,
            min_interval_seconds: 5,
            ..Default::default()
        };
        assert!(below_min.validate().is_err());

        let upload = UploadConfig {
            auth_retry_seconds: u64::MAX,
            ..Default::default()
        };
        assert!(upload.validate().is_err());
    }

    #[test]
    fn test_threshold_order() {
        let config = QueueCameraConfig {
            threshold_degraded: 0.95,
            threshold_critical: 0.9,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_override_fills_defaults() {
        let config: QueueCameraConfig =
            serde_json::from_str(r#"{"max_files": 20, "protect_newest": 2}"#).unwrap();
        assert_eq!(config.max_files, 20);
        assert_eq!(config.protect_newest, 2);
        assert_eq!(config.protect_oldest, QueueCameraConfig::default().protect_oldest);
    }

    #[test]
    fn test_limits_for_small_board() {
        let limits = ResourceLimits::for_host(4, 512);
        assert_eq!(limits.processing_permits, 4);

        let tiny = ResourceLimits::for_host(4, 100);
        assert_eq!(tiny.processing_permits, 1);
        assert_eq!(tiny.metadata_permits, 2);
    }
}
