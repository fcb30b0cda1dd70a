//! Application configuration
//!
//! Environment-driven (after `.env` is loaded). Every variable falls back to a
//! default sized for a 512MB board.
//!
//! ## Variables
//!
//! - `QUEUE_BASE_PATH`, `QUEUE_MAX_TOTAL_MB`, `MEMORY_LIMIT_MB`,
//!   `MEMORY_CHECK_SECONDS`, `EMERGENCY_THIN_RATIO`, `QUEUE_DEFAULTS_JSON`
//! - `CAPTURE_TIMEOUT_SECONDS`, `CAPTURE_INTERVAL_SECONDS`, `CAPTURE_REQUIRE_TIME_SYNC`
//! - `BACKOFF_INITIAL_SECONDS`, `BACKOFF_MAX_SECONDS`, `BACKOFF_MULTIPLIER`, `BACKOFF_JITTER`
//! - `DEGRADED_FAILURE_THRESHOLD`, `DEGRADED_SLOW_MULTIPLIER`, `DEGRADED_CONCURRENCY_LIMIT`
//! - `MAX_CONCURRENT_UPLOADS`, `UPLOAD_TIMEOUT_SECONDS`, `AUTH_RETRY_SECONDS`, `UPLOAD_DIR`
//! - `RAM_BUDGET_MB`, `SHUTDOWN_TIMEOUT_SECONDS`
//! - `CAMERAS=cam-001=http://host/snap.jpg,cam-002=...` plus per-camera
//!   `CAMERA_<ID>_INTERVAL`, `CAMERA_<ID>_REMOTE_PATH`, `CAMERA_<ID>_USERNAME`,
//!   `CAMERA_<ID>_PASSWORD`, `CAMERA_<ID>_QUEUE_JSON` (`<ID>` upper-cased, `-` → `_`)

mod types;

pub use types::*;

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::str::FromStr;

/// Camera entry from the environment
#[derive(Debug, Clone)]
pub struct CameraEntry {
    pub camera_id: String,
    pub snapshot_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub interval_seconds: u64,
    pub remote_path: String,
    /// Complete replacement of the global queue defaults
    pub queue_override: Option<QueueCameraConfig>,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub orchestrator: OrchestratorConfig,
    pub limits: ResourceLimits,
    pub ram_budget_mb: u64,
    /// Mount point used as the delivery target
    pub upload_dir: PathBuf,
    pub cameras: Vec<CameraEntry>,
}

impl AppConfig {
    /// Load from process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut orchestrator = OrchestratorConfig::default();

        let queue = &mut orchestrator.queue;
        if let Some(path) = lookup("QUEUE_BASE_PATH") {
            queue.base_path = PathBuf::from(path);
        }
        queue.max_total_mb = parse_or(&lookup, "QUEUE_MAX_TOTAL_MB", queue.max_total_mb)?;
        queue.memory_limit_mb = parse_or(&lookup, "MEMORY_LIMIT_MB", queue.memory_limit_mb)?;
        queue.memory_check_seconds =
            parse_or(&lookup, "MEMORY_CHECK_SECONDS", queue.memory_check_seconds)?;
        queue.emergency_thin_ratio =
            parse_or(&lookup, "EMERGENCY_THIN_RATIO", queue.emergency_thin_ratio)?;
        if let Some(json) = lookup("QUEUE_DEFAULTS_JSON") {
            queue.defaults = serde_json::from_str(&json)?;
        }

        let capture = &mut orchestrator.capture;
        capture.timeout_seconds = parse_or(&lookup, "CAPTURE_TIMEOUT_SECONDS", capture.timeout_seconds)?;
        capture.default_interval_seconds =
            parse_or(&lookup, "CAPTURE_INTERVAL_SECONDS", capture.default_interval_seconds)?;
        capture.require_time_sync =
            parse_or(&lookup, "CAPTURE_REQUIRE_TIME_SYNC", capture.require_time_sync)?;

        let backoff = &mut orchestrator.backoff;
        backoff.initial_seconds = parse_or(&lookup, "BACKOFF_INITIAL_SECONDS", backoff.initial_seconds)?;
        backoff.max_seconds = parse_or(&lookup, "BACKOFF_MAX_SECONDS", backoff.max_seconds)?;
        backoff.multiplier = parse_or(&lookup, "BACKOFF_MULTIPLIER", backoff.multiplier)?;
        backoff.jitter = parse_or(&lookup, "BACKOFF_JITTER", backoff.jitter)?;

        let degraded = &mut orchestrator.degraded;
        degraded.failure_threshold =
            parse_or(&lookup, "DEGRADED_FAILURE_THRESHOLD", degraded.failure_threshold)?;
        degraded.slow_interval_multiplier =
            parse_or(&lookup, "DEGRADED_SLOW_MULTIPLIER", degraded.slow_interval_multiplier)?;
        degraded.concurrency_limit =
            parse_or(&lookup, "DEGRADED_CONCURRENCY_LIMIT", degraded.concurrency_limit)?;

        let upload = &mut orchestrator.upload;
        upload.max_concurrent_uploads =
            parse_or(&lookup, "MAX_CONCURRENT_UPLOADS", upload.max_concurrent_uploads)?;
        upload.upload_timeout_seconds =
            parse_or(&lookup, "UPLOAD_TIMEOUT_SECONDS", upload.upload_timeout_seconds)?;
        upload.auth_retry_seconds = parse_or(&lookup, "AUTH_RETRY_SECONDS", upload.auth_retry_seconds)?;

        orchestrator.shutdown_timeout_seconds = parse_or(
            &lookup,
            "SHUTDOWN_TIMEOUT_SECONDS",
            orchestrator.shutdown_timeout_seconds,
        )?;

        orchestrator.validate()?;

        let ram_budget_mb = parse_or(&lookup, "RAM_BUDGET_MB", 512u64)?;
        let limits = ResourceLimits::from_host(ram_budget_mb);

        let upload_dir = lookup("UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/mnt/uplink"));

        let cameras = match lookup("CAMERAS") {
            Some(list) => parse_cameras(&lookup, &list, orchestrator.capture.default_interval_seconds)?,
            None => Vec::new(),
        };

        Ok(Self {
            orchestrator,
            limits,
            ram_budget_mb,
            upload_dir,
            cameras,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{}={:?}: {}", key, raw, e))),
        None => Ok(default),
    }
}

fn env_key(camera_id: &str, suffix: &str) -> String {
    format!(
        "CAMERA_{}_{}",
        camera_id.to_uppercase().replace(['-', '.'], "_"),
        suffix
    )
}

fn parse_cameras<F>(lookup: &F, list: &str, default_interval: u64) -> Result<Vec<CameraEntry>>
where
    F: Fn(&str) -> Option<String>,
{
    let mut cameras = Vec::new();

    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (camera_id, url) = item
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("CAMERAS entry {:?} is not id=url", item)))?;
        let camera_id = camera_id.trim().to_string();

        let queue_override = match lookup(&env_key(&camera_id, "QUEUE_JSON")) {
            Some(json) => Some(serde_json::from_str::<QueueCameraConfig>(&json)?),
            None => None,
        };

        cameras.push(CameraEntry {
            snapshot_url: url.trim().to_string(),
            username: lookup(&env_key(&camera_id, "USERNAME")),
            password: lookup(&env_key(&camera_id, "PASSWORD")),
            interval_seconds: parse_or(lookup, &env_key(&camera_id, "INTERVAL"), default_interval)?,
            remote_path: lookup(&env_key(&camera_id, "REMOTE_PATH"))
                .unwrap_or_else(|| camera_id.clone()),
            queue_override,
            camera_id,
        });
    }

    Ok(cameras)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = AppConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.orchestrator.queue.max_total_mb, 192);
        assert!(config.cameras.is_empty());
    }

    #[test]
    fn test_cameras_and_overrides() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("CAMERAS", "cam-001=http://10.0.0.5/snap.jpg, gate=http://10.0.0.6/snap.jpg"),
            ("CAMERA_CAM_001_INTERVAL", "30"),
            ("CAMERA_CAM_001_REMOTE_PATH", "site-a/front"),
            ("CAMERA_GATE_QUEUE_JSON", r#"{"max_files": 50, "protect_newest": 3, "protect_oldest": 1}"#),
            ("BACKOFF_JITTER", "false"),
        ]))
        .unwrap();

        assert_eq!(config.cameras.len(), 2);
        assert_eq!(config.cameras[0].camera_id, "cam-001");
        assert_eq!(config.cameras[0].interval_seconds, 30);
        assert_eq!(config.cameras[0].remote_path, "site-a/front");
        assert!(config.cameras[0].queue_override.is_none());
        assert_eq!(config.cameras[1].remote_path, "gate");
        assert_eq!(config.cameras[1].queue_override.as_ref().unwrap().max_files, 50);
        assert!(!config.orchestrator.backoff.jitter);
    }

    #[test]
    fn test_bad_number_is_config_error() {
        let result = AppConfig::from_lookup(lookup_from(&[("QUEUE_MAX_TOTAL_MB", "lots")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_malformed_camera_entry() {
        let result = AppConfig::from_lookup(lookup_from(&[("CAMERAS", "cam-001")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
