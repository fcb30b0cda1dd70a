//! Edge Capture Relay Library
//!
//! Periodic camera capture on constrained edge hardware, with a bounded
//! on-disk queue and atomic delivery to a remote store.
//!
//! ## Architecture
//!
//! 1. ResourceLimiter - Global and per-camera permit pools for heavy work
//! 2. ImageQueue - Per-camera on-disk queue with priority thinning
//! 3. GlobalQueueManager - Global ceiling, memory/disk pressure monitor
//! 4. BackoffPolicy - Exponential backoff, degraded mode, pause gate
//! 5. CameraWorker - Capture / process / enqueue loop per camera
//! 6. UploadPipeline - Temp-then-rename delivery lane per camera
//! 7. StatusHub - Status event broadcast
//! 8. Orchestrator - Camera lifecycle, start/stop, aggregate status
//!
//! Camera, processing, upload and time-health integrations are traits in
//! [`collaborators`].

pub mod backoff_policy;
pub mod camera_worker;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod image_queue;
pub mod orchestrator;
pub mod queue_manager;
pub mod resource_limiter;
pub mod status_hub;
pub mod upload_pipeline;

pub use error::{Error, Result};
pub use orchestrator::{CameraOptions, Orchestrator, OrchestratorStatus};
