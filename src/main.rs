//! Edge Capture Relay
//!
//! Main entry point: cameras and limits come from the environment (`.env`).

use edgecap_relay::{
    collaborators::{CameraSource, DirectoryUploader, HttpSnapshotCamera, Uploader},
    config::AppConfig,
    resource_limiter::ResourceLimiter,
    CameraOptions, Orchestrator,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "edgecap_relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Edge Capture Relay v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::from_env()?;
    tracing::info!(
        ram_budget_mb = config.ram_budget_mb,
        processing_permits = config.limits.processing_permits,
        metadata_permits = config.limits.metadata_permits,
        queue_path = %config.orchestrator.queue.base_path.display(),
        upload_dir = %config.upload_dir.display(),
        cameras = config.cameras.len(),
        "Configuration loaded"
    );

    let limiter = Arc::new(ResourceLimiter::new(config.limits.clone())?);
    let orchestrator = Orchestrator::new(config.orchestrator.clone(), limiter)?;

    let uploader: Arc<dyn Uploader> = Arc::new(DirectoryUploader::new(&config.upload_dir));

    for entry in &config.cameras {
        let mut camera = match HttpSnapshotCamera::new(&entry.camera_id, &entry.snapshot_url) {
            Ok(camera) => camera,
            Err(e) => {
                tracing::error!(camera_id = %entry.camera_id, error = %e, "Invalid camera, skipping");
                continue;
            }
        };
        if let (Some(user), Some(pass)) = (&entry.username, &entry.password) {
            camera = camera.with_credentials(user, pass);
        }
        let camera: Arc<dyn CameraSource> = Arc::new(camera);

        let mut options = CameraOptions::new(&entry.remote_path);
        if let Some(queue) = &entry.queue_override {
            options = options.with_queue_override(queue.clone());
        }

        if let Err(e) = orchestrator
            .add_camera(camera, options, entry.interval_seconds, uploader.clone(), None)
            .await
        {
            tracing::error!(
                camera_id = %entry.camera_id,
                error_code = e.error_code(),
                error = %e,
                "Failed to add camera"
            );
        }
    }

    orchestrator.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    orchestrator.stop().await;

    let status = orchestrator.get_status().await;
    tracing::info!(
        uploads_success = status.upload_stats.success,
        uploads_failed = status.upload_stats.failed,
        queued = status.upload_stats.queued,
        "Final delivery stats"
    );
    Ok(())
}
