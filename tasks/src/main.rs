use anyhow::{anyhow, Result};
use media_proxy::db::{build_pool, run_migrations};
use media_proxy::tasks::{AttachmentDeduplicationTask, PendingUploadExpiryTask, TaskScheduler};
use media_proxy::SweepSettings;
use std::sync::Arc;

async fn build_scheduler(settings: &SweepSettings) -> Result<TaskScheduler> {
    let database_url = settings
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow!("DATABASE_URL must be set to run attachment sweeps"))?;

    let pool = build_pool(database_url)?;
    let applied = run_migrations(&pool).await?;
    if applied > 0 {
        log::info!("Applied {applied} attachment migrations");
    }

    let scheduler = TaskScheduler::new();
    scheduler
        .register_task(Arc::new(AttachmentDeduplicationTask::new(
            pool.clone(),
            settings.dedup_interval,
        )))
        .await;
    scheduler
        .register_task(Arc::new(PendingUploadExpiryTask::new(
            pool,
            settings.pending_interval,
            settings.pending_expiry,
        )))
        .await;

    Ok(scheduler)
}

#[tokio::main]
async fn main() {
    env_logger::init();
    dotenvy::dotenv().ok();

    log::info!("Starting media proxy task manager");

    let settings = SweepSettings::from_env();
    let scheduler = build_scheduler(&settings)
        .await
        .expect("failed to set up attachment sweeps");

    let scheduler_clone = scheduler.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for ctrl+c");
        log::info!("Shutdown signal received");
        scheduler_clone.stop();
    });

    // blocks until stopped
    scheduler.start().await;

    log::info!("Task manager shutdown complete");
}
