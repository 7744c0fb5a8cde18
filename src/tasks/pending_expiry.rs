use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Utc};
use std::time::Duration;

use super::{Task, TaskFuture};
use crate::db::runner::DbRunner;
use crate::db::Pool;
use crate::models::pending_attachments::delete_expired_pending_attachments;

/// Deletes pending attachments that were never claimed and are older than `threshold`, along
/// with their staged files.
pub async fn expire_pending_attachments<C: DbRunner>(
    conn: &C,
    now: NaiveDateTime,
    threshold: Duration,
) -> Result<usize> {
    let cutoff = now - chrono::Duration::from_std(threshold).context("expiry threshold too large")?;

    let removed = delete_expired_pending_attachments(conn, cutoff)
        .await
        .context("failed to delete expired pending attachments")?;

    if removed > 0 {
        log::info!("Cleaned up {removed} expired pending attachments");
    } else {
        log::debug!("No pending attachments older than {cutoff}");
    }

    Ok(removed)
}

pub struct PendingUploadExpiryTask {
    pool: Pool,
    interval: Duration,
    threshold: Duration,
}

impl PendingUploadExpiryTask {
    pub fn new(pool: Pool, interval: Duration, threshold: Duration) -> Self {
        PendingUploadExpiryTask {
            pool,
            interval,
            threshold,
        }
    }
}

impl Task for PendingUploadExpiryTask {
    fn name(&self) -> &'static str {
        "pending_upload_expiry"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn execute(&self) -> TaskFuture<'_> {
        Box::pin(async move {
            expire_pending_attachments(&self.pool, Utc::now().naive_utc(), self.threshold).await?;
            Ok(())
        })
    }
}
