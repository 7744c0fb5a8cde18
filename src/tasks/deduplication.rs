use anyhow::{Context, Result};
use std::time::Duration;

use super::{Task, TaskFuture};
use crate::db::runner::DbRunner;
use crate::db::Pool;
use crate::models::attachments::{delete_attachments_by_file_ids, find_duplicates, get_attachments};

/// Collapses attachment rows that describe the same upload: same message, file name, size and
/// proxy URL. The row with the lowest `file_id` survives. Returns the number of rows removed.
pub async fn deduplicate_attachments<C: DbRunner>(conn: &C) -> Result<usize> {
    let rows = get_attachments(conn)
        .await
        .context("failed to load attachments")?;

    let duplicates = find_duplicates(&rows);
    if duplicates.is_empty() {
        log::info!("No duplicate attachments found among {} rows", rows.len());
        return Ok(0);
    }

    let removed = delete_attachments_by_file_ids(conn, duplicates)
        .await
        .context("failed to delete duplicate attachments")?;

    log::info!("Removed {removed} duplicate attachments");
    Ok(removed)
}

pub struct AttachmentDeduplicationTask {
    pool: Pool,
    interval: Duration,
}

impl AttachmentDeduplicationTask {
    pub fn new(pool: Pool, interval: Duration) -> Self {
        AttachmentDeduplicationTask { pool, interval }
    }
}

impl Task for AttachmentDeduplicationTask {
    fn name(&self) -> &'static str {
        "attachment_deduplication"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn execute(&self) -> TaskFuture<'_> {
        Box::pin(async move {
            deduplicate_attachments(&self.pool).await?;
            Ok(())
        })
    }
}
