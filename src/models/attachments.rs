use crate::db::runner::DbRunner;
use crate::schema::attachments;
use anyhow::Result;
use diesel::prelude::*;
use diesel::{Identifiable, Insertable, Queryable};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// SQLite caps bound parameters per statement.
const DELETE_BATCH: usize = 500;

#[derive(Serialize, Deserialize, Insertable, Default, Debug, Clone)]
#[diesel(table_name = attachments)]
pub struct NewAttachment {
    pub file_id: String,
    pub message_id: String,
    pub file_name: String,
    pub file_size: i64,
    pub is_image_file: bool,
    pub is_video_file: Option<bool>,
    pub is_spoiler: bool,
    pub is_proxy_file: Option<bool>,
    pub proxy_url: Option<String>,
}

#[derive(Identifiable, Queryable, Serialize, Clone, Default, Debug, PartialEq, Eq)]
#[diesel(table_name = attachments, primary_key(file_id))]
pub struct Attachment {
    pub file_id: String,
    pub message_id: String,
    pub file_name: String,
    pub file_size: i64,
    pub is_image_file: bool,
    pub is_video_file: Option<bool>,
    pub is_spoiler: bool,
    pub is_proxy_file: Option<bool>,
    pub proxy_url: Option<String>,
}

/// The fields that make two attachment rows the same logical upload.
pub type AttachmentIdentity = (String, String, i64, Option<String>);

impl Attachment {
    pub fn identity(&self) -> AttachmentIdentity {
        (
            self.message_id.clone(),
            self.file_name.clone(),
            self.file_size,
            self.proxy_url.clone(),
        )
    }
}

/// Returns the ids of every row whose identity was already seen earlier in `rows`.
pub fn find_duplicates(rows: &[Attachment]) -> Vec<String> {
    let mut seen = HashSet::new();

    rows.iter()
        .filter(|row| !seen.insert(row.identity()))
        .map(|row| row.file_id.clone())
        .collect()
}

pub async fn create_attachment<C: DbRunner>(conn: &C, attachment: NewAttachment) -> Result<usize> {
    conn.run(move |c| {
        diesel::insert_into(attachments::table)
            .values(&attachment)
            .execute(c)
    })
    .await
}

/// Every attachment, ordered by `file_id`.
pub async fn get_attachments<C: DbRunner>(conn: &C) -> Result<Vec<Attachment>> {
    conn.run(move |c| {
        attachments::table
            .order(attachments::file_id.asc())
            .load::<Attachment>(c)
    })
    .await
}

/// Deletes the given rows in one transaction.
pub async fn delete_attachments_by_file_ids<C: DbRunner>(
    conn: &C,
    file_ids: Vec<String>,
) -> Result<usize> {
    if file_ids.is_empty() {
        return Ok(0);
    }

    conn.run(move |c| {
        c.transaction::<_, diesel::result::Error, _>(|c| {
            let mut deleted = 0;
            for batch in file_ids.chunks(DELETE_BATCH) {
                deleted += diesel::delete(
                    attachments::table.filter(attachments::file_id.eq_any(batch.to_vec())),
                )
                .execute(c)?;
            }
            Ok(deleted)
        })
    })
    .await
}
