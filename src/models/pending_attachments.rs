use crate::db::runner::DbRunner;
use crate::schema::{attachment_files, pending_attachments};
use anyhow::Result;
use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use diesel::{Identifiable, Insertable, OptionalExtension, Queryable};
use serde::{Deserialize, Serialize};

const DELETE_BATCH: usize = 500;

#[derive(Serialize, Deserialize, Insertable, Debug, Clone)]
#[diesel(table_name = pending_attachments)]
pub struct NewPendingAttachment {
    pub file_id: String,
    pub user_id: String,
    pub file_name: String,
    pub file_size: i64,
    pub extension: String,
    pub is_image: bool,
    pub is_video: bool,
    pub created_at: NaiveDateTime,
    pub claimed: bool,
}

impl NewPendingAttachment {
    pub fn new(file_id: &str, user_id: &str, file_name: &str, file_size: i64) -> Self {
        let extension = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();

        NewPendingAttachment {
            file_id: file_id.to_string(),
            user_id: user_id.to_string(),
            file_name: file_name.to_string(),
            file_size,
            extension,
            is_image: false,
            is_video: false,
            created_at: Utc::now().naive_utc(),
            claimed: false,
        }
    }
}

#[derive(Identifiable, Queryable, Serialize, Clone, Debug, PartialEq, Eq)]
#[diesel(table_name = pending_attachments, primary_key(file_id))]
pub struct PendingAttachment {
    pub file_id: String,
    pub user_id: String,
    pub file_name: String,
    pub file_size: i64,
    pub extension: String,
    pub is_image: bool,
    pub is_video: bool,
    pub created_at: NaiveDateTime,
    pub claimed: bool,
}

/// Staged upload bytes backing a pending attachment.
#[derive(Serialize, Deserialize, Insertable, Debug, Clone)]
#[diesel(table_name = attachment_files)]
pub struct NewAttachmentFile {
    pub file_id: String,
    pub file_name: String,
    pub content: Vec<u8>,
    pub extension: String,
    pub channel_id: String,
    pub guild_id: Option<String>,
    pub user_id: String,
    pub content_hash: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Identifiable, Queryable, Clone, Debug, PartialEq, Eq)]
#[diesel(table_name = attachment_files, primary_key(file_id))]
pub struct AttachmentFile {
    pub file_id: String,
    pub file_name: String,
    pub content: Vec<u8>,
    pub extension: String,
    pub channel_id: String,
    pub guild_id: Option<String>,
    pub user_id: String,
    pub content_hash: Option<String>,
    pub created_at: NaiveDateTime,
}

pub async fn create_pending_attachment<C: DbRunner>(
    conn: &C,
    pending: NewPendingAttachment,
) -> Result<usize> {
    conn.run(move |c| {
        diesel::insert_into(pending_attachments::table)
            .values(&pending)
            .execute(c)
    })
    .await
}

pub async fn create_attachment_file<C: DbRunner>(conn: &C, file: NewAttachmentFile) -> Result<usize> {
    conn.run(move |c| {
        diesel::insert_into(attachment_files::table)
            .values(&file)
            .execute(c)
    })
    .await
}

pub async fn get_pending_attachment<C: DbRunner>(
    conn: &C,
    file_id: String,
) -> Result<Option<PendingAttachment>> {
    conn.run(move |c| {
        pending_attachments::table
            .find(file_id)
            .first::<PendingAttachment>(c)
            .optional()
    })
    .await
}

pub async fn get_attachment_file<C: DbRunner>(
    conn: &C,
    file_id: String,
) -> Result<Option<AttachmentFile>> {
    conn.run(move |c| {
        attachment_files::table
            .find(file_id)
            .first::<AttachmentFile>(c)
            .optional()
    })
    .await
}

pub async fn claim_pending_attachment<C: DbRunner>(conn: &C, file_id: String) -> Result<usize> {
    conn.run(move |c| {
        diesel::update(pending_attachments::table.find(file_id))
            .set(pending_attachments::claimed.eq(true))
            .execute(c)
    })
    .await
}

/// Removes unclaimed pending attachments created before `cutoff`, together with their staged
/// files, in a single transaction. Returns how many pending attachments were removed.
pub async fn delete_expired_pending_attachments<C: DbRunner>(
    conn: &C,
    cutoff: NaiveDateTime,
) -> Result<usize> {
    conn.run(move |c| {
        c.transaction::<_, diesel::result::Error, _>(|c| {
            let expired: Vec<String> = pending_attachments::table
                .filter(pending_attachments::claimed.eq(false))
                .filter(pending_attachments::created_at.lt(cutoff))
                .select(pending_attachments::file_id)
                .load(c)?;

            for batch in expired.chunks(DELETE_BATCH) {
                diesel::delete(
                    attachment_files::table.filter(attachment_files::file_id.eq_any(batch.to_vec())),
                )
                .execute(c)?;
                diesel::delete(
                    pending_attachments::table
                        .filter(pending_attachments::file_id.eq_any(batch.to_vec())),
                )
                .execute(c)?;
            }

            Ok(expired.len())
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_is_derived_from_file_name() {
        assert_eq!(NewPendingAttachment::new("f1", "u1", "Photo.JPG", 10).extension, "jpg");
        assert_eq!(NewPendingAttachment::new("f2", "u1", "README", 10).extension, "");
        assert!(!NewPendingAttachment::new("f3", "u1", "a.png", 10).claimed);
    }
}
