pub mod attachments;
pub mod pending_attachments;
