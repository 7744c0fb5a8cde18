// Column types are shared by the SQLite and Postgres backends.

diesel::table! {
    attachments (file_id) {
        file_id -> Text,
        message_id -> Text,
        file_name -> Text,
        file_size -> BigInt,
        is_image_file -> Bool,
        is_video_file -> Nullable<Bool>,
        is_spoiler -> Bool,
        is_proxy_file -> Nullable<Bool>,
        proxy_url -> Nullable<Text>,
    }
}

diesel::table! {
    pending_attachments (file_id) {
        file_id -> Text,
        user_id -> Text,
        file_name -> Text,
        file_size -> BigInt,
        extension -> Text,
        is_image -> Bool,
        is_video -> Bool,
        created_at -> Timestamp,
        claimed -> Bool,
    }
}

diesel::table! {
    attachment_files (file_id) {
        file_id -> Text,
        file_name -> Text,
        content -> Binary,
        extension -> Text,
        channel_id -> Text,
        guild_id -> Nullable<Text>,
        user_id -> Text,
        content_hash -> Nullable<Text>,
        created_at -> Timestamp,
    }
}

diesel::allow_tables_to_appear_in_same_query!(attachments, pending_attachments, attachment_files,);
