use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const UNREAD_LABEL: &str = "UNREAD";

/// One row of the message list. Built from a metadata-only fetch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSummary {
    pub id: String,
    pub thread_id: String,
    pub subject: String,
    pub from: String,
    pub date: String,
    pub snippet: String,
    pub label_ids: BTreeSet<String>,
    pub is_unread: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDetail {
    pub id: String,
    pub thread_id: String,
    pub subject: String,
    pub from: String,
    pub to: String,
    pub cc: String,
    pub date: String,
    pub snippet: String,
    pub label_ids: BTreeSet<String>,
    pub is_unread: bool,
    pub body: String,
    pub is_html: bool,
    pub attachments: Vec<AttachmentRef>,
    pub internal_date: Option<i64>,
    /// Built from metadata only because the grant lacks full-content scope.
    pub limited: bool,
}

/// Attachment metadata. `id` is only valid together with its message id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub id: String,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

pub fn is_unread(label_ids: &BTreeSet<String>) -> bool {
    label_ids.contains(UNREAD_LABEL)
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
