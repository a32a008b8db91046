mod prefetch;

use std::collections::BTreeSet;
use std::time::Instant;

use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use crate::config::SyncPolicy;
pub use prefetch::{Mailbox, PrefetchOutcome, PrefetchState};

use crate::errors::AppResult;
use crate::gmail::api::GmailMessage;
use crate::gmail::{GmailClient, MessageFormat};
use crate::oauth::TokenRecord;
use crate::types::{is_unread, MessageSummary};

pub const SUMMARY_HEADERS: [&str; 3] = ["Subject", "From", "Date"];

/// Position in the mailbox listing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub next_page_token: Option<String>,
    pub total_fetched: usize,
    pub cap: usize,
}

impl SyncCursor {
    pub fn new(cap: usize) -> Self {
        Self {
            next_page_token: None,
            total_fetched: 0,
            cap,
        }
    }

    pub fn remaining(&self) -> usize {
        self.cap.saturating_sub(self.total_fetched)
    }

    /// Another page exists and there is room for it.
    pub fn can_continue(&self) -> bool {
        self.next_page_token.is_some() && self.remaining() > 0
    }

    fn advanced(&self, next_page_token: Option<String>, fetched: usize) -> Self {
        Self {
            next_page_token,
            total_fetched: (self.total_fetched + fetched).min(self.cap),
            cap: self.cap,
        }
    }
}

/// Size of the next background batch, or `None` once scheduling must stop.
pub fn next_batch_size(policy: &SyncPolicy, cursor: &SyncCursor) -> Option<usize> {
    if !cursor.can_continue() {
        return None;
    }
    Some(policy.subsequent_batch_size.min(cursor.remaining()))
}

/// Fetch one page of summaries starting at `cursor`.
///
/// Per-message metadata failures drop that message; only the list call itself can
/// fail the page. The returned summaries keep the list response's order.
pub async fn list_page(
    client: &GmailClient,
    policy: &SyncPolicy,
    cursor: &SyncCursor,
    token: &TokenRecord,
    batch_size: usize,
) -> AppResult<(Vec<MessageSummary>, SyncCursor)> {
    let batch = batch_size.min(cursor.remaining());
    if batch == 0 {
        return Ok((Vec::new(), cursor.clone()));
    }

    let started = Instant::now();
    let listing = client
        .list_messages(token, batch, cursor.next_page_token.as_deref())
        .await?;
    let refs = listing.messages.unwrap_or_default();
    let requested = refs.len().min(batch);

    let summaries: Vec<MessageSummary> = stream::iter(refs.into_iter().take(batch))
        .map(|msg_ref| async move {
            match client
                .get_message(token, &msg_ref.id, MessageFormat::Metadata, &SUMMARY_HEADERS)
                .await
            {
                Ok(message) => Some(summarize(message)),
                Err(e) => {
                    warn!(message_id = %msg_ref.id, error = %e, "Dropping message from page");
                    None
                }
            }
        })
        .buffered(policy.metadata_concurrency.max(1))
        .filter_map(|summary| async move { summary })
        .collect()
        .await;

    debug!(
        requested,
        kept = summaries.len(),
        has_next = listing.next_page_token.is_some(),
        elapsed_ms = ?started.elapsed().as_millis(),
        "Listed mailbox page"
    );

    let next = cursor.advanced(listing.next_page_token, summaries.len());
    Ok((summaries, next))
}

pub(crate) fn label_set(message: &GmailMessage) -> BTreeSet<String> {
    message
        .label_ids
        .as_ref()
        .map(|ids| ids.iter().cloned().collect())
        .unwrap_or_default()
}

pub(crate) fn summarize(message: GmailMessage) -> MessageSummary {
    let label_ids = label_set(&message);
    let header = |name: &str, default: &str| {
        message
            .header(name)
            .filter(|v| !v.is_empty())
            .unwrap_or(default)
            .to_string()
    };

    MessageSummary {
        subject: header("Subject", "No Subject"),
        from: header("From", "Unknown Sender"),
        date: header("Date", ""),
        snippet: message.snippet.clone().unwrap_or_default(),
        is_unread: is_unread(&label_ids),
        label_ids,
        thread_id: message.thread_id,
        id: message.id,
    }
}
