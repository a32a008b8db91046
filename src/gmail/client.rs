use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::api::{
    AttachmentBody, ErrorEnvelope, GmailMessage, ListMessagesResponse, ModifiedMessage,
    ModifyRequest,
};
use crate::config::AppDefaults;
use crate::errors::{AppError, AppResult, UpstreamError};
use crate::oauth::TokenRecord;

/// Gmail caps `maxResults` at 500.
const MAX_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFormat {
    Full,
    Metadata,
}

impl MessageFormat {
    fn as_str(self) -> &'static str {
        match self {
            MessageFormat::Full => "full",
            MessageFormat::Metadata => "metadata",
        }
    }
}

#[derive(Clone)]
pub struct GmailClient {
    http: reqwest::Client,
    base_url: Url,
}

impl GmailClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> AppResult<Self> {
        let raw = base_url.into();
        let base_url = Url::parse(raw.trim_end_matches('/'))
            .map_err(|e| AppError::Config(format!("invalid API base url {raw}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::Config(format!("invalid API base url {raw}")));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("building HTTP client: {e}")))?;
        Ok(Self { http, base_url })
    }

    pub fn from_defaults(defaults: &AppDefaults) -> AppResult<Self> {
        Self::new(defaults.api_base_url.clone(), defaults.request_timeout)
    }

    /// `users/me/messages/<segments>`, each segment percent-encoded.
    fn messages_url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .extend(["users", "me", "messages"])
                .extend(segments);
        }
        url
    }

    /// One page of message ids, newest first.
    pub async fn list_messages(
        &self,
        token: &TokenRecord,
        max_results: usize,
        page_token: Option<&str>,
    ) -> AppResult<ListMessagesResponse> {
        let mut query = vec![(
            "maxResults",
            max_results.clamp(1, MAX_PAGE_SIZE).to_string(),
        )];
        if let Some(page) = page_token {
            query.push(("pageToken", page.to_string()));
        }

        let request = self
            .http
            .get(self.messages_url(&[]))
            .bearer_auth(token.bearer()?)
            .query(&query);
        self.send_json(request).await
    }

    /// `metadata_headers` only applies to `MessageFormat::Metadata`.
    pub async fn get_message(
        &self,
        token: &TokenRecord,
        id: &str,
        format: MessageFormat,
        metadata_headers: &[&str],
    ) -> AppResult<GmailMessage> {
        let mut query = vec![("format", format.as_str())];
        if format == MessageFormat::Metadata {
            query.extend(metadata_headers.iter().map(|h| ("metadataHeaders", *h)));
        }

        let request = self
            .http
            .get(self.messages_url(&[id]))
            .bearer_auth(token.bearer()?)
            .query(&query);
        self.send_json(request).await
    }

    pub async fn get_attachment(
        &self,
        token: &TokenRecord,
        message_id: &str,
        attachment_id: &str,
    ) -> AppResult<AttachmentBody> {
        let request = self
            .http
            .get(self.messages_url(&[message_id, "attachments", attachment_id]))
            .bearer_auth(token.bearer()?);
        self.send_json(request).await
    }

    pub async fn modify_labels(
        &self,
        token: &TokenRecord,
        id: &str,
        change: &ModifyRequest,
    ) -> AppResult<ModifiedMessage> {
        let request = self
            .http
            .post(self.messages_url(&[id, "modify"]))
            .bearer_auth(token.bearer()?)
            .json(change);
        self.send_json(request).await
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> AppResult<T> {
        let response = request.send().await.map_err(|e| {
            let reason = if e.is_timeout() {
                "request timed out".to_string()
            } else {
                e.to_string()
            };
            UpstreamError::Network(reason)
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| UpstreamError::Network(format!("reading response body: {e}")))?;

        if !status.is_success() {
            debug!(status = status.as_u16(), "Gmail API returned an error");
            return Err(classify_status(status, &body).into());
        }

        serde_json::from_str(&body).map_err(|e| UpstreamError::Malformed(e.to_string()).into())
    }
}

/// Map a non-success response onto the upstream taxonomy.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> UpstreamError {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|env| env.error.message)
        .unwrap_or_default();

    match status {
        StatusCode::UNAUTHORIZED => UpstreamError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => UpstreamError::RateLimited,
        StatusCode::FORBIDDEN if is_rate_limit_message(&message) => UpstreamError::RateLimited,
        StatusCode::FORBIDDEN => UpstreamError::PermissionDenied(message),
        StatusCode::NOT_FOUND => UpstreamError::NotFound,
        s if s.is_server_error() => UpstreamError::ServerError(s.as_u16()),
        s => UpstreamError::Rejected {
            status: s.as_u16(),
            message,
        },
    }
}

// Gmail reports per-user quota exhaustion as 403 with a rate-limit message.
fn is_rate_limit_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("rate limit") || lower.contains("quota exceeded")
}
