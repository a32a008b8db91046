use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult, UpstreamError};
use crate::gmail::api::{GmailMessage, ModifyRequest};
use crate::gmail::{GmailClient, MessageFormat};
use crate::mime::{decode_base64url, extract_attachments, extract_body};
use crate::oauth::TokenRecord;
use crate::sync::label_set;
use crate::types::{is_unread, MessageDetail, UNREAD_LABEL};

pub const DETAIL_HEADERS: [&str; 5] = ["Subject", "From", "To", "Cc", "Date"];

/// Gmail's wording when the grant only carries `gmail.metadata`.
const METADATA_SCOPE_DENIAL: &str = "Metadata scope doesn't allow format FULL";

pub const LIMITED_PREVIEW_NOTICE: &str = "----------------------------------------\n\n\
LIMITED PREVIEW ONLY\n\n\
To view the full email content:\n\
1. Sign out of your account\n\
2. Sign back in to refresh permissions\n\
3. Approve the updated Gmail permissions\n\n\
This enables full email content viewing.";

pub const CONTENT_UNAVAILABLE: &str =
    "Email content not available. Please sign out and sign back in to view full emails.";

fn is_metadata_scope_denial(err: &AppError) -> bool {
    matches!(
        err,
        AppError::Upstream(UpstreamError::PermissionDenied(message))
            if message.contains(METADATA_SCOPE_DENIAL)
    )
}

/// Full message for the detail view. Falls back to a metadata-only preview when
/// the grant lacks full-content scope.
pub async fn get_detail(client: &GmailClient, token: &TokenRecord, id: &str) -> AppResult<MessageDetail> {
    match client.get_message(token, id, MessageFormat::Full, &[]).await {
        Ok(message) => Ok(full_detail(message)),
        Err(err) if is_metadata_scope_denial(&err) => {
            info!(message_id = %id, "Full format denied by scope; using metadata preview");
            let message = client
                .get_message(token, id, MessageFormat::Metadata, &DETAIL_HEADERS)
                .await?;
            Ok(limited_detail(message))
        }
        Err(err) => Err(err),
    }
}

fn full_detail(message: GmailMessage) -> MessageDetail {
    let (body, attachments) = match message.payload.as_ref() {
        Some(payload) => (
            extract_body(payload, message.snippet.as_deref()),
            extract_attachments(payload),
        ),
        None => {
            warn!(message_id = %message.id, "Message has no payload");
            (
                extract_body(&Default::default(), message.snippet.as_deref()),
                Vec::new(),
            )
        }
    };

    let mut detail = base_detail(message);
    detail.body = body.body;
    detail.is_html = body.is_html;
    detail.attachments = attachments;
    detail
}

fn limited_detail(message: GmailMessage) -> MessageDetail {
    let body = match message.snippet.as_deref().filter(|s| !s.is_empty()) {
        Some(snippet) => format!("{snippet}\n\n{LIMITED_PREVIEW_NOTICE}"),
        None => CONTENT_UNAVAILABLE.to_string(),
    };

    let mut detail = base_detail(message);
    detail.body = body;
    detail.limited = true;
    detail
}

fn base_detail(message: GmailMessage) -> MessageDetail {
    let label_ids = label_set(&message);
    let header = |name: &str, default: &str| {
        message
            .header(name)
            .filter(|v| !v.is_empty())
            .unwrap_or(default)
            .to_string()
    };

    MessageDetail {
        subject: header("Subject", "No Subject"),
        from: header("From", "Unknown Sender"),
        to: header("To", ""),
        cc: header("Cc", ""),
        date: header("Date", ""),
        snippet: message.snippet.clone().unwrap_or_default(),
        is_unread: is_unread(&label_ids),
        label_ids,
        internal_date: message.internal_date.as_deref().and_then(|d| d.parse().ok()),
        body: String::new(),
        is_html: false,
        attachments: Vec::new(),
        limited: false,
        thread_id: message.thread_id,
        id: message.id,
    }
}

/// Add or remove the `UNREAD` label.
pub async fn mark_read_state(
    client: &GmailClient,
    token: &TokenRecord,
    id: &str,
    read: bool,
) -> AppResult<()> {
    let change = if read {
        ModifyRequest {
            remove_label_ids: vec![UNREAD_LABEL.to_string()],
            ..Default::default()
        }
    } else {
        ModifyRequest {
            add_label_ids: vec![UNREAD_LABEL.to_string()],
            ..Default::default()
        }
    };

    let modified = client.modify_labels(token, id, &change).await?;
    debug!(message_id = %modified.id, read, "Updated read state");
    Ok(())
}

/// Raw attachment bytes.
pub async fn download_attachment(
    client: &GmailClient,
    token: &TokenRecord,
    message_id: &str,
    attachment_id: &str,
) -> AppResult<Vec<u8>> {
    let blob = client.get_attachment(token, message_id, attachment_id).await?;
    let bytes = decode_base64url(&blob.data)
        .map_err(|e| UpstreamError::Malformed(format!("attachment data: {e}")))?;

    if let Some(size) = blob.size {
        if size != bytes.len() as u64 {
            warn!(message_id, expected = size, actual = bytes.len(), "Attachment size mismatch");
        }
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use mockito::Matcher;
    use std::time::Duration;

    fn token() -> TokenRecord {
        TokenRecord::new("access", None, i64::MAX)
    }

    fn b64(text: &str) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(text)
    }

    fn client_for(server: &mockito::ServerGuard) -> GmailClient {
        GmailClient::new(format!("{}/gmail/v1", server.url()), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn full_detail_extracts_body_and_attachments() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "id": "m1",
            "threadId": "t1",
            "labelIds": ["INBOX", "UNREAD"],
            "snippet": "Hello there",
            "internalDate": "1736157600000",
            "payload": {
                "mimeType": "multipart/mixed",
                "headers": [
                    {"name": "Subject", "value": "Quarterly report"},
                    {"name": "From", "value": "Ada <ada@example.com>"},
                    {"name": "To", "value": "me@example.com"}
                ],
                "parts": [
                    {
                        "mimeType": "multipart/alternative",
                        "parts": [
                            {"mimeType": "text/plain", "body": {"data": b64("plain")}},
                            {"mimeType": "text/html", "body": {"data": b64("<p>html</p>")}}
                        ]
                    },
                    {
                        "mimeType": "application/pdf",
                        "filename": "report.pdf",
                        "body": {"attachmentId": "att-1", "size": 2048}
                    }
                ]
            }
        });
        let _mock = server
            .mock("GET", "/gmail/v1/users/me/messages/m1")
            .match_query(Matcher::UrlEncoded("format".into(), "full".into()))
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await;

        let detail = get_detail(&client_for(&server), &token(), "m1").await.unwrap();
        assert_eq!(detail.subject, "Quarterly report");
        assert_eq!(detail.cc, "");
        assert_eq!(detail.body, "<p>html</p>");
        assert!(detail.is_html);
        assert!(detail.is_unread);
        assert!(!detail.limited);
        assert_eq!(detail.internal_date, Some(1_736_157_600_000));
        assert_eq!(detail.attachments.len(), 1);
        assert_eq!(detail.attachments[0].id, "att-1");
        assert_eq!(detail.attachments[0].size_bytes, 2048);
    }

    #[tokio::test]
    async fn metadata_scope_denial_falls_back_to_preview() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/gmail/v1/users/me/messages/m2")
            .match_query(Matcher::UrlEncoded("format".into(), "full".into()))
            .with_status(403)
            .with_body(
                r#"{"error":{"code":403,"message":"Metadata scope doesn't allow format FULL"}}"#,
            )
            .create_async()
            .await;
        let fallback = server
            .mock("GET", "/gmail/v1/users/me/messages/m2")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("format".into(), "metadata".into()),
                Matcher::UrlEncoded("metadataHeaders".into(), "Cc".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"id":"m2","threadId":"t2","snippet":"Short preview","payload":{"headers":[{"name":"Subject","value":"Hi"}]}}"#,
            )
            .create_async()
            .await;

        let detail = get_detail(&client_for(&server), &token(), "m2").await.unwrap();
        fallback.assert_async().await;
        assert!(detail.limited);
        assert!(detail.attachments.is_empty());
        assert!(!detail.is_html);
        assert!(detail.body.starts_with("Short preview"));
        assert!(detail.body.contains(LIMITED_PREVIEW_NOTICE));
        assert_eq!(detail.subject, "Hi");
    }

    #[tokio::test]
    async fn other_permission_denials_are_fatal() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/gmail/v1/users/me/messages/m3")
            .with_status(403)
            .with_body(r#"{"error":{"code":403,"message":"Insufficient Permission"}}"#)
            .expect(1)
            .create_async()
            .await;

        let err = get_detail(&client_for(&server), &token(), "m3")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Upstream(UpstreamError::PermissionDenied(ref m)) if m == "Insufficient Permission"
        ));
    }

    #[tokio::test]
    async fn mark_read_removes_unread_label() {
        let mut server = mockito::Server::new_async().await;
        let read = server
            .mock("POST", "/gmail/v1/users/me/messages/m1/modify")
            .match_body(Matcher::Json(serde_json::json!({"removeLabelIds": ["UNREAD"]})))
            .with_status(200)
            .with_body(r#"{"id":"m1","labelIds":["INBOX"]}"#)
            .create_async()
            .await;
        let unread = server
            .mock("POST", "/gmail/v1/users/me/messages/m1/modify")
            .match_body(Matcher::Json(serde_json::json!({"addLabelIds": ["UNREAD"]})))
            .with_status(200)
            .with_body(r#"{"id":"m1","labelIds":["INBOX","UNREAD"]}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        mark_read_state(&client, &token(), "m1", true).await.unwrap();
        mark_read_state(&client, &token(), "m1", false).await.unwrap();
        read.assert_async().await;
        unread.assert_async().await;
    }

    #[tokio::test]
    async fn attachment_bytes_are_decoded() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/gmail/v1/users/me/messages/m1/attachments/att-1")
            .with_status(200)
            .with_body(format!(r#"{{"size":5,"data":"{}"}}"#, b64("%PDF-")))
            .create_async()
            .await;

        let bytes = download_attachment(&client_for(&server), &token(), "m1", "att-1")
            .await
            .unwrap();
        assert_eq!(bytes, b"%PDF-");
    }
}
