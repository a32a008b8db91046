//! Gmail REST API client and wire types.

mod client;

pub use client::{GmailClient, MessageFormat};

/// Gmail API response types
pub mod api {
    use serde::{Deserialize, Serialize};

    /// Response from listing messages
    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ListMessagesResponse {
        pub messages: Option<Vec<MessageRef>>,
        pub next_page_token: Option<String>,
        pub result_size_estimate: Option<u32>,
    }

    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessageRef {
        pub id: String,
        pub thread_id: String,
    }

    /// A message as returned by `messages.get` in `full` or `metadata` format.
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GmailMessage {
        pub id: String,
        #[serde(default)]
        pub thread_id: String,
        pub label_ids: Option<Vec<String>>,
        pub snippet: Option<String>,
        pub internal_date: Option<String>,
        pub payload: Option<MessagePart>,
    }

    impl GmailMessage {
        /// Header lookup on the top-level payload.
        pub fn header(&self, name: &str) -> Option<&str> {
            self.payload.as_ref()?.header(name)
        }
    }

    /// One node of the MIME tree. The top-level payload is a node too.
    #[derive(Debug, Default, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessagePart {
        pub part_id: Option<String>,
        pub mime_type: Option<String>,
        pub filename: Option<String>,
        pub headers: Option<Vec<Header>>,
        pub body: Option<PartBody>,
        pub parts: Option<Vec<MessagePart>>,
    }

    impl MessagePart {
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .as_ref()?
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .map(|h| h.value.as_str())
        }

        pub fn is_mime(&self, mime: &str) -> bool {
            self.mime_type
                .as_deref()
                .is_some_and(|m| m.eq_ignore_ascii_case(mime))
        }
    }

    #[derive(Debug, Clone, Deserialize, Serialize)]
    pub struct Header {
        pub name: String,
        pub value: String,
    }

    /// Part body: inline `data` or a reference to a separately fetched attachment.
    #[derive(Debug, Default, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct PartBody {
        pub attachment_id: Option<String>,
        pub size: Option<u64>,
        pub data: Option<String>,
    }

    /// Response from `messages.attachments.get`
    #[derive(Debug, Deserialize)]
    pub struct AttachmentBody {
        pub size: Option<u64>,
        pub data: String,
    }

    #[derive(Debug, Default, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ModifyRequest {
        #[serde(skip_serializing_if = "Vec::is_empty")]
        pub add_label_ids: Vec<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        pub remove_label_ids: Vec<String>,
    }

    /// The subset of `messages.modify`'s response we use.
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ModifiedMessage {
        pub id: String,
        pub label_ids: Option<Vec<String>>,
    }

    /// Google's error envelope: `{"error": {"code": 403, "message": "..."}}`
    #[derive(Debug, Deserialize)]
    pub struct ErrorEnvelope {
        pub error: ErrorDetail,
    }

    #[derive(Debug, Deserialize)]
    pub struct ErrorDetail {
        #[serde(default)]
        pub message: String,
    }
}
