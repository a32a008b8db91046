use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use tracing::warn;

use crate::errors::DecodeError;
use crate::gmail::api::MessagePart;
use crate::types::AttachmentRef;

pub const NO_CONTENT_PLACEHOLDER: &str = "No content available";

// Gmail pads inconsistently, so accept both forms.
const LENIENT_STANDARD: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedBody {
    pub body: String,
    pub is_html: bool,
}

/// Decode Gmail's base64url body data into raw bytes.
pub fn decode_base64url(data: &str) -> Result<Vec<u8>, DecodeError> {
    let standard: String = data
        .trim()
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    LENIENT_STANDARD
        .decode(standard.as_bytes())
        .map_err(|e| DecodeError::BadEncoding(e.to_string()))
}

/// Decode a text part. Invalid UTF-8 is replaced rather than rejected.
pub fn decode_text(data: &str) -> Result<String, DecodeError> {
    decode_base64url(data).map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

#[derive(Default)]
struct BodyVisitor {
    body: String,
    is_html: bool,
}

impl BodyVisitor {
    fn visit_container(&mut self, parts: &[MessagePart]) {
        for part in parts {
            if part.is_mime("text/plain") && self.body.is_empty() {
                if let Some(text) = decode_part(part) {
                    self.body = text;
                }
            } else if part.is_mime("text/html") {
                if let Some(html) = decode_part(part) {
                    self.body = html;
                    self.is_html = true;
                }
            } else if let Some(nested) = part.parts.as_deref() {
                self.visit_container(nested);
            }
        }
    }
}

fn decode_part(part: &MessagePart) -> Option<String> {
    let data = part.body.as_ref()?.data.as_deref()?;
    match decode_text(data) {
        Ok(text) => Some(text),
        Err(err) => {
            warn!(
                part_id = part.part_id.as_deref().unwrap_or("-"),
                mime_type = part.mime_type.as_deref().unwrap_or("-"),
                error = %err,
                "Skipping undecodable body part"
            );
            None
        }
    }
}

/// Pick the display body: HTML wins over plain text, snippet is the last resort.
pub fn extract_body(payload: &MessagePart, snippet: Option<&str>) -> ExtractedBody {
    let mut visitor = BodyVisitor::default();

    match payload.parts.as_deref() {
        Some(parts) => visitor.visit_container(parts),
        None => {
            if let Some(text) = decode_part(payload) {
                visitor.body = text;
                visitor.is_html = payload.is_mime("text/html");
            }
        }
    }

    if visitor.body.is_empty() {
        let fallback = snippet
            .filter(|s| !s.is_empty())
            .unwrap_or(NO_CONTENT_PLACEHOLDER);
        return ExtractedBody {
            body: fallback.to_string(),
            is_html: false,
        };
    }

    ExtractedBody {
        body: visitor.body,
        is_html: visitor.is_html,
    }
}

/// Attachment parts in depth-first order.
pub fn extract_attachments(payload: &MessagePart) -> Vec<AttachmentRef> {
    let mut found = Vec::new();
    if let Some(parts) = payload.parts.as_deref() {
        collect_attachments(parts, &mut found);
    }
    found
}

fn collect_attachments(parts: &[MessagePart], found: &mut Vec<AttachmentRef>) {
    for part in parts {
        if let Some(attachment) = as_attachment(part) {
            found.push(attachment);
        } else if let Some(nested) = part.parts.as_deref() {
            collect_attachments(nested, found);
        }
    }
}

fn as_attachment(part: &MessagePart) -> Option<AttachmentRef> {
    let filename = part.filename.as_deref().filter(|f| !f.is_empty())?;
    let body = part.body.as_ref()?;
    let id = body.attachment_id.as_deref()?;
    Some(AttachmentRef {
        id: id.to_string(),
        filename: filename.to_string(),
        mime_type: part.mime_type.clone().unwrap_or_default(),
        size_bytes: body.size.unwrap_or(0),
    })
}
