//! Inbound adapter: turns raw RFC5322 replies into `UserReplyReceived`
//! events.

use std::sync::{Arc, OnceLock};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use mailparse::{parse_mail, DispositionType, MailHeaderMap, ParsedMail};
use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::warn;

use relay_core::Event;
use relay_engine::{NotificationPublisher, USER_REPLY_RECEIVED};

use crate::MailError;

fn subject_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\[ref:([A-Z0-9\-]+)\]").unwrap())
}

fn body_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)Reference:\s*([A-Z0-9\-]+)").unwrap())
}

fn message_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").unwrap())
}

// ---------------------------------------------------------------------------
// ReplyReader
// ---------------------------------------------------------------------------

/// Attachment collected from an inbound reply, content base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyAttachment {
    pub filename: String,
    pub content_type: String,
    pub content: String,
}

/// Reads raw e-mails and publishes `UserReplyReceived` events.
///
/// The reader never touches the referenced event; resuming suspended work is
/// the reply handler's job once the published event is dispatched.
pub struct ReplyReader {
    publisher: Arc<dyn NotificationPublisher>,
}

impl ReplyReader {
    pub fn new(publisher: Arc<dyn NotificationPublisher>) -> Self {
        Self { publisher }
    }

    /// Parse one raw message. Returns the published reply event, or
    /// `Ok(None)` when no event reference could be resolved (the message is
    /// dropped with a warning).
    pub async fn process(&self, raw: &[u8]) -> Result<Option<Event>, MailError> {
        let parsed = parse_mail(raw).map_err(|err| MailError::Parse(err.to_string()))?;

        let body = extract_body(&parsed);
        let Some(event_id) = extract_event_id(&parsed, &body) else {
            let message_id = parsed
                .headers
                .get_first_value("Message-ID")
                .unwrap_or_default();
            warn!(message_id = %message_id, "event_id_missing");
            return Ok(None);
        };

        let attachments: Vec<Value> = collect_attachments(&parsed)
            .into_iter()
            .map(|a| {
                json!({
                    "filename": a.filename,
                    "content_type": a.content_type,
                    "content": a.content,
                })
            })
            .collect();

        let mut payload = Map::new();
        payload.insert("event_id".into(), Value::String(event_id));
        payload.insert(
            "message_id".into(),
            first_message_id(parsed.headers.get_first_value("Message-ID").as_deref())
                .map(Value::String)
                .unwrap_or(Value::Null),
        );
        payload.insert(
            "in_reply_to".into(),
            first_message_id(
                parsed
                    .headers
                    .get_first_value("In-Reply-To")
                    .or_else(|| parsed.headers.get_first_value("References"))
                    .as_deref(),
            )
            .map(Value::String)
            .unwrap_or(Value::Null),
        );
        payload.insert("body".into(), Value::String(body));
        payload.insert("attachments".into(), Value::Array(attachments));

        let event = self.publisher.publish(USER_REPLY_RECEIVED, payload).await?;
        Ok(Some(event))
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// First `text/plain` part that is not an attachment, charset-decoded.
/// Parts that fail to decode are skipped.
fn extract_body(message: &ParsedMail<'_>) -> String {
    find_plain_text(message).unwrap_or_default()
}

fn find_plain_text(part: &ParsedMail<'_>) -> Option<String> {
    if part.subparts.is_empty() {
        if !part.ctype.mimetype.eq_ignore_ascii_case("text/plain") {
            return None;
        }
        if part.get_content_disposition().disposition == DispositionType::Attachment {
            return None;
        }
        return part.get_body().ok();
    }
    part.subparts.iter().find_map(find_plain_text)
}

/// Resolve the referenced event id: `X-Event-ID` header verbatim, then the
/// subject marker, then the body line. Marker matches are uppercased; the
/// pattern admits only `[A-Z0-9-]+`.
fn extract_event_id(message: &ParsedMail<'_>, body: &str) -> Option<String> {
    if let Some(header) = message.headers.get_first_value("X-Event-ID") {
        let header = header.trim();
        if !header.is_empty() {
            return Some(header.to_string());
        }
    }
    if let Some(subject) = message.headers.get_first_value("Subject") {
        if let Some(captures) = subject_ref_re().captures(&subject) {
            return Some(captures[1].to_ascii_uppercase());
        }
    }
    if let Some(captures) = body_ref_re().captures(body) {
        return Some(captures[1].to_ascii_uppercase());
    }
    None
}

/// Attachment parts (`Content-Disposition: attachment`), bodies decoded and
/// re-encoded as base64 for the JSON payload.
fn collect_attachments(message: &ParsedMail<'_>) -> Vec<ReplyAttachment> {
    let mut attachments = Vec::new();
    walk_attachments(message, &mut attachments);
    attachments
}

fn walk_attachments(part: &ParsedMail<'_>, out: &mut Vec<ReplyAttachment>) {
    if part.subparts.is_empty() {
        let disposition = part.get_content_disposition();
        if disposition.disposition == DispositionType::Attachment {
            let filename = disposition
                .params
                .get("filename")
                .cloned()
                .unwrap_or_else(|| "attachment".to_string());
            let content = part.get_body_raw().unwrap_or_default();
            out.push(ReplyAttachment {
                filename,
                content_type: part.ctype.mimetype.clone(),
                content: BASE64.encode(content),
            });
        }
        return;
    }
    for subpart in &part.subparts {
        walk_attachments(subpart, out);
    }
}

/// Pick the first `<…>` token when several Message-IDs are present, and
/// normalize to bracketed form.
fn first_message_id(raw: Option<&str>) -> Option<String> {
    let raw = raw?;
    if let Some(found) = message_id_re().find(raw) {
        return crate::outbound::normalize_message_id(Some(found.as_str()));
    }
    crate::outbound::normalize_message_id(Some(raw))
}
