//! Outbound mailer that enriches messages with correlation metadata.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use relay_core::EventPatch;
use relay_db::EventStore;

use crate::MailError;

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// What handlers and the notification pipeline hand to the mailer.
#[derive(Debug, Clone, Default)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// The event this message is correlated with. Required.
    pub event_id: String,
    /// Prior Message-ID for reply threading, if any.
    pub correlation_id: Option<String>,
    pub attachments: Vec<OutboundAttachment>,
    /// Overrides the transport's default sender when set.
    pub sender: Option<String>,
    pub extra_headers: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct OutboundAttachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// Fully stamped message as the transport sees it.
#[derive(Debug, Clone)]
pub struct ComposedEmail {
    pub to: String,
    pub sender: Option<String>,
    pub subject: String,
    pub body: String,
    /// `X-Event-ID` plus threading and caller-supplied headers, in order.
    pub headers: Vec<(String, String)>,
    pub attachments: Vec<OutboundAttachment>,
}

/// Delivery seam. Returns the Message-ID the transport assigned (or was
/// given), or `None` when the transport cannot report one.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn deliver(&self, email: &ComposedEmail) -> Result<Option<String>, MailError>;
}

// ---------------------------------------------------------------------------
// Mailer
// ---------------------------------------------------------------------------

/// Adapter that guarantees outbound mails carry correlation metadata and
/// persists the accepted Message-ID back onto the referenced event.
pub struct Mailer {
    transport: Arc<dyn MailTransport>,
    store: EventStore,
}

impl Mailer {
    pub fn new(transport: Arc<dyn MailTransport>, store: EventStore) -> Self {
        Self { transport, store }
    }

    /// Send `email`, stamping the subject, body and headers with the event
    /// reference first.
    ///
    /// Sending is idempotent with respect to stamping: a subject or body
    /// that already carries its marker is left alone, so feeding a
    /// previously stamped message back through produces the same bytes.
    /// The correlation write-back is last-writer-wins and a failure there
    /// only logs a warning; the send is never undone.
    pub async fn send(&self, email: OutboundEmail) -> Result<Option<String>, MailError> {
        if email.event_id.trim().is_empty() {
            return Err(MailError::MissingEventId);
        }

        let mut headers: Vec<(String, String)> =
            vec![("X-Event-ID".to_string(), email.event_id.clone())];
        if let Some(reply_header) = normalize_message_id(email.correlation_id.as_deref()) {
            headers.push(("In-Reply-To".to_string(), reply_header.clone()));
            headers.push(("References".to_string(), reply_header));
        }
        for (name, value) in &email.extra_headers {
            if !value.is_empty() {
                headers.push((name.clone(), value.clone()));
            }
        }

        let composed = ComposedEmail {
            to: email.to,
            sender: email.sender,
            subject: format_subject(&email.subject, &email.event_id),
            body: ensure_reference_line(&email.body, &email.event_id),
            headers,
            attachments: email.attachments,
        };

        let message_id = self.transport.deliver(&composed).await?;

        if let Some(message_id) = &message_id {
            let patch = EventPatch::correlation(message_id.clone());
            if let Err(err) = self.store.update(&email.event_id, patch).await {
                warn!(
                    event_id = %email.event_id,
                    message_id = %message_id,
                    error = %err,
                    "correlation_update_failed"
                );
            }
        }

        Ok(message_id)
    }
}

// ---------------------------------------------------------------------------
// Stamping helpers
// ---------------------------------------------------------------------------

/// Ensure `value` is formatted as an RFC5322 Message-ID (`<token>`).
pub(crate) fn normalize_message_id(value: Option<&str>) -> Option<String> {
    let token = value?.trim();
    if token.is_empty() {
        return None;
    }
    let token = token.trim_matches(|c| c == '<' || c == '>');
    if token.is_empty() {
        return None;
    }
    Some(format!("<{token}>"))
}

/// Append the `[ref:<id>]` marker unless the subject already carries it.
pub(crate) fn format_subject(subject: &str, event_id: &str) -> String {
    let marker = format!("[ref:{event_id}]");
    if subject.to_lowercase().contains(&marker.to_lowercase()) {
        return subject.to_string();
    }
    let subject = subject.trim();
    if subject.is_empty() {
        marker
    } else {
        format!("{subject} {marker}")
    }
}

/// Append a visible `Reference: <id>` line unless one is already present,
/// separating with a blank line when the body has content.
pub(crate) fn ensure_reference_line(body: &str, event_id: &str) -> String {
    let marker = format!("Reference: {event_id}");
    if body.to_lowercase().contains(&marker.to_lowercase()) {
        return body.to_string();
    }
    let separator = if body.trim().is_empty() { "" } else { "\n\n" };
    format!("{}{separator}{marker}\n", body.trim_end())
}
