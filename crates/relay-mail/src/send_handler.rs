//! Registry handler bridging `EmailSendRequested` events to the mailer.

use async_trait::async_trait;
use tracing::info;

use relay_core::{Event, EventHandler, HandlerError, HandlerOutcome};

use crate::outbound::{Mailer, OutboundEmail};

/// Sends the notification described by an `EmailSendRequested` event.
///
/// The payload carries the *referenced* event id (the one parked in
/// `WAITING_USER`), so the outbound correlation markers point at the event
/// the operator's reply must resume, not at the notification event itself.
pub struct EmailSendRequestedHandler {
    mailer: Mailer,
}

impl EmailSendRequestedHandler {
    pub fn new(mailer: Mailer) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl EventHandler for EmailSendRequestedHandler {
    async fn handle(&self, event: &Event) -> Result<HandlerOutcome, HandlerError> {
        let payload = &event.payload;

        let to = payload
            .get("to")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .unwrap_or("");
        if to.is_empty() {
            // Without a recipient no retry can succeed.
            return Ok(HandlerOutcome::failed("notification payload missing `to`"));
        }

        let referenced_id = payload
            .get("event_id")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .unwrap_or("");
        if referenced_id.is_empty() {
            return Ok(HandlerOutcome::failed(
                "notification payload missing `event_id`",
            ));
        }

        let subject = payload
            .get("subject")
            .and_then(|v| v.as_str())
            .unwrap_or("(no subject)");
        let body = payload.get("body").and_then(|v| v.as_str()).unwrap_or("");

        let message_id = self
            .mailer
            .send(OutboundEmail {
                to: to.to_string(),
                subject: subject.to_string(),
                body: body.to_string(),
                event_id: referenced_id.to_string(),
                correlation_id: event.correlation_id.clone(),
                ..OutboundEmail::default()
            })
            .await
            .map_err(HandlerError::from_err)?;

        info!(
            event_id = referenced_id,
            message_id = message_id.as_deref().unwrap_or(""),
            "email_sent"
        );
        Ok(HandlerOutcome::completed())
    }
}
