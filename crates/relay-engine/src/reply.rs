//! Built-in handler that resumes suspended work from operator replies.

use async_trait::async_trait;
use tracing::{info, warn};

use relay_core::{Event, EventHandler, EventPatch, EventStatus, HandlerError, HandlerOutcome};
use relay_db::EventStore;

/// Reserved event type for ingested replies. Registered by the engine
/// itself unless explicitly overridden.
pub const USER_REPLY_RECEIVED: &str = "UserReplyReceived";

/// Transitions the referenced `WAITING_USER` event back to `PENDING` when a
/// correlated reply arrives.
///
/// The reply event itself always completes: a missing or already-resumed
/// referenced event is a late reply, not a failure of the reply event. At
/// most one status change happens per inbound message because only the
/// `WAITING_USER → PENDING` edge is taken.
pub struct UserReplyHandler {
    store: EventStore,
}

impl UserReplyHandler {
    pub fn new(store: EventStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for UserReplyHandler {
    async fn handle(&self, event: &Event) -> Result<HandlerOutcome, HandlerError> {
        let referenced_id = event
            .payload
            .get("event_id")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .unwrap_or("");
        if referenced_id.is_empty() {
            return Ok(HandlerOutcome::completed());
        }

        // Storage failures here are transient: let the retry budget handle
        // them instead of dropping the reply.
        let referenced = self
            .store
            .get(referenced_id)
            .await
            .map_err(HandlerError::from_err)?;

        let Some(referenced) = referenced else {
            warn!(
                referenced_event_id = referenced_id,
                "user_reply_unknown_event"
            );
            return Ok(HandlerOutcome::completed());
        };

        if referenced.status != EventStatus::WaitingUser {
            // Late reply: the referenced event already moved on.
            return Ok(HandlerOutcome::completed());
        }

        let message_id = event
            .payload
            .get("message_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let mut patch = EventPatch::status(EventStatus::Pending);
        patch.correlation_id = message_id.clone();

        match self.store.update(referenced_id, patch).await {
            Ok(_) => {
                info!(
                    referenced_event_id = referenced_id,
                    message_id = message_id.as_deref().unwrap_or(""),
                    "user_reply_received"
                );
            }
            // The referenced event stalling is not the reply's problem; the
            // reply event completes either way.
            Err(err) => {
                warn!(
                    referenced_event_id = referenced_id,
                    error = %err,
                    "user_reply_update_failed"
                );
            }
        }

        Ok(HandlerOutcome::completed())
    }
}
