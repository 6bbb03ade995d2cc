//! Notification publishing: how finalized suspensions become new events.
//!
//! When the orchestrator parks an event in `WAITING_USER` it asks the
//! publisher to emit an `EmailSendRequested` event carrying the notification
//! details. The publisher persists a fresh `PENDING` row, so the outbound send
//! is itself scheduled work with its own retries, not a chained call inside
//! the finalizing transaction.

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use relay_core::{new_event_id, Event};
use relay_db::{EventStore, StoreError};

/// Event type emitted for outbound notifications.
pub const EMAIL_SEND_REQUESTED: &str = "EmailSendRequested";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Seam through which the orchestrator (and external adapters) submit new
/// events without knowing how ids are minted or collisions handled.
#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    /// Persist a new `PENDING` event of `event_type` with `payload`,
    /// returning the stored record.
    async fn publish(
        &self,
        event_type: &str,
        payload: Map<String, Value>,
    ) -> Result<Event, PublishError>;
}

/// Publisher that writes straight to the event store.
///
/// Ids come from the factory; a `DuplicateKey` collision is retried with a
/// fresh id, so callers never observe one.
#[derive(Clone)]
pub struct StorePublisher {
    store: EventStore,
}

impl StorePublisher {
    pub fn new(store: EventStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl NotificationPublisher for StorePublisher {
    async fn publish(
        &self,
        event_type: &str,
        payload: Map<String, Value>,
    ) -> Result<Event, PublishError> {
        loop {
            let event = Event::new(new_event_id(), event_type).with_payload(payload.clone());
            match self.store.create_event(&event).await {
                Ok(()) => {
                    debug!(event_id = %event.event_id, event_type, "event published");
                    return Ok(event);
                }
                Err(StoreError::DuplicateKey(id)) => {
                    warn!(event_id = %id, "event id collision, retrying with a fresh id");
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
