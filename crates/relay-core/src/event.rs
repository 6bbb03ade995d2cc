//! The durable event record and its update patch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::status::EventStatus;

/// One unit of workflow progress, persisted in the event store.
///
/// `event_id` and `created_at` are immutable after insertion. `updated_at`
/// doubles as the optimistic-concurrency token: the store rejects any write
/// whose observed token no longer matches the row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    /// Routes the event to a handler; open vocabulary.
    pub event_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: EventStatus,
    pub payload: Map<String, Value>,
    /// Ordered label set; duplicates are rejected by the label API.
    pub labels: Vec<String>,
    /// Outbound mail Message-ID after a notification, or the inbound reply
    /// Message-ID after resumption.
    pub correlation_id: Option<String>,
    /// Failed handler attempts so far. Written only by the orchestrator.
    pub retries: u32,
    pub last_error: Option<String>,
}

impl Event {
    /// A fresh `PENDING` event with both timestamps set to `now`.
    pub fn new(event_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            event_id: event_id.into(),
            event_type: event_type.into(),
            created_at: now,
            updated_at: now,
            status: EventStatus::Pending,
            payload: Map::new(),
            labels: Vec::new(),
            correlation_id: None,
            retries: 0,
            last_error: None,
        }
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }
}

/// Mutable fields of an event; `None` means "leave unchanged".
///
/// Clearing `last_error` needs its own flag because `None` already means
/// "unchanged"; finalizing `COMPLETED` or `WAITING_USER` sets
/// `clear_last_error` so the previous failure does not outlive the recovery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPatch {
    pub status: Option<EventStatus>,
    pub payload: Option<Map<String, Value>>,
    pub labels: Option<Vec<String>>,
    pub retries: Option<u32>,
    pub last_error: Option<String>,
    pub clear_last_error: bool,
    pub correlation_id: Option<String>,
}

impl EventPatch {
    /// Patch that changes the status and nothing else.
    pub fn status(status: EventStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Patch that records a failed attempt.
    pub fn attempt_failed(retries: u32, last_error: impl Into<String>) -> Self {
        Self {
            retries: Some(retries),
            last_error: Some(last_error.into()),
            ..Self::default()
        }
    }

    /// Patch that stores an outbound correlation identifier.
    pub fn correlation(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..Self::default()
        }
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn clearing_last_error(mut self) -> Self {
        self.clear_last_error = true;
        self
    }

    /// True when applying the patch could not change any column.
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.payload.is_none()
            && self.labels.is_none()
            && self.retries.is_none()
            && self.last_error.is_none()
            && !self.clear_last_error
            && self.correlation_id.is_none()
    }
}
