//! Handler contract between the orchestrator and event processors.
//!
//! A handler is keyed by event type and returns a [`HandlerOutcome`]. The
//! four shapes mirror the lifecycle decisions the orchestrator can persist:
//! terminal success, suspension pending operator input, fatal failure, or a
//! fully structured finalization. A transient failure is an `Err`: it
//! counts against the retry budget rather than deciding the lifecycle.
//!
//! Handlers must be idempotent with respect to the event's own state (a
//! crashed worker may hand them the same event again) and must never write
//! the store for the event they were handed; the orchestrator is the sole
//! writer of that row's status and retry counter.

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::event::Event;
use crate::status::EventStatus;

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

/// Outbound message requested by a handler that suspends for operator input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl Notification {
    pub fn new(
        to: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// HandlerOutcome
// ---------------------------------------------------------------------------

/// Normalized handler response used to finalize the event.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// Terminal success, optionally replacing payload and labels.
    Completed {
        payload: Option<Map<String, Value>>,
        labels: Option<Vec<String>>,
    },
    /// Operator input required; the orchestrator persists `WAITING_USER` and
    /// then requests the attached notification.
    WaitingUser {
        notification: Notification,
        payload: Option<Map<String, Value>>,
    },
    /// Fatal failure: persisted as `FAILED` with the supplied error, never
    /// retried.
    Failed { error: String },
    /// Fully structured finalization for advanced cases.
    Finalize {
        status: EventStatus,
        payload: Option<Map<String, Value>>,
        labels: Option<Vec<String>>,
        correlation_id: Option<String>,
        notification: Option<Notification>,
    },
}

impl HandlerOutcome {
    /// Plain terminal success.
    pub fn completed() -> Self {
        HandlerOutcome::Completed {
            payload: None,
            labels: None,
        }
    }

    pub fn completed_with_payload(payload: Map<String, Value>) -> Self {
        HandlerOutcome::Completed {
            payload: Some(payload),
            labels: None,
        }
    }

    pub fn waiting_user(notification: Notification) -> Self {
        HandlerOutcome::WaitingUser {
            notification,
            payload: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        HandlerOutcome::Failed {
            error: error.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// HandlerError
// ---------------------------------------------------------------------------

/// Transient handler failure; counted against the retry budget.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// Preserve the source error type name, matching how failures are
    /// recorded in `last_error`.
    pub fn from_err<E: std::error::Error>(err: E) -> Self {
        Self(format!("{err}"))
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

// ---------------------------------------------------------------------------
// EventHandler
// ---------------------------------------------------------------------------

/// Asynchronous processor for one event type.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<HandlerOutcome, HandlerError>;
}

/// Adapts an async closure into an [`EventHandler`].
///
/// The closure receives an owned clone of the event so it can move it into
/// its future freely.
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<HandlerOutcome, HandlerError>> + Send,
{
    async fn handle(&self, event: &Event) -> Result<HandlerOutcome, HandlerError> {
        (self.f)(event.clone()).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<HandlerOutcome, HandlerError>> + Send,
{
    FnHandler { f }
}
