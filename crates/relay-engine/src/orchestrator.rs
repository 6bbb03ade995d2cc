//! The polling orchestrator loop.
//!
//! # Claim protocol
//!
//! Each poll lists `PENDING` events oldest-first and claims them one at a
//! time with `PENDING → IN_PROGRESS`, passing the `updated_at` token
//! observed at listing time. A `Concurrency` rejection means another worker
//! (or an in-flight change) took the row: a benign race, logged and
//! skipped. An `IllegalTransition` means the row moved out of `PENDING`
//! between listing and claim; also skipped.
//!
//! # Retry discipline
//!
//! Attempts resume from the event's persisted `retries` counter, so a
//! reclaimed event does not get a fresh budget. Every transient failure
//! increments the counter and records `last_error` before the backoff
//! sleep; reaching `max_attempts` finalizes `FAILED` with reason
//! `max_retries`.
//!
//! # Cancellation
//!
//! Checked between events and between retry sleeps. An in-flight handler
//! invocation always runs to completion; its event stays claimed if the
//! loop exits before finalization, and recovery of such rows is an operator
//! action, not the loop's.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use relay_core::{
    BackoffPolicy, Event, EventPatch, EventStatus, HandlerOutcome, Notification,
};
use relay_db::{EventStore, StoreError};

use crate::publish::{NotificationPublisher, EMAIL_SEND_REQUESTED};
use crate::registry::HandlerRegistry;
use crate::reply::{UserReplyHandler, USER_REPLY_RECEIVED};

// ---------------------------------------------------------------------------
// OrchestratorConfig
// ---------------------------------------------------------------------------

/// Loop tuning knobs. Defaults match a single modest worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrchestratorConfig {
    /// Events listed (and at most claimed) per poll. Clamped to ≥ 1.
    pub batch_size: i64,
    /// Handler invocations per event before `FAILED(max_retries)`. Clamped
    /// to ≥ 1.
    pub max_attempts: u32,
    /// Sleep between polls that processed nothing.
    pub idle_sleep: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_attempts: 3,
            idle_sleep: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Coordinates processing of pending workflow events against one store.
pub struct Orchestrator {
    store: EventStore,
    handlers: HandlerRegistry,
    publisher: Option<Arc<dyn NotificationPublisher>>,
    batch_size: i64,
    max_attempts: u32,
    idle_sleep: Duration,
    backoff: BackoffPolicy,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Build an orchestrator over `store` with the given handler registry.
    ///
    /// The reserved `UserReplyReceived` handler is registered automatically
    /// unless the caller already provided one.
    pub fn new(store: EventStore, mut handlers: HandlerRegistry, config: OrchestratorConfig) -> Self {
        if !handlers.contains(USER_REPLY_RECEIVED) {
            handlers.register(
                USER_REPLY_RECEIVED,
                Arc::new(UserReplyHandler::new(store.clone())),
            );
        }
        Self {
            store,
            handlers,
            publisher: None,
            batch_size: config.batch_size.max(1),
            max_attempts: config.max_attempts.max(1),
            idle_sleep: config.idle_sleep,
            backoff: config.backoff,
            cancel: CancellationToken::new(),
        }
    }

    /// Attach the notification publisher invoked after `WAITING_USER`
    /// finalizations.
    pub fn with_publisher(mut self, publisher: Arc<dyn NotificationPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Token that stops the loop when cancelled. Clone freely.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Poll and process until the cancellation token fires.
    pub async fn run_forever(&self) {
        info!(batch_size = self.batch_size, "orchestrator started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let processed = match self.run_once().await {
                Ok(n) => n,
                Err(err) => {
                    // Storage hiccups are survivable: log, idle, poll again.
                    error!(error = %err, "poll_failed");
                    0
                }
            };
            if processed == 0 && !self.sleep_unless_cancelled(self.idle_sleep).await {
                break;
            }
        }
        info!("orchestrator stopped");
    }

    /// Process a single batch of pending events; returns how many were
    /// dispatched to a handler.
    pub async fn run_once(&self) -> Result<usize, StoreError> {
        let events = self.store.list_pending(self.batch_size).await?;
        let mut processed = 0;
        for event in events {
            if self.cancel.is_cancelled() {
                break;
            }
            let Some(claimed) = self.claim(&event).await else {
                continue;
            };
            self.process(claimed).await;
            processed += 1;
        }
        Ok(processed)
    }

    // -----------------------------------------------------------------------
    // Claim
    // -----------------------------------------------------------------------

    async fn claim(&self, event: &Event) -> Option<Event> {
        let result = self
            .store
            .update_if_unchanged(
                &event.event_id,
                EventPatch::status(EventStatus::InProgress),
                event.updated_at,
            )
            .await;
        match result {
            Ok(claimed) => {
                info!(
                    event_id = %claimed.event_id,
                    event_type = %claimed.event_type,
                    "event_claimed"
                );
                Some(claimed)
            }
            Err(StoreError::Concurrency(_)) => {
                warn!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    "claim_conflict"
                );
                None
            }
            Err(StoreError::IllegalTransition(detail)) => {
                error!(
                    event_id = %event.event_id,
                    from = %detail.from,
                    to = %detail.to,
                    "claim_invalid_transition"
                );
                None
            }
            Err(err) => {
                error!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    error = %err,
                    "claim_failed"
                );
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    async fn process(&self, mut event: Event) {
        let Some(handler) = self.handlers.get(&event.event_type) else {
            error!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                "handler_missing"
            );
            self.fail_event(
                &event,
                "handler_missing",
                format!("no handler registered for {}", event.event_type),
            )
            .await;
            return;
        };

        let mut attempt = event.retries;
        while attempt < self.max_attempts {
            match handler.handle(&event).await {
                Ok(outcome) => {
                    self.finalize(&event, outcome).await;
                    return;
                }
                Err(handler_err) => {
                    attempt += 1;
                    let message = handler_err.to_string();
                    match self
                        .store
                        .update(
                            &event.event_id,
                            EventPatch::attempt_failed(attempt, message.clone()),
                        )
                        .await
                    {
                        Ok(updated) => event = updated,
                        Err(store_err) => {
                            // Retry bookkeeping failed; abandon this event
                            // for now and let the loop continue.
                            error!(
                                event_id = %event.event_id,
                                error = %store_err,
                                "retry_bookkeeping_failed"
                            );
                            return;
                        }
                    }
                    error!(
                        event_id = %event.event_id,
                        event_type = %event.event_type,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %message,
                        "handler_error"
                    );
                    if attempt >= self.max_attempts {
                        self.fail_event(&event, "max_retries", message).await;
                        return;
                    }
                    let delay = self.backoff.delay_for(attempt);
                    if !self.sleep_unless_cancelled(delay).await {
                        // Loop is shutting down; the event stays claimed.
                        return;
                    }
                }
            }
        }

        // Only reachable when the event arrived with its budget already
        // spent (retries persisted by a previous incarnation).
        self.fail_event(&event, "max_retries", "retry limit reached".to_string())
            .await;
    }

    // -----------------------------------------------------------------------
    // Finalize
    // -----------------------------------------------------------------------

    async fn finalize(&self, event: &Event, outcome: HandlerOutcome) {
        let fin = Finalization::from_outcome(outcome);

        let clear_error =
            matches!(fin.status, EventStatus::Completed | EventStatus::WaitingUser);
        let patch = EventPatch {
            status: Some(fin.status),
            payload: fin.payload,
            labels: fin.labels,
            correlation_id: fin.correlation_id,
            last_error: fin.last_error,
            clear_last_error: clear_error,
            ..EventPatch::default()
        };

        let updated = match self.store.update(&event.event_id, patch).await {
            Ok(updated) => updated,
            Err(err) => {
                error!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    error = %err,
                    "event_unhandled_exception"
                );
                self.fail_event(event, "unhandled_exception", err.to_string())
                    .await;
                return;
            }
        };

        match updated.status {
            EventStatus::Completed => {
                info!(
                    event_id = %updated.event_id,
                    event_type = %updated.event_type,
                    "event_completed"
                );
            }
            EventStatus::WaitingUser => {
                info!(
                    event_id = %updated.event_id,
                    event_type = %updated.event_type,
                    labels = ?updated.labels,
                    "event_waiting_user"
                );
                if let Some(notification) = fin.notification {
                    self.publish_notification(&updated, notification).await;
                }
            }
            EventStatus::Failed => {
                error!(
                    event_id = %updated.event_id,
                    event_type = %updated.event_type,
                    "event_failed"
                );
            }
            _ => {}
        }
    }

    async fn publish_notification(&self, event: &Event, notification: Notification) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        let mut payload = Map::new();
        payload.insert("event_id".into(), Value::String(event.event_id.clone()));
        payload.insert("to".into(), Value::String(notification.to));
        payload.insert("subject".into(), Value::String(notification.subject));
        payload.insert("body".into(), Value::String(notification.body));
        if let Err(err) = publisher.publish(EMAIL_SEND_REQUESTED, payload).await {
            error!(
                event_id = %event.event_id,
                error = %err,
                "publish_failed"
            );
        }
    }

    async fn fail_event(&self, event: &Event, reason: &str, message: String) {
        let patch = EventPatch {
            status: Some(EventStatus::Failed),
            last_error: Some(message),
            ..EventPatch::default()
        };
        match self.store.update(&event.event_id, patch).await {
            Ok(failed) => {
                error!(
                    event_id = %failed.event_id,
                    event_type = %failed.event_type,
                    reason,
                    "event_failed"
                );
            }
            Err(_) => {
                // The row may have been canceled under us; nothing to do.
            }
        }
    }

    /// Returns `false` when cancellation interrupted the sleep.
    async fn sleep_unless_cancelled(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome decomposition
// ---------------------------------------------------------------------------

/// Flattened view of a [`HandlerOutcome`], ready to become a patch.
struct Finalization {
    status: EventStatus,
    payload: Option<Map<String, Value>>,
    labels: Option<Vec<String>>,
    correlation_id: Option<String>,
    notification: Option<Notification>,
    last_error: Option<String>,
}

impl Finalization {
    fn from_outcome(outcome: HandlerOutcome) -> Self {
        match outcome {
            HandlerOutcome::Completed { payload, labels } => Self {
                status: EventStatus::Completed,
                payload,
                labels,
                correlation_id: None,
                notification: None,
                last_error: None,
            },
            HandlerOutcome::WaitingUser {
                notification,
                payload,
            } => Self {
                status: EventStatus::WaitingUser,
                payload,
                labels: None,
                correlation_id: None,
                notification: Some(notification),
                last_error: None,
            },
            HandlerOutcome::Failed { error } => Self {
                status: EventStatus::Failed,
                payload: None,
                labels: None,
                correlation_id: None,
                notification: None,
                last_error: Some(error),
            },
            HandlerOutcome::Finalize {
                status,
                payload,
                labels,
                correlation_id,
                notification,
            } => Self {
                status,
                payload,
                labels,
                correlation_id,
                notification,
                last_error: None,
            },
        }
    }
}
