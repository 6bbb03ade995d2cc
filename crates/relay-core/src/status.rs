//! Event lifecycle state machine.
//!
//! # Design
//!
//! An event moves through a closed set of states. Every status write goes
//! through [`validate_transition`], which enforces two invariants:
//!
//! 1. **Legal transitions only.** Illegal pairs return [`TransitionError`]
//!    carrying the current state, the attempted state, and the full allowed
//!    set, so callers can log the structured detail instead of retrying.
//! 2. **Terminal states stay terminal.** `Completed`, `Failed` and
//!    `Canceled` admit no forward transition; `Canceled` itself is reachable
//!    from anywhere as the operator escape hatch.
//!
//! # State diagram
//!
//! ```text
//!  Pending ──► InProgress ──► Completed (term.)
//!                 │   │
//!                 │   └──────► Failed (term.)
//!                 ▼
//!            WaitingUser ──► Pending | InProgress | Failed
//!
//!  (any state) ──► Canceled (term.)
//! ```
//!
//! A same-state write is a no-op and always legal.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// EventStatus
// ---------------------------------------------------------------------------

/// All valid lifecycle states an event can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    /// Waiting to be claimed by a worker.
    Pending,
    /// Claimed; a handler invocation is (or was) in flight.
    InProgress,
    /// Suspended until a correlated operator reply arrives.
    WaitingUser,
    /// Handler finished successfully. **Terminal.**
    Completed,
    /// Retry budget exhausted or fatal handler outcome. **Terminal.**
    Failed,
    /// Withdrawn by an operator. **Terminal.**
    Canceled,
}

impl EventStatus {
    /// Wire string, as it appears in the database and in API responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "PENDING",
            EventStatus::InProgress => "IN_PROGRESS",
            EventStatus::WaitingUser => "WAITING_USER",
            EventStatus::Completed => "COMPLETED",
            EventStatus::Failed => "FAILED",
            EventStatus::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, InvalidStatus> {
        match s {
            "PENDING" => Ok(EventStatus::Pending),
            "IN_PROGRESS" => Ok(EventStatus::InProgress),
            "WAITING_USER" => Ok(EventStatus::WaitingUser),
            "COMPLETED" => Ok(EventStatus::Completed),
            "FAILED" => Ok(EventStatus::Failed),
            "CANCELED" => Ok(EventStatus::Canceled),
            other => Err(InvalidStatus(other.to_string())),
        }
    }

    /// Returns `true` if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventStatus::Completed | EventStatus::Failed | EventStatus::Canceled
        )
    }

    /// Forward transitions admitted from this state, excluding the
    /// always-available `Canceled` escape hatch.
    fn forward_transitions(&self) -> &'static [EventStatus] {
        match self {
            EventStatus::Pending => &[EventStatus::InProgress],
            EventStatus::InProgress => &[
                EventStatus::Completed,
                EventStatus::WaitingUser,
                EventStatus::Failed,
            ],
            EventStatus::WaitingUser => &[
                EventStatus::Pending,
                EventStatus::InProgress,
                EventStatus::Failed,
            ],
            EventStatus::Completed | EventStatus::Failed | EventStatus::Canceled => &[],
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a status string read from storage or the wire is not one of
/// the six lifecycle states.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid event status: {0}")]
pub struct InvalidStatus(pub String);

// ---------------------------------------------------------------------------
// Transition validation
// ---------------------------------------------------------------------------

/// Returned when a status write would violate the lifecycle guard.
///
/// Carries the full allowed set so the rejection can be logged (or surfaced
/// to an operator) without consulting the matrix again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition from {from} to {to}; allowed: {}", format_allowed(.allowed))]
pub struct TransitionError {
    pub from: EventStatus,
    pub to: EventStatus,
    /// Every status legal from `from`, sorted by wire string.
    pub allowed: Vec<EventStatus>,
}

fn format_allowed(allowed: &[EventStatus]) -> String {
    if allowed.is_empty() {
        return "∅".to_string();
    }
    allowed
        .iter()
        .map(EventStatus::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Statuses reachable from `current`, sorted by wire string.
///
/// `Canceled` is always a member: an operator may withdraw an event
/// regardless of where it sits.
pub fn allowed_transitions(current: EventStatus) -> Vec<EventStatus> {
    let mut allowed: Vec<EventStatus> = current.forward_transitions().to_vec();
    if !allowed.contains(&EventStatus::Canceled) {
        allowed.push(EventStatus::Canceled);
    }
    allowed.sort_by_key(|status| status.as_str());
    allowed
}

/// Validate the transition from `current` to `next`.
///
/// A same-state write is a no-op and always passes. Everything else must be
/// in [`allowed_transitions`]. The caller decides what a rejection means;
/// this function never mutates anything.
pub fn validate_transition(current: EventStatus, next: EventStatus) -> Result<(), TransitionError> {
    if next == current {
        return Ok(());
    }
    let allowed = allowed_transitions(current);
    if allowed.contains(&next) {
        return Ok(());
    }
    Err(TransitionError {
        from: current,
        to: next,
        allowed,
    })
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
