//! Orchestrator runtime: polls the event store, claims pending events,
//! dispatches them to type-keyed handlers, retries transient failures with
//! bounded backoff, and suspends work that needs operator input.
//!
//! The orchestrator is the sole writer of an event's status and retry
//! counter while it holds the claim. Handlers communicate exclusively
//! through [`relay_core::HandlerOutcome`]; notification side effects go
//! through the [`NotificationPublisher`] seam after the store write commits.

pub mod orchestrator;
pub mod publish;
pub mod registry;
pub mod reply;

pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use publish::{NotificationPublisher, PublishError, StorePublisher, EMAIL_SEND_REQUESTED};
pub use registry::HandlerRegistry;
pub use reply::{UserReplyHandler, USER_REPLY_RECEIVED};
