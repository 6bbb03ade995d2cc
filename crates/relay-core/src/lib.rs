//! Core domain types for the workflow engine.
//!
//! Everything in this crate is persistence-free: the lifecycle state
//! machine, the event record and patch types, identifier generation, the
//! retry/backoff policy, payload schema validation, and the handler
//! contract. The store (`relay-db`) and the orchestrator (`relay-engine`)
//! build on these without this crate knowing either exists.

pub mod event;
pub mod handler;
pub mod id;
pub mod retry;
pub mod schema;
pub mod status;

pub use event::{Event, EventPatch};
pub use handler::{handler_fn, EventHandler, HandlerError, HandlerOutcome, Notification};
pub use id::{new_event_id, new_event_id_with_prefix};
pub use retry::BackoffPolicy;
pub use schema::{FieldKind, PayloadSchema, SchemaRegistry, SchemaViolation};
pub use status::{allowed_transitions, validate_transition, EventStatus, InvalidStatus, TransitionError};
