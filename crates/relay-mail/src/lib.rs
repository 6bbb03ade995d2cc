//! E-mail adapters: the outbound correlation mailer and the inbound reply
//! reader.
//!
//! Outbound mail carries the referenced event id through three channels
//! (the `[ref:<id>]` subject marker, a visible `Reference: <id>` body line,
//! and the `X-Event-ID` header) so a human reply can be routed back to the
//! exact event that is waiting on it. Inbound parsing resolves those
//! channels in header → subject → body order and republishes the reply as a
//! `UserReplyReceived` event; it never mutates the referenced event
//! directly.

pub mod inbound;
pub mod outbound;
pub mod send_handler;
pub mod smtp;

use thiserror::Error;

use relay_engine::PublishError;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("event_id must be provided for correlated e-mails")]
    MissingEventId,
    #[error("invalid mail address: {0}")]
    Address(String),
    #[error("failed to compose message: {0}")]
    Compose(String),
    #[error("mail transport failure: {0}")]
    Transport(String),
    #[error("failed to parse inbound message: {0}")]
    Parse(String),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

pub use inbound::{ReplyAttachment, ReplyReader};
pub use outbound::{ComposedEmail, MailTransport, Mailer, OutboundAttachment, OutboundEmail};
pub use send_handler::EmailSendRequestedHandler;
pub use smtp::SmtpMailer;
