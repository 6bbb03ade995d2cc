//! Production SMTP transport built on lettre.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::{ContentType, Header, HeaderName, HeaderValue};
use lettre::message::{Attachment, Mailbox, Message, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};
use tracing::debug;
use uuid::Uuid;

use crate::outbound::{ComposedEmail, MailTransport};
use crate::MailError;

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Correlation headers
// ---------------------------------------------------------------------------

macro_rules! plain_header {
    ($name:ident, $wire:literal) => {
        #[derive(Debug, Clone)]
        struct $name(String);

        impl Header for $name {
            fn name() -> HeaderName {
                HeaderName::new_from_ascii_str($wire)
            }

            fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
                Ok(Self(s.to_string()))
            }

            fn display(&self) -> HeaderValue {
                HeaderValue::new(Self::name(), self.0.clone())
            }
        }
    };
}

plain_header!(XEventId, "X-Event-ID");
plain_header!(InReplyTo, "In-Reply-To");
plain_header!(References, "References");

// ---------------------------------------------------------------------------
// SmtpMailer
// ---------------------------------------------------------------------------

/// Sends composed messages through an SMTP relay.
///
/// The Message-ID is generated locally before the send and returned to the
/// caller; SMTP itself does not echo one back.
#[derive(Clone)]
pub struct SmtpMailer {
    transport: SmtpTransport,
    host: String,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(
        host: &str,
        port: u16,
        username: String,
        password: String,
        from: &str,
    ) -> Result<Self, MailError> {
        let transport = SmtpTransport::relay(host)
            .map_err(|err| MailError::Transport(format!("SMTP relay setup failed: {err}")))?
            .port(port)
            .credentials(Credentials::new(username, password))
            .timeout(Some(SEND_TIMEOUT))
            .build();
        let from = from
            .parse()
            .map_err(|err| MailError::Address(format!("invalid sender {from}: {err}")))?;
        Ok(Self {
            transport,
            host: host.to_string(),
            from,
        })
    }

    fn build_message(&self, email: &ComposedEmail, message_id: &str) -> Result<Message, MailError> {
        let from: Mailbox = match &email.sender {
            Some(sender) => sender
                .parse()
                .map_err(|err| MailError::Address(format!("invalid sender {sender}: {err}")))?,
            None => self.from.clone(),
        };
        let to: Mailbox = email
            .to
            .parse()
            .map_err(|err| MailError::Address(format!("invalid recipient {}: {err}", email.to)))?;

        let mut builder = Message::builder()
            .from(from)
            .to(to)
            .subject(email.subject.clone())
            .message_id(Some(message_id.to_string()));

        for (name, value) in &email.headers {
            builder = match name.as_str() {
                "X-Event-ID" => builder.header(XEventId(value.clone())),
                "In-Reply-To" => builder.header(InReplyTo(value.clone())),
                "References" => builder.header(References(value.clone())),
                other => {
                    // Arbitrary extra headers are not representable through
                    // lettre's typed header API; they are dropped here but
                    // still visible to non-SMTP transports.
                    debug!(header = other, "dropping unsupported outbound header");
                    builder
                }
            };
        }

        let message = if email.attachments.is_empty() {
            builder
                .header(ContentType::TEXT_PLAIN)
                .body(email.body.clone())
                .map_err(|err| MailError::Compose(err.to_string()))?
        } else {
            let mut multipart = MultiPart::mixed().singlepart(
                SinglePart::builder()
                    .header(ContentType::TEXT_PLAIN)
                    .body(email.body.clone()),
            );
            for attachment in &email.attachments {
                let content_type = attachment
                    .content_type
                    .parse::<ContentType>()
                    .unwrap_or(ContentType::TEXT_PLAIN);
                multipart = multipart.singlepart(
                    Attachment::new(attachment.filename.clone())
                        .body(attachment.content.clone(), content_type),
                );
            }
            builder
                .multipart(multipart)
                .map_err(|err| MailError::Compose(err.to_string()))?
        };

        Ok(message)
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn deliver(&self, email: &ComposedEmail) -> Result<Option<String>, MailError> {
        let message_id = format!("<{}@{}>", Uuid::new_v4(), self.host);
        let message = self.build_message(email, &message_id)?;

        // lettre's SmtpTransport is blocking; keep the worker loop free.
        let transport = self.transport.clone();
        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|err| MailError::Transport(format!("send task failed: {err}")))?
            .map_err(|err| MailError::Transport(err.to_string()))?;

        Ok(Some(message_id))
    }
}
