//! Scenario: Outbound Correlation Round Trip
//!
//! # Invariant under test
//! The mailer stamps every outbound message with the `[ref:<id>]` subject
//! marker, one visible `Reference:` body line and the `X-Event-ID` header,
//! persists the transport's Message-ID as the event's correlation id, and
//! treats a failed correlation write as a warning, never as an undone send.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use relay_core::Event;
use relay_db::EventStore;
use relay_mail::{ComposedEmail, MailError, MailTransport, Mailer, OutboundEmail};

// ---------------------------------------------------------------------------
// Recording transport
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<ComposedEmail>>,
    message_id: Option<String>,
}

impl RecordingTransport {
    fn returning(message_id: &str) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            message_id: Some(message_id.to_string()),
        })
    }

    fn silent() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn last(&self) -> ComposedEmail {
        self.sent.lock().unwrap().last().cloned().expect("a message was sent")
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn deliver(&self, email: &ComposedEmail) -> Result<Option<String>, MailError> {
        self.sent.lock().unwrap().push(email.clone());
        Ok(self.message_id.clone())
    }
}

async fn open_store() -> anyhow::Result<(tempfile::TempDir, EventStore)> {
    let dir = tempfile::tempdir()?;
    let store = EventStore::open(dir.path().join("events.db")).await?;
    store.migrate().await?;
    Ok((dir, store))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn send_stamps_and_persists_the_correlation() -> anyhow::Result<()> {
    let (_dir, store) = open_store().await?;
    let event = Event::new("EVT-20250101000000-MAIL000000", "Research");
    store.create_event(&event).await?;

    let transport = RecordingTransport::returning("<out-1@relay>");
    let mailer = Mailer::new(transport.clone(), store.clone());

    let message_id = mailer
        .send(OutboundEmail {
            to: "u@x".into(),
            subject: "Follow-up".into(),
            body: "Please reply.".into(),
            event_id: event.event_id.clone(),
            ..OutboundEmail::default()
        })
        .await?;
    assert_eq!(message_id.as_deref(), Some("<out-1@relay>"));

    let composed = transport.last();
    assert_eq!(composed.subject, "Follow-up [ref:EVT-20250101000000-MAIL000000]");
    assert!(composed.body.contains("Reference: EVT-20250101000000-MAIL000000"));
    assert!(composed
        .headers
        .contains(&("X-Event-ID".to_string(), event.event_id.clone())));

    let stored = store.get(&event.event_id).await?.unwrap();
    assert_eq!(stored.correlation_id.as_deref(), Some("<out-1@relay>"));

    Ok(())
}

#[tokio::test]
async fn resending_stamped_content_adds_no_second_marker() -> anyhow::Result<()> {
    let (_dir, store) = open_store().await?;
    let event = Event::new("EVT-20250101000000-MAIL000001", "Research");
    store.create_event(&event).await?;

    let transport = RecordingTransport::returning("<out-2@relay>");
    let mailer = Mailer::new(transport.clone(), store.clone());

    mailer
        .send(OutboundEmail {
            to: "u@x".into(),
            subject: "Reminder".into(),
            body: "Still waiting.".into(),
            event_id: event.event_id.clone(),
            ..OutboundEmail::default()
        })
        .await?;
    let first = transport.last();

    // Feed the already-stamped subject and body back through.
    mailer
        .send(OutboundEmail {
            to: "u@x".into(),
            subject: first.subject.clone(),
            body: first.body.clone(),
            event_id: event.event_id.clone(),
            ..OutboundEmail::default()
        })
        .await?;
    let second = transport.last();

    let subject_marker = format!("[ref:{}]", event.event_id);
    assert_eq!(second.subject.matches(&subject_marker).count(), 1);
    let body_marker = format!("Reference: {}", event.event_id);
    assert_eq!(second.body.matches(&body_marker).count(), 1);
    assert_eq!(second.subject, first.subject);
    assert_eq!(second.body, first.body);

    Ok(())
}

#[tokio::test]
async fn empty_event_id_is_rejected_before_sending() -> anyhow::Result<()> {
    let (_dir, store) = open_store().await?;
    let transport = RecordingTransport::returning("<never@relay>");
    let mailer = Mailer::new(transport.clone(), store.clone());

    let err = mailer
        .send(OutboundEmail {
            to: "u@x".into(),
            subject: "s".into(),
            body: "b".into(),
            event_id: "  ".into(),
            ..OutboundEmail::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, MailError::MissingEventId));
    assert!(transport.sent.lock().unwrap().is_empty());

    Ok(())
}

#[tokio::test]
async fn transport_without_message_id_skips_the_correlation_write() -> anyhow::Result<()> {
    let (_dir, store) = open_store().await?;
    let event = Event::new("EVT-20250101000000-MAIL000002", "Research");
    store.create_event(&event).await?;

    let transport = RecordingTransport::silent();
    let mailer = Mailer::new(transport.clone(), store.clone());

    let message_id = mailer
        .send(OutboundEmail {
            to: "u@x".into(),
            subject: "s".into(),
            body: "b".into(),
            event_id: event.event_id.clone(),
            ..OutboundEmail::default()
        })
        .await?;
    assert!(message_id.is_none());
    assert!(store.get(&event.event_id).await?.unwrap().correlation_id.is_none());

    Ok(())
}

#[tokio::test]
async fn failed_correlation_write_does_not_undo_the_send() -> anyhow::Result<()> {
    let (_dir, store) = open_store().await?;

    // No such event in the store: the write-back will fail NotFound.
    let transport = RecordingTransport::returning("<out-3@relay>");
    let mailer = Mailer::new(transport.clone(), store.clone());

    let message_id = mailer
        .send(OutboundEmail {
            to: "u@x".into(),
            subject: "s".into(),
            body: "b".into(),
            event_id: "EVT-20250101000000-GONE000000".into(),
            ..OutboundEmail::default()
        })
        .await?;
    assert_eq!(message_id.as_deref(), Some("<out-3@relay>"));
    assert_eq!(transport.sent.lock().unwrap().len(), 1);

    Ok(())
}

#[tokio::test]
async fn reply_threading_headers_are_normalized() -> anyhow::Result<()> {
    let (_dir, store) = open_store().await?;
    let event = Event::new("EVT-20250101000000-MAIL000003", "Research");
    store.create_event(&event).await?;

    let transport = RecordingTransport::returning("<out-4@relay>");
    let mailer = Mailer::new(transport.clone(), store.clone());

    mailer
        .send(OutboundEmail {
            to: "u@x".into(),
            subject: "s".into(),
            body: "b".into(),
            event_id: event.event_id.clone(),
            correlation_id: Some("prev@relay".into()),
            ..OutboundEmail::default()
        })
        .await?;

    let composed = transport.last();
    assert!(composed
        .headers
        .contains(&("In-Reply-To".to_string(), "<prev@relay>".to_string())));
    assert!(composed
        .headers
        .contains(&("References".to_string(), "<prev@relay>".to_string())));

    Ok(())
}
