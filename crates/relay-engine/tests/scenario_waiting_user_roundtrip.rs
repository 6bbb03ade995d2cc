//! Scenario: Waiting For User, Then Resuming
//!
//! # Invariant under test
//! A handler that needs operator input parks its event in `WAITING_USER`
//! with a published `EmailSendRequested` notification; an ingested
//! `UserReplyReceived` event moves the parked event back to `PENDING`
//! (stamping the reply's Message-ID as correlation), and the next dispatch
//! completes it. A late reply changes nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use relay_core::{
    handler_fn, new_event_id, BackoffPolicy, Event, EventPatch, EventStatus, HandlerOutcome,
    Notification,
};
use relay_db::EventStore;
use relay_engine::{
    HandlerRegistry, NotificationPublisher, Orchestrator, OrchestratorConfig, StorePublisher,
    EMAIL_SEND_REQUESTED, USER_REPLY_RECEIVED,
};
use serde_json::{json, Map, Value};

async fn open_store() -> anyhow::Result<(tempfile::TempDir, EventStore)> {
    let dir = tempfile::tempdir()?;
    let store = EventStore::open(dir.path().join("events.db")).await?;
    store.migrate().await?;
    Ok((dir, store))
}

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        backoff: BackoffPolicy::none(),
        ..OrchestratorConfig::default()
    }
}

/// Waits for input on the first call, completes afterwards.
fn wait_then_complete() -> Arc<dyn relay_core::EventHandler> {
    let resumed = Arc::new(AtomicBool::new(false));
    Arc::new(handler_fn(move |_: Event| {
        let resumed = resumed.clone();
        async move {
            if resumed.swap(true, Ordering::SeqCst) {
                Ok(HandlerOutcome::completed())
            } else {
                Ok(HandlerOutcome::waiting_user(Notification::new(
                    "u@x",
                    "Follow-up",
                    "Please reply.",
                )))
            }
        }
    }))
}

/// Stand-in for the mailer-backed handler: acknowledges the notification
/// event so the loop can drain it.
fn ack_notifications() -> Arc<dyn relay_core::EventHandler> {
    Arc::new(handler_fn(|_: Event| async { Ok(HandlerOutcome::completed()) }))
}

async fn ingest_reply(
    store: &EventStore,
    referenced: &str,
    message_id: &str,
) -> anyhow::Result<Event> {
    let publisher = StorePublisher::new(store.clone());
    let mut payload = Map::new();
    payload.insert("event_id".into(), Value::String(referenced.into()));
    payload.insert("message_id".into(), Value::String(message_id.into()));
    Ok(publisher.publish(USER_REPLY_RECEIVED, payload).await?)
}

#[tokio::test]
async fn waiting_event_resumes_after_reply_and_completes() -> anyhow::Result<()> {
    let (_dir, store) = open_store().await?;

    let evt_a = Event::new(new_event_id(), "Research");
    store.create_event(&evt_a).await?;

    let mut registry = HandlerRegistry::new();
    registry.register("Research", wait_then_complete());
    registry.register(EMAIL_SEND_REQUESTED, ack_notifications());

    let orchestrator = Orchestrator::new(store.clone(), registry, fast_config())
        .with_publisher(Arc::new(StorePublisher::new(store.clone())));

    // Pass 1: the event suspends and the notification event is published.
    orchestrator.run_once().await?;
    assert_eq!(store.get_status(&evt_a.event_id).await?, EventStatus::WaitingUser);
    let stored_a = store.get(&evt_a.event_id).await?.unwrap();
    assert!(stored_a.last_error.is_none());

    let notifications = store.list_pending(10).await?;
    assert_eq!(notifications.len(), 1);
    let notification = &notifications[0];
    assert_eq!(notification.event_type, EMAIL_SEND_REQUESTED);
    assert_eq!(notification.payload["event_id"], json!(evt_a.event_id));
    assert_eq!(notification.payload["to"], json!("u@x"));
    assert_eq!(notification.payload["subject"], json!("Follow-up"));
    assert_eq!(notification.payload["body"], json!("Please reply."));

    // Pass 2: the notification event drains.
    orchestrator.run_once().await?;
    assert_eq!(
        store.get_status(&notification.event_id).await?,
        EventStatus::Completed
    );

    // A reply arrives for EVT-A.
    let reply = ingest_reply(&store, &evt_a.event_id, "<reply-1>").await?;

    // Pass 3: the reply event completes and EVT-A is pending again with the
    // reply's Message-ID as correlation.
    orchestrator.run_once().await?;
    assert_eq!(store.get_status(&reply.event_id).await?, EventStatus::Completed);
    let resumed = store.get(&evt_a.event_id).await?.unwrap();
    assert_eq!(resumed.status, EventStatus::Pending);
    assert_eq!(resumed.correlation_id.as_deref(), Some("<reply-1>"));

    // Pass 4: EVT-A completes.
    orchestrator.run_once().await?;
    assert_eq!(store.get_status(&evt_a.event_id).await?, EventStatus::Completed);

    Ok(())
}

#[tokio::test]
async fn late_reply_completes_without_touching_the_referenced_event() -> anyhow::Result<()> {
    let (_dir, store) = open_store().await?;

    // EVT-A already finished by the time the reply shows up.
    let evt_a = Event::new(new_event_id(), "Research");
    store.create_event(&evt_a).await?;
    store
        .update(&evt_a.event_id, EventPatch::status(EventStatus::InProgress))
        .await?;
    let completed = store
        .update(&evt_a.event_id, EventPatch::status(EventStatus::Completed))
        .await?;

    let reply = ingest_reply(&store, &evt_a.event_id, "<reply-late>").await?;

    let orchestrator =
        Orchestrator::new(store.clone(), HandlerRegistry::new(), fast_config());
    orchestrator.run_once().await?;

    assert_eq!(store.get_status(&reply.event_id).await?, EventStatus::Completed);
    let untouched = store.get(&evt_a.event_id).await?.unwrap();
    assert_eq!(untouched, completed, "a late reply must not alter the event");

    Ok(())
}

#[tokio::test]
async fn reply_for_unknown_event_still_completes() -> anyhow::Result<()> {
    let (_dir, store) = open_store().await?;

    let reply = ingest_reply(&store, "EVT-20250101000000-GONE000000", "<reply-x>").await?;

    let orchestrator =
        Orchestrator::new(store.clone(), HandlerRegistry::new(), fast_config());
    orchestrator.run_once().await?;

    assert_eq!(store.get_status(&reply.event_id).await?, EventStatus::Completed);

    Ok(())
}

#[tokio::test]
async fn ingesting_the_same_reply_twice_resumes_at_most_once() -> anyhow::Result<()> {
    let (_dir, store) = open_store().await?;

    let evt_a = Event::new(new_event_id(), "Research");
    store.create_event(&evt_a).await?;
    store
        .update(&evt_a.event_id, EventPatch::status(EventStatus::InProgress))
        .await?;
    store
        .update(&evt_a.event_id, EventPatch::status(EventStatus::WaitingUser))
        .await?;

    let first = ingest_reply(&store, &evt_a.event_id, "<reply-1>").await?;
    let second = ingest_reply(&store, &evt_a.event_id, "<reply-1>").await?;

    // No handler for "Research" is registered: after resumption the event
    // would fail on dispatch, so keep it out of the pending set by checking
    // between passes.
    let orchestrator =
        Orchestrator::new(store.clone(), HandlerRegistry::new(), fast_config());

    // Both reply events and the resumed EVT-A are pending; EVT-A has no
    // handler and finalizes FAILED, which is fine; the point is the status
    // chain on EVT-A: WAITING_USER → PENDING happens exactly once.
    orchestrator.run_once().await?;
    orchestrator.run_once().await?;

    assert_eq!(store.get_status(&first.event_id).await?, EventStatus::Completed);
    assert_eq!(store.get_status(&second.event_id).await?, EventStatus::Completed);

    // The second reply found EVT-A no longer WAITING_USER and left it alone:
    // its correlation id still comes from the first reply.
    let evt = store.get(&evt_a.event_id).await?.unwrap();
    assert_eq!(evt.correlation_id.as_deref(), Some("<reply-1>"));

    Ok(())
}
