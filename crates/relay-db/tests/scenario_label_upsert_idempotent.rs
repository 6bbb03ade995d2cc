//! Scenario: Label Upsert Is Idempotent
//!
//! # Invariant under test
//! `upsert_label` appends a missing label exactly once, preserves insertion
//! order, and a repeat application changes nothing, not even `updated_at`.

use relay_core::Event;
use relay_db::{EventStore, StoreError};

async fn open_store() -> anyhow::Result<(tempfile::TempDir, EventStore)> {
    let dir = tempfile::tempdir()?;
    let store = EventStore::open(dir.path().join("events.db")).await?;
    store.migrate().await?;
    Ok((dir, store))
}

#[tokio::test]
async fn repeat_upsert_is_a_noop() -> anyhow::Result<()> {
    let (_dir, store) = open_store().await?;

    let event = Event::new("EVT-20250101000000-LABEL00000", "Demo");
    store.create_event(&event).await?;

    store.upsert_label(&event.event_id, "research").await?;
    let after_first = store.get(&event.event_id).await?.unwrap();
    assert_eq!(after_first.labels, vec!["research"]);

    store.upsert_label(&event.event_id, "research").await?;
    let after_second = store.get(&event.event_id).await?.unwrap();
    assert_eq!(after_second.labels, vec!["research"]);
    assert_eq!(
        after_second.updated_at, after_first.updated_at,
        "a no-op upsert must not advance the concurrency token"
    );

    Ok(())
}

#[tokio::test]
async fn labels_preserve_insertion_order() -> anyhow::Result<()> {
    let (_dir, store) = open_store().await?;

    let event = Event::new("EVT-20250101000000-LABEL00001", "Demo");
    store.create_event(&event).await?;

    store.upsert_label(&event.event_id, "beta").await?;
    store.upsert_label(&event.event_id, "alpha").await?;
    store.upsert_label(&event.event_id, "beta").await?;

    assert_eq!(store.get_labels(&event.event_id).await?, vec!["beta", "alpha"]);

    Ok(())
}

#[tokio::test]
async fn upsert_on_missing_event_fails_not_found() -> anyhow::Result<()> {
    let (_dir, store) = open_store().await?;

    let err = store
        .upsert_label("EVT-20250101000000-NOROW00000", "x")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));

    Ok(())
}
