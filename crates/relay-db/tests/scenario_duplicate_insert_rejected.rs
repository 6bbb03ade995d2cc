//! Scenario: Duplicate Insert Rejected
//!
//! # Invariant under test
//! `event_id` is unique across the store; inserting the same id twice fails
//! with `DuplicateKey` and leaves the first row untouched.

use relay_core::Event;
use relay_db::{EventStore, StoreError};
use serde_json::json;

async fn open_store() -> anyhow::Result<(tempfile::TempDir, EventStore)> {
    let dir = tempfile::tempdir()?;
    let store = EventStore::open(dir.path().join("events.db")).await?;
    store.migrate().await?;
    Ok((dir, store))
}

#[tokio::test]
async fn second_insert_with_same_id_fails_duplicate_key() -> anyhow::Result<()> {
    let (_dir, store) = open_store().await?;

    let first = Event::new("EVT-20250101000000-AAAAAAAAAA", "Demo")
        .with_payload(json!({"n": 1}).as_object().cloned().unwrap());
    store.create_event(&first).await?;

    let second = Event::new("EVT-20250101000000-AAAAAAAAAA", "Other");
    let err = store.create_event(&second).await.unwrap_err();
    assert!(
        matches!(err, StoreError::DuplicateKey(ref id) if id == &first.event_id),
        "expected DuplicateKey, got {err:?}"
    );

    // First row must be untouched.
    let stored = store.get(&first.event_id).await?.expect("row must exist");
    assert_eq!(stored.event_type, "Demo");
    assert_eq!(stored.payload["n"], 1);

    Ok(())
}

#[tokio::test]
async fn rows_survive_reopening_the_database() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("events.db");

    {
        let store = EventStore::open(&path).await?;
        store.migrate().await?;
        store
            .create_event(&Event::new("EVT-20250101000000-BBBBBBBBBB", "Demo"))
            .await?;
    }

    let reopened = EventStore::open(&path).await?;
    reopened.migrate().await?;
    let stored = reopened.get("EVT-20250101000000-BBBBBBBBBB").await?;
    assert!(stored.is_some(), "row must survive a process restart");

    Ok(())
}
