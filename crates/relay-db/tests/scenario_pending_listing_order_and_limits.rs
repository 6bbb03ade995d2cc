//! Scenario: Pending Listing Order And Limits
//!
//! # Invariant under test
//! `list_pending` returns `PENDING` rows oldest `updated_at` first up to the
//! limit, a non-positive limit returns empty without touching the pool, and
//! the diagnostics listing paginates newest-created first with an optional
//! correlation filter.

use relay_core::{Event, EventPatch, EventStatus};
use relay_db::EventStore;

async fn open_store() -> anyhow::Result<(tempfile::TempDir, EventStore)> {
    let dir = tempfile::tempdir()?;
    let store = EventStore::open(dir.path().join("events.db")).await?;
    store.migrate().await?;
    Ok((dir, store))
}

#[tokio::test]
async fn pending_rows_come_back_oldest_first() -> anyhow::Result<()> {
    let (_dir, store) = open_store().await?;

    for suffix in ["ORDER00000", "ORDER00001", "ORDER00002"] {
        store
            .create_event(&Event::new(format!("EVT-20250101000000-{suffix}"), "Demo"))
            .await?;
        // Distinct microsecond tokens are guaranteed by the store, but give
        // the wall clock room so insertion order is unambiguous.
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    let pending = store.list_pending(10).await?;
    let ids: Vec<&str> = pending.iter().map(|e| e.event_id.as_str()).collect();
    assert_eq!(
        ids,
        vec![
            "EVT-20250101000000-ORDER00000",
            "EVT-20250101000000-ORDER00001",
            "EVT-20250101000000-ORDER00002",
        ]
    );

    let limited = store.list_pending(2).await?;
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].event_id, "EVT-20250101000000-ORDER00000");

    Ok(())
}

#[tokio::test]
async fn non_positive_limit_returns_empty() -> anyhow::Result<()> {
    let (_dir, store) = open_store().await?;
    store
        .create_event(&Event::new("EVT-20250101000000-LIMIT00000", "Demo"))
        .await?;

    assert!(store.list_pending(0).await?.is_empty());
    assert!(store.list_pending(-5).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn status_listing_excludes_other_states() -> anyhow::Result<()> {
    let (_dir, store) = open_store().await?;

    store
        .create_event(&Event::new("EVT-20250101000000-MIX0000000", "Demo"))
        .await?;
    store
        .create_event(&Event::new("EVT-20250101000000-MIX0000001", "Demo"))
        .await?;
    store
        .update(
            "EVT-20250101000000-MIX0000001",
            EventPatch::status(EventStatus::InProgress),
        )
        .await?;

    let pending = store.list_pending(10).await?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].event_id, "EVT-20250101000000-MIX0000000");

    let in_progress = store.list_by_status(EventStatus::InProgress, 10).await?;
    assert_eq!(in_progress.len(), 1);
    assert_eq!(in_progress[0].event_id, "EVT-20250101000000-MIX0000001");

    Ok(())
}

#[tokio::test]
async fn diagnostics_listing_filters_by_correlation_id() -> anyhow::Result<()> {
    let (_dir, store) = open_store().await?;

    store
        .create_event(&Event::new("EVT-20250101000000-DIAG000000", "Demo"))
        .await?;
    store
        .create_event(&Event::new("EVT-20250101000000-DIAG000001", "Demo"))
        .await?;
    store
        .update(
            "EVT-20250101000000-DIAG000001",
            EventPatch::correlation("<out-1@relay>"),
        )
        .await?;

    let all = store.list_events(50, 0, None).await?;
    assert_eq!(all.len(), 2);

    let correlated = store.list_events(50, 0, Some("<out-1@relay>")).await?;
    assert_eq!(correlated.len(), 1);
    assert_eq!(correlated[0].event_id, "EVT-20250101000000-DIAG000001");

    let offset_past_end = store.list_events(50, 10, None).await?;
    assert!(offset_past_end.is_empty());

    Ok(())
}
