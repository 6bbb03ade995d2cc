//! SQLite-backed event store with optimistic concurrency control.
//!
//! Every mutation is a read-validate-write inside a `BEGIN IMMEDIATE`
//! transaction: the writer lock is taken up front, the row is re-read and
//! validated (schema, lifecycle), and the final `UPDATE` is guarded by
//! `WHERE updated_at = <token>`. A zero row count surfaces as
//! [`StoreError::Concurrency`]. Claims pass the token they observed at
//! listing time via [`EventStore::update_if_unchanged`], so two workers
//! racing for the same `PENDING` row resolve to exactly one winner.
//!
//! The store is the only shared mutable resource in the system; it knows
//! nothing about handlers or transports.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::debug;

use relay_core::{
    validate_transition, Event, EventPatch, EventStatus, SchemaRegistry, SchemaViolation,
    TransitionError,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure taxonomy for store operations.
///
/// `Concurrency` is a benign race on the claim path; `IllegalTransition` and
/// `SchemaInvalid` are programmer errors surfaced to logs and never retried.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("event {0} already exists")]
    DuplicateKey(String),
    #[error("event {0} not found")]
    NotFound(String),
    #[error(transparent)]
    IllegalTransition(#[from] TransitionError),
    #[error("event {0} was updated concurrently")]
    Concurrency(String),
    #[error("payload rejected for event type {event_type}: {violation}")]
    SchemaInvalid {
        event_type: String,
        violation: SchemaViolation,
    },
    #[error("stored row for {event_id} is corrupt: {reason}")]
    Corrupt { event_id: String, reason: String },
    #[error("event store unavailable: {0}")]
    Storage(#[from] sqlx::Error),
}

// ---------------------------------------------------------------------------
// EventStore
// ---------------------------------------------------------------------------

/// Handle to the embedded event database. Cheap to clone.
#[derive(Clone)]
pub struct EventStore {
    pool: SqlitePool,
    schemas: Arc<SchemaRegistry>,
}

impl EventStore {
    /// Open (creating if missing) the database at `path` with no payload
    /// schemas registered.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_schemas(path, SchemaRegistry::new()).await
    }

    /// Open the database with a schema registry consulted on every update
    /// that carries a payload.
    pub async fn open_with_schemas(
        path: impl AsRef<Path>,
        schemas: SchemaRegistry,
    ) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool,
            schemas: Arc::new(schemas),
        })
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(e.into()))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inserts and reads
    // -----------------------------------------------------------------------

    /// Insert a new event row. Fails with [`StoreError::DuplicateKey`] if
    /// `event_id` already exists.
    pub async fn create_event(&self, event: &Event) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO events (
              event_id, type, status, created_at, updated_at, payload,
              labels, correlation_id, retries, last_error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(event.status.as_str())
        .bind(to_micros(event.created_at))
        .bind(to_micros(event.updated_at))
        .bind(serialize_payload(&event.payload))
        .bind(serialize_labels(&event.labels))
        .bind(&event.correlation_id)
        .bind(event.retries as i64)
        .bind(&event.last_error)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(StoreError::DuplicateKey(event.event_id.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Fetch a single event, or `None` when it does not exist.
    pub async fn get(&self, event_id: &str) -> Result<Option<Event>, StoreError> {
        let row = sqlx::query("SELECT * FROM events WHERE event_id = ?")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_event(&r)).transpose()
    }

    // -----------------------------------------------------------------------
    // Updates
    // -----------------------------------------------------------------------

    /// Atomic read-validate-write of `patch` onto `event_id`.
    ///
    /// The concurrency token is the `updated_at` read inside the write
    /// transaction; use [`update_if_unchanged`][Self::update_if_unchanged]
    /// when the caller needs its own earlier observation enforced (claims).
    pub async fn update(&self, event_id: &str, patch: EventPatch) -> Result<Event, StoreError> {
        self.update_inner(event_id, patch, None).await
    }

    /// Like [`update`][Self::update], but fails with
    /// [`StoreError::Concurrency`] when the row's `updated_at` no longer
    /// matches what the caller observed: the losing side of a claim race.
    pub async fn update_if_unchanged(
        &self,
        event_id: &str,
        patch: EventPatch,
        observed_updated_at: DateTime<Utc>,
    ) -> Result<Event, StoreError> {
        self.update_inner(event_id, patch, Some(to_micros(observed_updated_at)))
            .await
    }

    async fn update_inner(
        &self,
        event_id: &str,
        patch: EventPatch,
        observed_micros: Option<i64>,
    ) -> Result<Event, StoreError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        let result = self
            .apply_patch(&mut *conn, event_id, patch, observed_micros)
            .await;
        match result {
            Ok(event) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(event)
            }
            Err(err) => {
                // Nothing was written on any failure path; release the lock.
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(err)
            }
        }
    }

    async fn apply_patch(
        &self,
        conn: &mut sqlx::SqliteConnection,
        event_id: &str,
        patch: EventPatch,
        observed_micros: Option<i64>,
    ) -> Result<Event, StoreError> {
        let row = sqlx::query("SELECT * FROM events WHERE event_id = ?")
            .bind(event_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| StoreError::NotFound(event_id.to_string()))?;
        let current = row_to_event(&row)?;
        let current_micros = to_micros(current.updated_at);

        if let Some(observed) = observed_micros {
            if observed != current_micros {
                return Err(StoreError::Concurrency(event_id.to_string()));
            }
        }

        if let Some(payload) = &patch.payload {
            self.schemas
                .validate(&current.event_type, payload)
                .map_err(|violation| StoreError::SchemaInvalid {
                    event_type: current.event_type.clone(),
                    violation,
                })?;
        }

        let new_status = patch.status.unwrap_or(current.status);
        validate_transition(current.status, new_status)?;

        let new_payload = patch.payload.unwrap_or_else(|| current.payload.clone());
        let new_labels = patch.labels.unwrap_or_else(|| current.labels.clone());
        let new_retries = patch.retries.unwrap_or(current.retries);
        let new_last_error = if patch.clear_last_error {
            None
        } else {
            patch.last_error.or_else(|| current.last_error.clone())
        };
        let new_correlation_id = patch
            .correlation_id
            .or_else(|| current.correlation_id.clone());

        // Strictly increasing token even when two writes land in the same
        // microsecond.
        let updated_micros = to_micros(Utc::now()).max(current_micros + 1);

        let updated = sqlx::query(
            r#"
            UPDATE events
               SET status = ?,
                   payload = ?,
                   labels = ?,
                   retries = ?,
                   last_error = ?,
                   correlation_id = ?,
                   updated_at = ?
             WHERE event_id = ? AND updated_at = ?
            "#,
        )
        .bind(new_status.as_str())
        .bind(serialize_payload(&new_payload))
        .bind(serialize_labels(&new_labels))
        .bind(new_retries as i64)
        .bind(&new_last_error)
        .bind(&new_correlation_id)
        .bind(updated_micros)
        .bind(event_id)
        .bind(current_micros)
        .execute(&mut *conn)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::Concurrency(event_id.to_string()));
        }

        Ok(Event {
            status: new_status,
            payload: new_payload,
            labels: new_labels,
            retries: new_retries,
            last_error: new_last_error,
            correlation_id: new_correlation_id,
            updated_at: from_micros(event_id, updated_micros)?,
            ..current
        })
    }

    // -----------------------------------------------------------------------
    // Listings
    // -----------------------------------------------------------------------

    /// Events in `status`, oldest `updated_at` first, up to `limit`.
    ///
    /// `limit <= 0` returns empty without touching the pool.
    pub async fn list_by_status(
        &self,
        status: EventStatus,
        limit: i64,
    ) -> Result<Vec<Event>, StoreError> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT * FROM events
             WHERE status = ?
             ORDER BY updated_at ASC
             LIMIT ?
            "#,
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    /// `PENDING` events, oldest first.
    pub async fn list_pending(&self, limit: i64) -> Result<Vec<Event>, StoreError> {
        self.list_by_status(EventStatus::Pending, limit).await
    }

    /// Paginated listing for diagnostics, newest created first, optionally
    /// filtered by correlation id.
    pub async fn list_events(
        &self,
        limit: i64,
        offset: i64,
        correlation_id: Option<&str>,
    ) -> Result<Vec<Event>, StoreError> {
        let limit = limit.max(0);
        let offset = offset.max(0);
        let rows = match correlation_id {
            Some(correlation_id) => {
                sqlx::query(
                    r#"
                    SELECT * FROM events
                     WHERE correlation_id = ?
                     ORDER BY created_at DESC
                     LIMIT ? OFFSET ?
                    "#,
                )
                .bind(correlation_id)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT * FROM events
                     ORDER BY created_at DESC
                     LIMIT ? OFFSET ?
                    "#,
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(row_to_event).collect()
    }

    // -----------------------------------------------------------------------
    // Labels
    // -----------------------------------------------------------------------

    /// Append `label` to the event's label set if it is not already present.
    ///
    /// Idempotent; uses the same optimistic-concurrency discipline as
    /// [`update`][Self::update]. A no-op append does not advance
    /// `updated_at`.
    pub async fn upsert_label(&self, event_id: &str, label: &str) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        let result = self.upsert_label_in_tx(&mut *conn, event_id, label).await;
        match result {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(())
            }
            Err(err) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(err)
            }
        }
    }

    async fn upsert_label_in_tx(
        &self,
        conn: &mut sqlx::SqliteConnection,
        event_id: &str,
        label: &str,
    ) -> Result<(), StoreError> {
        let row = sqlx::query("SELECT labels, updated_at FROM events WHERE event_id = ?")
            .bind(event_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| StoreError::NotFound(event_id.to_string()))?;
        let mut labels = deserialize_labels(event_id, row.try_get("labels")?)?;
        if labels.iter().any(|existing| existing == label) {
            return Ok(());
        }
        labels.push(label.to_string());

        let current_micros: i64 = row.try_get("updated_at")?;
        let updated_micros = to_micros(Utc::now()).max(current_micros + 1);
        let updated = sqlx::query(
            r#"
            UPDATE events
               SET labels = ?,
                   updated_at = ?
             WHERE event_id = ? AND updated_at = ?
            "#,
        )
        .bind(serialize_labels(&labels))
        .bind(updated_micros)
        .bind(event_id)
        .bind(current_micros)
        .execute(&mut *conn)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::Concurrency(event_id.to_string()));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    /// Persisted status for `event_id`, failing `NotFound` when absent.
    pub async fn get_status(&self, event_id: &str) -> Result<EventStatus, StoreError> {
        self.get(event_id)
            .await?
            .map(|event| event.status)
            .ok_or_else(|| StoreError::NotFound(event_id.to_string()))
    }

    /// Labels currently attached to `event_id`.
    pub async fn get_labels(&self, event_id: &str) -> Result<Vec<String>, StoreError> {
        self.get(event_id)
            .await?
            .map(|event| event.labels)
            .ok_or_else(|| StoreError::NotFound(event_id.to_string()))
    }

    // -----------------------------------------------------------------------
    // Operator recovery
    // -----------------------------------------------------------------------

    /// Reset `IN_PROGRESS` rows whose claim is older than `older_than` back
    /// to `PENDING`, returning the ids that were requeued.
    ///
    /// This is an operator escape hatch for claims orphaned by a crashed
    /// worker. It deliberately sidesteps the forward transition matrix
    /// (`IN_PROGRESS → PENDING` is not a handler-reachable transition) and
    /// must never be wired into the hot loop.
    pub async fn requeue_stuck(&self, older_than: Duration) -> Result<Vec<String>, StoreError> {
        let cutoff = to_micros(Utc::now()) - older_than.as_micros() as i64;
        let now = to_micros(Utc::now());
        let rows = sqlx::query(
            r#"
            UPDATE events
               SET status = 'PENDING',
                   updated_at = MAX(?, updated_at + 1)
             WHERE status = 'IN_PROGRESS' AND updated_at < ?
            RETURNING event_id
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        let ids: Vec<String> = rows
            .iter()
            .map(|row| row.try_get::<String, _>("event_id"))
            .collect::<Result<_, _>>()?;
        if !ids.is_empty() {
            debug!(count = ids.len(), "requeued stuck events");
        }
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(event_id: &str, micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| StoreError::Corrupt {
        event_id: event_id.to_string(),
        reason: format!("timestamp out of range: {micros}"),
    })
}

fn serialize_payload(payload: &Map<String, Value>) -> String {
    serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string())
}

fn serialize_labels(labels: &[String]) -> String {
    serde_json::to_string(labels).unwrap_or_else(|_| "[]".to_string())
}

fn deserialize_payload(event_id: &str, raw: String) -> Result<Map<String, Value>, StoreError> {
    if raw.is_empty() {
        return Ok(Map::new());
    }
    let value: Value = serde_json::from_str(&raw).map_err(|err| StoreError::Corrupt {
        event_id: event_id.to_string(),
        reason: format!("payload is not valid JSON: {err}"),
    })?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}

fn deserialize_labels(event_id: &str, raw: String) -> Result<Vec<String>, StoreError> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(&raw).map_err(|err| StoreError::Corrupt {
        event_id: event_id.to_string(),
        reason: format!("labels are not valid JSON: {err}"),
    })?;
    match value {
        Value::Array(items) => Ok(items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect()),
        _ => Ok(Vec::new()),
    }
}

fn row_to_event(row: &SqliteRow) -> Result<Event, StoreError> {
    let event_id: String = row.try_get("event_id")?;
    let status_raw: String = row.try_get("status")?;
    let status = EventStatus::parse(&status_raw).map_err(|err| StoreError::Corrupt {
        event_id: event_id.clone(),
        reason: err.to_string(),
    })?;
    let retries: i64 = row.try_get("retries")?;
    Ok(Event {
        event_type: row.try_get("type")?,
        created_at: from_micros(&event_id, row.try_get("created_at")?)?,
        updated_at: from_micros(&event_id, row.try_get("updated_at")?)?,
        status,
        payload: deserialize_payload(&event_id, row.try_get("payload")?)?,
        labels: deserialize_labels(&event_id, row.try_get("labels")?)?,
        correlation_id: row.try_get("correlation_id")?,
        retries: retries.max(0) as u32,
        last_error: row.try_get("last_error")?,
        event_id,
    })
}
