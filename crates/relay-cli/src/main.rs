//! Operator tooling for the relay event store.
//!
//! Read-side diagnostics (`status`, `labels`, `list`) plus the two
//! operator-only mutations: canceling an event and requeueing claims
//! orphaned by a crashed worker. Recovery of stuck `IN_PROGRESS` rows is
//! deliberately a command here, not a watchdog in the worker loop.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use relay_config::Settings;
use relay_core::{EventPatch, EventStatus};
use relay_db::EventStore;

#[derive(Parser)]
#[command(name = "relay", about = "Operator tooling for the relay event store")]
struct Cli {
    /// Database path; falls back to RELAY_DB_PATH, then data/events.db.
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the lifecycle status of one event.
    Status { event_id: String },
    /// Print the labels attached to one event.
    Labels { event_id: String },
    /// List events, newest created first.
    List {
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
        /// Only events carrying this correlation id (Message-ID).
        #[arg(long)]
        correlation_id: Option<String>,
    },
    /// Cancel an event (legal from any state; terminal).
    Cancel { event_id: String },
    /// Requeue IN_PROGRESS events whose claim is older than the cutoff.
    Requeue {
        #[arg(long)]
        older_than_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let cli = Cli::parse();

    let db_path = cli.db.unwrap_or_else(|| Settings::from_env().db_path);
    let store = EventStore::open(&db_path)
        .await
        .with_context(|| format!("open event store at {}", db_path.display()))?;
    store.migrate().await.context("run migrations")?;

    match cli.command {
        Command::Status { event_id } => {
            let status = store.get_status(&event_id).await?;
            println!("{status}");
        }
        Command::Labels { event_id } => {
            for label in store.get_labels(&event_id).await? {
                println!("{label}");
            }
        }
        Command::List {
            limit,
            offset,
            correlation_id,
        } => {
            let events = store
                .list_events(limit, offset, correlation_id.as_deref())
                .await?;
            for event in events {
                println!(
                    "{}  {:12}  {}  retries={}  {}",
                    event.event_id,
                    event.status.as_str(),
                    event.event_type,
                    event.retries,
                    event.updated_at.format("%Y-%m-%dT%H:%M:%SZ"),
                );
            }
        }
        Command::Cancel { event_id } => {
            let canceled = store
                .update(&event_id, EventPatch::status(EventStatus::Canceled))
                .await?;
            println!("{} {}", canceled.event_id, canceled.status);
        }
        Command::Requeue { older_than_secs } => {
            let requeued = store
                .requeue_stuck(Duration::from_secs(older_than_secs))
                .await?;
            if requeued.is_empty() {
                println!("nothing to requeue");
            } else {
                for event_id in requeued {
                    println!("{event_id}");
                }
            }
        }
    }

    Ok(())
}
