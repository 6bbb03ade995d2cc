//! relay-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, loads settings,
//! opens the store, wires the handler registry and notification publisher,
//! and runs the orchestrator until ctrl-c.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{info, warn};

use relay_config::Settings;
use relay_core::BackoffPolicy;
use relay_db::EventStore;
use relay_engine::{
    HandlerRegistry, Orchestrator, OrchestratorConfig, StorePublisher, EMAIL_SEND_REQUESTED,
};
use relay_mail::{
    ComposedEmail, EmailSendRequestedHandler, MailError, MailTransport, Mailer, SmtpMailer,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let settings = Settings::from_env();
    info!(db_path = %settings.db_path.display(), "relay-daemon starting");

    if let Some(parent) = settings.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create data directory {}", parent.display()))?;
        }
    }
    let store = EventStore::open(&settings.db_path)
        .await
        .context("open event store")?;
    store.migrate().await.context("run migrations")?;

    let transport: Arc<dyn MailTransport> = match &settings.smtp {
        Some(smtp) => Arc::new(
            SmtpMailer::new(
                &smtp.host,
                smtp.port,
                smtp.username.clone(),
                smtp.password.clone(),
                &smtp.mail_from,
            )
            .context("configure SMTP transport")?,
        ),
        None => {
            warn!("SMTP not configured; outbound mail is logged and dropped");
            Arc::new(LogOnlyTransport)
        }
    };
    let mailer = Mailer::new(transport, store.clone());

    let mut registry = HandlerRegistry::new();
    registry.register(
        EMAIL_SEND_REQUESTED,
        Arc::new(EmailSendRequestedHandler::new(mailer)),
    );

    let orchestrator = Orchestrator::new(
        store.clone(),
        registry,
        OrchestratorConfig {
            batch_size: settings.batch_size,
            max_attempts: settings.max_attempts,
            idle_sleep: settings.idle_sleep,
            backoff: BackoffPolicy::default(),
        },
    )
    .with_publisher(Arc::new(StorePublisher::new(store)));

    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            cancel.cancel();
        }
    });

    orchestrator.run_forever().await;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// Dev fallback transport: logs the outbound message and reports no
/// Message-ID, so no correlation is written.
struct LogOnlyTransport;

#[async_trait]
impl MailTransport for LogOnlyTransport {
    async fn deliver(&self, email: &ComposedEmail) -> Result<Option<String>, MailError> {
        info!(
            to = %email.to,
            subject = %email.subject,
            "outbound mail (log-only transport)"
        );
        Ok(None)
    }
}
