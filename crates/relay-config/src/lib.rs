//! Centralised runtime configuration loaded from environment variables.
//!
//! Parsing is forgiving: malformed values fall back to their defaults with a
//! warning instead of refusing to boot. Production injects env vars
//! directly; the daemon loads `.env.local` first for dev convenience.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

pub const ENV_DB_PATH: &str = "RELAY_DB_PATH";
pub const ENV_BATCH_SIZE: &str = "RELAY_BATCH_SIZE";
pub const ENV_MAX_ATTEMPTS: &str = "RELAY_MAX_ATTEMPTS";
pub const ENV_IDLE_SLEEP_MS: &str = "RELAY_IDLE_SLEEP_MS";
pub const ENV_SMTP_HOST: &str = "RELAY_SMTP_HOST";
pub const ENV_SMTP_PORT: &str = "RELAY_SMTP_PORT";
pub const ENV_SMTP_USERNAME: &str = "RELAY_SMTP_USERNAME";
pub const ENV_SMTP_PASSWORD: &str = "RELAY_SMTP_PASSWORD";
pub const ENV_MAIL_FROM: &str = "RELAY_MAIL_FROM";
pub const ENV_ADMIN_EMAIL: &str = "RELAY_ADMIN_EMAIL";

/// Outbound SMTP relay credentials. Present only when a host is configured;
/// without it the daemon runs with a log-only transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub mail_from: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub db_path: PathBuf,
    pub batch_size: i64,
    pub max_attempts: u32,
    pub idle_sleep: Duration,
    pub smtp: Option<SmtpSettings>,
    /// Recipient for operator alerts, when configured.
    pub admin_email: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/events.db"),
            batch_size: 10,
            max_attempts: 3,
            idle_sleep: Duration::from_secs(1),
            smtp: None,
            admin_email: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let db_path = nonempty_env(ENV_DB_PATH)
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);
        let batch_size = int_env(ENV_BATCH_SIZE, defaults.batch_size).max(1);
        let max_attempts = int_env(ENV_MAX_ATTEMPTS, defaults.max_attempts as i64).max(1) as u32;
        let idle_sleep = Duration::from_millis(
            int_env(ENV_IDLE_SLEEP_MS, defaults.idle_sleep.as_millis() as i64).max(0) as u64,
        );

        let smtp = nonempty_env(ENV_SMTP_HOST).map(|host| SmtpSettings {
            host,
            port: int_env(ENV_SMTP_PORT, 587).clamp(1, u16::MAX as i64) as u16,
            username: nonempty_env(ENV_SMTP_USERNAME).unwrap_or_default(),
            password: std::env::var(ENV_SMTP_PASSWORD).unwrap_or_default(),
            mail_from: nonempty_env(ENV_MAIL_FROM)
                .unwrap_or_else(|| "relay@localhost".to_string()),
        });

        Self {
            db_path,
            batch_size,
            max_attempts,
            idle_sleep,
            smtp,
            admin_email: nonempty_env(ENV_ADMIN_EMAIL),
        }
    }
}

fn nonempty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn int_env(name: &str, default: i64) -> i64 {
    match std::env::var(name) {
        Err(_) => default,
        Ok(raw) => parse_int(name, &raw, default),
    }
}

/// Parse an integer env value with trimming and a safe, warned fallback.
fn parse_int(name: &str, raw: &str, default: i64) -> i64 {
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(var = name, value = raw, fallback = default, "invalid integer env var");
            default
        }
    }
}
