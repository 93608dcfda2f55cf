// config.rs
use std::str::FromStr;

use anyhow::Context;

use crate::{mail::sendmail::SmtpSettings, service::penalty::PenaltySchedule};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub ledger_url: Option<String>,
    pub ledger_api_key: String,
    pub ledger_timeout_secs: u64,
    // Email is disabled when SMTP_HOST is unset
    pub smtp: Option<SmtpSettings>,
    pub alert_email: Option<String>,
    pub finalize_interval_secs: u64,
    pub finalize_batch_size: i64,
    pub log_level: String,
    pub penalties: PenaltySchedule,
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{} has an invalid value: {}", key, raw)),
        None => Ok(default),
    }
}

impl Config {
    pub fn init() -> anyhow::Result<Config> {
        let defaults = PenaltySchedule::default();
        let penalties = PenaltySchedule {
            client_early: parsed("PENALTY_CLIENT_EARLY", defaults.client_early)?,
            client_en_route: parsed("PENALTY_CLIENT_EN_ROUTE", defaults.client_en_route)?,
            client_on_site: parsed("PENALTY_CLIENT_ON_SITE", defaults.client_on_site)?,
            worker_en_route: parsed("PENALTY_WORKER_EN_ROUTE", defaults.worker_en_route)?,
            worker_on_site: parsed("PENALTY_WORKER_ON_SITE", defaults.worker_on_site)?,
        };

        let smtp = match optional("SMTP_HOST") {
            Some(host) => Some(SmtpSettings {
                host,
                port: parsed("SMTP_PORT", 587u16)?,
                username: optional("SMTP_USERNAME").unwrap_or_default(),
                password: optional("SMTP_PASSWORD").unwrap_or_default(),
                from_email: optional("FROM_EMAIL").unwrap_or_else(|| "noreply@fieldjobs.local".to_string()),
            }),
            None => None,
        };

        Ok(Config {
            database_url: optional("DATABASE_URL"),
            database_max_connections: parsed("DATABASE_MAX_CONNECTIONS", 10)?,
            ledger_url: optional("LEDGER_URL"),
            ledger_api_key: optional("LEDGER_API_KEY").unwrap_or_default(),
            ledger_timeout_secs: parsed("LEDGER_TIMEOUT_SECS", 10)?,
            smtp,
            alert_email: optional("ALERT_EMAIL"),
            finalize_interval_secs: parsed("FINALIZE_INTERVAL_SECS", 300)?,
            finalize_batch_size: parsed("FINALIZE_BATCH_SIZE", 50)?,
            log_level: optional("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            penalties,
        })
    }
}
