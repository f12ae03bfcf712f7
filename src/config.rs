use std::env;

use anyhow::{Context, Result};
use url::Url;

use crate::db::DEFAULT_MAX_POOL_SIZE;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_pool_size: u32,
    pub run_migrations: bool,
    pub server_host: String,
    pub server_port: u16,
    pub cron_secret: Option<String>,
    pub token_encryption_key: String,
    pub google_client_id: Option<String>,
    pub google_client_secret: Option<String>,
    pub microsoft_client_id: Option<String>,
    pub microsoft_client_secret: Option<String>,
    pub microsoft_tenant: String,
    pub ingest_max_messages_per_account: usize,
    pub ingest_initial_lookback_hours: i64,
    pub token_refresh_window_minutes: i64,
    pub validation_service_url: Option<String>,
    pub validation_queue_enabled: bool,
    pub validation_default_batch_size: i64,
    pub validation_max_batch_size: i64,
    pub request_match_fallback_earliest: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_max_pool_size = env::var("DATABASE_MAX_POOL_SIZE")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_MAX_POOL_SIZE);
        let run_migrations = env_flag("RUN_MIGRATIONS", false);
        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let server_port = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .context("SERVER_PORT must be a valid u16")?;
        let cron_secret = env::var("CRON_SECRET")
            .ok()
            .filter(|value| !value.trim().is_empty());
        let token_encryption_key =
            env::var("TOKEN_ENCRYPTION_KEY").context("TOKEN_ENCRYPTION_KEY must be set")?;
        let google_client_id = env::var("GOOGLE_CLIENT_ID").ok();
        let google_client_secret = env::var("GOOGLE_CLIENT_SECRET").ok();
        let microsoft_client_id = env::var("MICROSOFT_CLIENT_ID").ok();
        let microsoft_client_secret = env::var("MICROSOFT_CLIENT_SECRET").ok();
        let microsoft_tenant =
            env::var("MICROSOFT_TENANT").unwrap_or_else(|_| "common".to_string());
        let ingest_max_messages_per_account = env::var("INGEST_MAX_MESSAGES_PER_ACCOUNT")
            .unwrap_or_else(|_| "50".to_string())
            .parse()
            .context("INGEST_MAX_MESSAGES_PER_ACCOUNT must be an integer")?;
        let ingest_initial_lookback_hours = env::var("INGEST_INITIAL_LOOKBACK_HOURS")
            .unwrap_or_else(|_| "24".to_string())
            .parse()
            .context("INGEST_INITIAL_LOOKBACK_HOURS must be an integer")?;
        let token_refresh_window_minutes = env::var("TOKEN_REFRESH_WINDOW_MINUTES")
            .unwrap_or_else(|_| "65".to_string())
            .parse()
            .context("TOKEN_REFRESH_WINDOW_MINUTES must be an integer")?;
        let validation_service_url = env::var("VALIDATION_SERVICE_URL").ok();
        let validation_queue_enabled = env_flag("VALIDATION_QUEUE_ENABLED", true);
        let validation_default_batch_size = env::var("VALIDATION_DEFAULT_BATCH_SIZE")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .context("VALIDATION_DEFAULT_BATCH_SIZE must be an integer")?;
        let validation_max_batch_size = env::var("VALIDATION_MAX_BATCH_SIZE")
            .unwrap_or_else(|_| "50".to_string())
            .parse()
            .context("VALIDATION_MAX_BATCH_SIZE must be an integer")?;
        let request_match_fallback_earliest = env_flag("REQUEST_MATCH_FALLBACK_EARLIEST", true);

        Ok(Self {
            database_url,
            database_max_pool_size,
            run_migrations,
            server_host,
            server_port,
            cron_secret,
            token_encryption_key,
            google_client_id,
            google_client_secret,
            microsoft_client_id,
            microsoft_client_secret,
            microsoft_tenant,
            ingest_max_messages_per_account,
            ingest_initial_lookback_hours,
            token_refresh_window_minutes,
            validation_service_url,
            validation_queue_enabled,
            validation_default_batch_size,
            validation_max_batch_size,
            request_match_fallback_earliest,
        })
    }

    pub fn redacted_database_url(&self) -> String {
        redact_database_url(&self.database_url)
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn redact_database_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            let _ = parsed.set_password(Some("*****"));
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}
