use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use diesel::{
    pg::PgConnection,
    r2d2::{ConnectionManager, PooledConnection},
};

use crate::{
    config::AppConfig,
    connectors::{Connectors, HttpConnectors},
    crypto::TokenCipher,
    db::PgPool,
    error::{AppError, AppResult},
    tokens::{oauth::OAuthClient, store::PgCredentialSink, TokenManager},
    workers::{HttpValidationClient, ValidationClient},
};

type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

const HTTP_TIMEOUT_SECS: u64 = 60;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub cipher: TokenCipher,
    pub tokens: TokenManager,
    pub connectors: Arc<dyn Connectors>,
    pub validator: Arc<dyn ValidationClient>,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: AppConfig,
        cipher: TokenCipher,
        tokens: TokenManager,
        connectors: Arc<dyn Connectors>,
        validator: Arc<dyn ValidationClient>,
    ) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            cipher,
            tokens,
            connectors,
            validator,
        }
    }

    pub fn from_config(pool: PgPool, config: AppConfig) -> Result<Self> {
        let cipher = TokenCipher::from_hex(&config.token_encryption_key)
            .context("TOKEN_ENCRYPTION_KEY is invalid")?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .context("failed to build HTTP client")?;

        let tokens = TokenManager::new(Arc::new(OAuthClient::from_config(http.clone(), &config)));
        let connectors = Arc::new(HttpConnectors::new(http.clone()));
        let validator = Arc::new(HttpValidationClient::new(
            http,
            config.validation_service_url.clone(),
        ));

        Ok(Self::new(pool, config, cipher, tokens, connectors, validator))
    }

    pub fn db(&self) -> AppResult<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))
    }

    pub fn credential_sink(&self) -> PgCredentialSink {
        PgCredentialSink::new(self.pool.clone(), self.cipher.clone())
    }
}
