use std::collections::{HashMap, HashSet};
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request};
use axum::Router;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::MigrationHarness;
use http_body_util::BodyExt;
use intake::config::AppConfig;
use intake::connectors::{Connectors, StorageTarget};
use intake::crypto::TokenCipher;
use intake::db::{self, PgPool, MIGRATIONS};
use intake::mail::{AttachmentMeta, InboundMessage, MailClient, MailProvider};
use intake::models::{NewDocumentRequest, NewEmailAccount, NewEmployee, NewRoutingRule, NewStorageConfig};
use intake::remote::ProviderError;
use intake::routes;
use intake::state::AppState;
use intake::storage::{FolderRef, StorageBackend, StorageError, StorageProvider, StoredObject};
use intake::tokens::{OAuthProvider, TokenGrant, TokenManager, TokenRefresher};
use intake::workers::{ValidationClient, ValidationError, ValidationResult};
use once_cell::sync::Lazy;
use serde_json::Value;
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use uuid::Uuid;

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub const TEST_KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
pub const CRON_SECRET: &str = "cron-test-secret";
pub const GOOGLE_ACCESS: &str = "ya29.a0AfH6SMBcurrent";
pub const GOOGLE_REFRESHED: &str = "ya29.a0AfH6SMBrefreshed";
pub const GOOGLE_REFRESH: &str = "1//0gRefreshTokenValue";

fn unauthorized(provider: &'static str) -> ProviderError {
    ProviderError::Http {
        provider,
        status: 401,
        body: "invalid_token".into(),
    }
}

#[derive(Clone)]
pub struct FakeMessage {
    pub message: InboundMessage,
    pub attachments: HashMap<String, Bytes>,
}

impl FakeMessage {
    pub fn new(id: &str, sender: &str, subject: &str, received_at: DateTime<Utc>) -> Self {
        Self {
            message: InboundMessage {
                id: id.to_string(),
                sender_email: sender.to_string(),
                sender_name: None,
                recipients: vec!["inbox@firm.example".to_string()],
                subject: subject.to_string(),
                received_at,
                attachments: Vec::new(),
            },
            attachments: HashMap::new(),
        }
    }

    pub fn attach(mut self, filename: &str, mime_type: &str, bytes: &[u8]) -> Self {
        let id = format!("att-{}", self.message.attachments.len() + 1);
        self.message.attachments.push(AttachmentMeta {
            id: id.clone(),
            filename: filename.to_string(),
            mime_type: Some(mime_type.to_string()),
            size: Some(bytes.len() as i64),
        });
        self.attachments.insert(id, Bytes::copy_from_slice(bytes));
        self
    }
}

/// A mailbox that accepts any token not listed as rejected.
#[derive(Default)]
pub struct FakeMail {
    messages: Mutex<Vec<FakeMessage>>,
    rejected_tokens: Mutex<HashSet<String>>,
    broken_messages: Mutex<HashMap<String, u16>>,
    attachment_status: Mutex<Option<u16>>,
    pub list_calls: AtomicUsize,
}

impl FakeMail {
    pub async fn deliver(&self, message: FakeMessage) {
        self.messages.lock().await.push(message);
    }

    pub async fn reject_token(&self, token: &str) {
        self.rejected_tokens.lock().await.insert(token.to_string());
    }

    #[allow(dead_code)]
    pub async fn break_message(&self, id: &str, status: u16) {
        self.broken_messages.lock().await.insert(id.to_string(), status);
    }

    #[allow(dead_code)]
    pub async fn fail_attachments_with(&self, status: u16) {
        *self.attachment_status.lock().await = Some(status);
    }

    async fn check(&self, token: &str) -> Result<(), ProviderError> {
        if self.rejected_tokens.lock().await.contains(token) {
            return Err(unauthorized("gmail"));
        }
        Ok(())
    }
}

#[async_trait]
impl MailClient for FakeMail {
    fn provider(&self) -> MailProvider {
        MailProvider::Gmail
    }

    async fn list_message_ids(
        &self,
        token: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, ProviderError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check(token).await?;
        let guard = self.messages.lock().await;
        Ok(guard
            .iter()
            .filter(|fake| fake.message.received_at >= since)
            .take(limit)
            .map(|fake| fake.message.id.clone())
            .collect())
    }

    async fn fetch_message(&self, token: &str, id: &str) -> Result<InboundMessage, ProviderError> {
        self.check(token).await?;
        if let Some(status) = self.broken_messages.lock().await.get(id).copied() {
            return Err(ProviderError::Http {
                provider: "gmail",
                status,
                body: "backend error".into(),
            });
        }
        let guard = self.messages.lock().await;
        guard
            .iter()
            .find(|fake| fake.message.id == id)
            .map(|fake| fake.message.clone())
            .ok_or_else(|| ProviderError::Http {
                provider: "gmail",
                status: 404,
                body: "not found".into(),
            })
    }

    async fn fetch_attachment_bytes(
        &self,
        token: &str,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Bytes, ProviderError> {
        self.check(token).await?;
        if let Some(status) = *self.attachment_status.lock().await {
            return Err(ProviderError::Http {
                provider: "gmail",
                status,
                body: "attachment download refused".into(),
            });
        }
        let guard = self.messages.lock().await;
        guard
            .iter()
            .find(|fake| fake.message.id == message_id)
            .and_then(|fake| fake.attachments.get(attachment_id).cloned())
            .ok_or_else(|| ProviderError::Http {
                provider: "gmail",
                status: 404,
                body: "attachment not found".into(),
            })
    }
}

#[allow(dead_code)]
#[derive(Clone, Debug)]
pub struct Upload {
    pub folder: String,
    pub filename: String,
    pub bytes: Bytes,
    pub mime_type: String,
}

/// Token-less destination that keeps uploads in memory. Setting
/// `fail_status` makes every upload fail with that HTTP status.
#[derive(Default)]
pub struct FakeStorage {
    uploads: Mutex<Vec<Upload>>,
    fail_status: Mutex<Option<u16>>,
    pub probes: AtomicUsize,
}

impl FakeStorage {
    #[allow(dead_code)]
    pub async fn fail_uploads_with(&self, status: u16) {
        *self.fail_status.lock().await = Some(status);
    }

    #[allow(dead_code)]
    pub async fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().await.clone()
    }
}

#[async_trait]
impl StorageBackend for FakeStorage {
    fn provider(&self) -> StorageProvider {
        StorageProvider::S3
    }

    async fn probe(&self, _token: Option<&str>) -> Result<(), StorageError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ensure_folder(&self, _token: Option<&str>, path: &str) -> Result<FolderRef, StorageError> {
        Ok(FolderRef {
            id: path.to_string(),
            path: path.to_string(),
        })
    }

    async fn upload(
        &self,
        _token: Option<&str>,
        folder: &FolderRef,
        filename: &str,
        bytes: Bytes,
        mime_type: &str,
    ) -> Result<StoredObject, StorageError> {
        if let Some(status) = *self.fail_status.lock().await {
            return Err(StorageError::Sdk {
                provider: "s3",
                status: Some(status),
                message: format!("upload rejected with {status}"),
            });
        }
        let path = format!("{}/{}", folder.path, filename);
        self.uploads.lock().await.push(Upload {
            folder: folder.path.clone(),
            filename: filename.to_string(),
            bytes,
            mime_type: mime_type.to_string(),
        });
        Ok(StoredObject {
            location_id: path.clone(),
            path,
            url: None,
        })
    }

    async fn verify_exists(&self, _token: Option<&str>, location_id: &str) -> Result<bool, StorageError> {
        let guard = self.uploads.lock().await;
        Ok(guard
            .iter()
            .any(|upload| format!("{}/{}", upload.folder, upload.filename) == location_id))
    }
}

pub struct FakeConnectors {
    pub mail: Arc<FakeMail>,
    pub storage: Arc<FakeStorage>,
}

#[async_trait]
impl Connectors for FakeConnectors {
    fn mail_client(&self, _provider: MailProvider) -> Arc<dyn MailClient> {
        self.mail.clone()
    }

    async fn storage_backend(
        &self,
        target: &StorageTarget<'_>,
    ) -> Result<Arc<dyn StorageBackend>, StorageError> {
        if !target.provider.has_adapter() {
            return Err(StorageError::Unsupported(target.provider));
        }
        Ok(self.storage.clone())
    }
}

/// Grants [`GOOGLE_REFRESHED`] unless told to fail.
#[derive(Default)]
pub struct FakeRefresher {
    failing: Mutex<bool>,
    pub calls: AtomicUsize,
}

impl FakeRefresher {
    #[allow(dead_code)]
    pub async fn fail_refreshes(&self) {
        *self.failing.lock().await = true;
    }
}

#[async_trait]
impl TokenRefresher for FakeRefresher {
    async fn refresh(
        &self,
        _provider: OAuthProvider,
        _refresh_token: &str,
    ) -> Result<TokenGrant, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.failing.lock().await {
            return Err(ProviderError::Http {
                provider: "google_oauth",
                status: 400,
                body: "invalid_grant".into(),
            });
        }
        Ok(TokenGrant {
            access_token: GOOGLE_REFRESHED.to_string(),
            refresh_token: None,
            expires_in: Some(3600),
        })
    }
}

/// Answers with a fixed status, or fails every call once `fail_with` is set.
pub struct FakeValidator {
    status: Mutex<String>,
    failure: Mutex<Option<u16>>,
    pub calls: AtomicUsize,
}

impl Default for FakeValidator {
    fn default() -> Self {
        Self {
            status: Mutex::new("pass".to_string()),
            failure: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }
}

impl FakeValidator {
    #[allow(dead_code)]
    pub async fn respond_with(&self, status: &str) {
        *self.status.lock().await = status.to_string();
    }

    #[allow(dead_code)]
    pub async fn fail_with(&self, status: u16) {
        *self.failure.lock().await = Some(status);
    }
}

#[async_trait]
impl ValidationClient for FakeValidator {
    async fn validate(&self, _document_id: Uuid) -> Result<ValidationResult, ValidationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = *self.failure.lock().await {
            return Err(ValidationError::Provider(ProviderError::Http {
                provider: "validation",
                status,
                body: "validation service unavailable".into(),
            }));
        }
        Ok(ValidationResult {
            overall_status: self.status.lock().await.clone(),
            expires_at: None,
            details: serde_json::Map::new(),
        })
    }
}

pub struct TestApp {
    pub state: AppState,
    pub mail: Arc<FakeMail>,
    pub storage: Arc<FakeStorage>,
    pub refresher: Arc<FakeRefresher>,
    pub validator: Arc<FakeValidator>,
    pub organization_id: Uuid,
    router: Router,
}

impl TestApp {
    pub async fn new() -> Result<Self> {
        let database_url = env::var("TEST_DATABASE_URL")
            .context("TEST_DATABASE_URL must be set for integration tests")?;

        let config = AppConfig {
            database_url: database_url.clone(),
            database_max_pool_size: db::DEFAULT_MAX_POOL_SIZE,
            run_migrations: false,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            cron_secret: Some(CRON_SECRET.to_string()),
            token_encryption_key: TEST_KEY_HEX.to_string(),
            google_client_id: None,
            google_client_secret: None,
            microsoft_client_id: None,
            microsoft_client_secret: None,
            microsoft_tenant: "common".to_string(),
            ingest_max_messages_per_account: 50,
            ingest_initial_lookback_hours: 24,
            token_refresh_window_minutes: 65,
            validation_service_url: None,
            validation_queue_enabled: true,
            validation_default_batch_size: 10,
            validation_max_batch_size: 50,
            request_match_fallback_earliest: true,
        };

        let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
        prepare_database(&pool).await?;

        let mail = Arc::new(FakeMail::default());
        let storage = Arc::new(FakeStorage::default());
        let refresher = Arc::new(FakeRefresher::default());
        let validator = Arc::new(FakeValidator::default());
        let connectors = Arc::new(FakeConnectors {
            mail: mail.clone(),
            storage: storage.clone(),
        });

        let cipher = TokenCipher::from_hex(TEST_KEY_HEX)?;
        let state = AppState::new(
            pool,
            config,
            cipher,
            TokenManager::new(refresher.clone()),
            connectors,
            validator.clone(),
        );
        let router = routes::create_router(state.clone());

        Ok(Self {
            state,
            mail,
            storage,
            refresher,
            validator,
            organization_id: Uuid::new_v4(),
            router,
        })
    }

    pub async fn cleanup(&self) -> Result<()> {
        self.with_conn(truncate_all).await
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        Ok(self.state.cipher.encrypt(plaintext)?)
    }

    /// A Gmail account whose access token is valid for another hour.
    pub async fn insert_account(&self, access_token: &str) -> Result<Uuid> {
        self.insert_account_with("inbox@firm.example", access_token, GOOGLE_REFRESH)
            .await
    }

    pub async fn insert_account_with(&self, email: &str, access_token: &str, refresh_token: &str) -> Result<Uuid> {
        let account = NewEmailAccount {
            id: Uuid::new_v4(),
            organization_id: self.organization_id,
            provider: "gmail".to_string(),
            email_address: email.to_string(),
            access_token_encrypted: Some(self.encrypt(access_token)?),
            refresh_token_encrypted: Some(self.encrypt(refresh_token)?),
            token_expires_at: Some((Utc::now() + Duration::hours(1)).naive_utc()),
            last_sync_at: None,
            is_active: true,
        };
        let id = account.id;
        self.with_conn(move |conn| {
            diesel::insert_into(intake::schema::email_accounts::table)
                .values(&account)
                .execute(conn)
                .context("failed to insert email account")?;
            Ok(())
        })
        .await?;
        Ok(id)
    }

    pub async fn insert_storage_config(&self, name: &str, is_default: bool) -> Result<Uuid> {
        self.insert_storage_config_with(name, "s3", is_default).await
    }

    pub async fn insert_storage_config_with(&self, name: &str, provider: &str, is_default: bool) -> Result<Uuid> {
        let config = NewStorageConfig {
            id: Uuid::new_v4(),
            organization_id: self.organization_id,
            name: name.to_string(),
            provider: provider.to_string(),
            config: serde_json::json!({ "bucket": "intake-test", "region": "us-east-1" }),
            credentials_encrypted: None,
            access_token_encrypted: None,
            refresh_token_encrypted: None,
            token_expires_at: None,
            is_default,
            is_active: true,
        };
        let id = config.id;
        self.with_conn(move |conn| {
            diesel::insert_into(intake::schema::storage_configs::table)
                .values(&config)
                .execute(conn)
                .context("failed to insert storage config")?;
            Ok(())
        })
        .await?;
        Ok(id)
    }

    #[allow(dead_code)]
    pub async fn insert_rule(&self, name: &str, priority: i32, conditions: Value, actions: Value) -> Result<Uuid> {
        let rule = NewRoutingRule {
            id: Uuid::new_v4(),
            organization_id: self.organization_id,
            name: name.to_string(),
            priority,
            is_active: true,
            conditions,
            actions,
        };
        let id = rule.id;
        self.with_conn(move |conn| {
            diesel::insert_into(intake::schema::routing_rules::table)
                .values(&rule)
                .execute(conn)
                .context("failed to insert routing rule")?;
            Ok(())
        })
        .await?;
        Ok(id)
    }

    #[allow(dead_code)]
    pub async fn insert_employee(&self, email: &str, full_name: &str) -> Result<Uuid> {
        let employee = NewEmployee {
            id: Uuid::new_v4(),
            organization_id: self.organization_id,
            email: email.to_string(),
            full_name: full_name.to_string(),
        };
        let id = employee.id;
        self.with_conn(move |conn| {
            diesel::insert_into(intake::schema::employees::table)
                .values(&employee)
                .execute(conn)
                .context("failed to insert employee")?;
            Ok(())
        })
        .await?;
        Ok(id)
    }

    #[allow(dead_code)]
    pub async fn insert_request(
        &self,
        recipient: &str,
        subject: &str,
        status: &str,
        expected: Option<i32>,
    ) -> Result<Uuid> {
        let request = NewDocumentRequest {
            id: Uuid::new_v4(),
            organization_id: self.organization_id,
            recipient_email: recipient.to_string(),
            recipient_name: None,
            subject: subject.to_string(),
            body: None,
            template_id: None,
            status: status.to_string(),
            document_count: 0,
            expected_document_count: expected,
            due_date: None,
            repeat_interval_type: None,
            repeat_interval_value: None,
            reminder_enabled: false,
            reminder_interval_days: None,
            parent_request_id: None,
        };
        let id = request.id;
        self.with_conn(move |conn| {
            diesel::insert_into(intake::schema::document_requests::table)
                .values(&request)
                .execute(conn)
                .context("failed to insert document request")?;
            Ok(())
        })
        .await?;
        Ok(id)
    }

    pub async fn post_cron(&self, path: &str, body: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::from(body.to_string()))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn get(&self, path: &str) -> Result<hyper::Response<Body>> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

pub async fn body_json(body: Body) -> Result<Value> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(serde_json::from_slice(&collected.to_bytes())?)
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE activity_logs, validation_dlq, validation_jobs, document_validations, documents, document_requests, employees, routing_rules, storage_configs, email_accounts CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}
