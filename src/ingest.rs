use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::activity::{
    record_activity, ActivityEntry, ACTION_DOCUMENT_UPLOADED, ACTION_DOCUMENT_UPLOAD_FAILED,
    ACTION_MESSAGE_FETCH_FAILED,
};
use crate::connectors::StorageTarget;
use crate::error::ErrorCategory;
use crate::jobs;
use crate::mail::{AttachmentMeta, InboundMessage, MailClient, MailProvider};
use crate::models::{Document, EmailAccount, Employee, NewDocument, RoutingRuleRow, StorageConfig};
use crate::remote::ProviderError;
use crate::requests::{advance_request, escape_like, load_open_requests, match_request};
use crate::routing::{
    compile_all, default_path, render_path, select_rule, EmployeeContext, PathContext,
    RoutingInput, RoutingRule,
};
use crate::schema::{documents, email_accounts, employees, routing_rules, storage_configs};
use crate::state::AppState;
use crate::storage::{StorageError, StorageProvider, StorageSession, VerificationStatus};
use crate::tokens::store::{CredentialSink, PgCredentialSink, TokenHandle};
use crate::tokens::TokenError;
use crate::workers::spawn_direct_validation;

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("database pool error: {0}")]
    Pool(String),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AccountResult {
    pub account_id: Uuid,
    pub email: String,
    pub processed: usize,
    pub errors: usize,
    pub documents_stored: usize,
    pub documents_failed: usize,
    pub duplicates_skipped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct IngestSummary {
    pub processed: usize,
    pub errors: usize,
    pub accounts_processed: usize,
    pub account_results: Vec<AccountResult>,
}

#[derive(Debug)]
enum MailCallError {
    Provider(ProviderError),
    Fatal(TokenError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttachmentOutcome {
    Stored,
    Failed,
    Duplicate,
}

#[derive(Default)]
struct RunCache {
    rules: HashMap<Uuid, Vec<RoutingRule>>,
    sessions: HashMap<Uuid, Result<StorageSession, StorageError>>,
}

pub async fn run_ingestion(state: &AppState) -> Result<IngestSummary, IngestError> {
    let accounts: Vec<EmailAccount> = {
        let mut conn = state
            .db()
            .map_err(|err| IngestError::Pool(err.to_string()))?;
        email_accounts::table
            .filter(email_accounts::is_active.eq(true))
            .order((email_accounts::created_at.asc(), email_accounts::id.asc()))
            .load(&mut conn)?
    };
    info!(accounts = accounts.len(), "ingestion run started");

    let sink = state.credential_sink();
    let mut cache = RunCache::default();
    let mut summary = IngestSummary::default();

    for account in &accounts {
        let result = ingest_account(state, &sink, &mut cache, account).await;
        summary.processed += result.processed;
        summary.errors += result.errors;
        summary.accounts_processed += 1;
        summary.account_results.push(result);
    }

    info!(
        accounts = summary.accounts_processed,
        processed = summary.processed,
        errors = summary.errors,
        "ingestion run finished"
    );
    Ok(summary)
}

struct Mailbox<'a> {
    client: Arc<dyn MailClient>,
    handle: TokenHandle,
    token: String,
    state: &'a AppState,
    sink: &'a dyn CredentialSink,
}

impl Mailbox<'_> {
    async fn list_message_ids(
        &mut self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, MailCallError> {
        let mut refreshed = false;
        loop {
            match self.client.list_message_ids(&self.token, since, limit).await {
                Ok(ids) => return Ok(ids),
                Err(err) => self.recover(err, &mut refreshed).await?,
            }
        }
    }

    async fn fetch_message(&mut self, id: &str) -> Result<InboundMessage, MailCallError> {
        let mut refreshed = false;
        loop {
            match self.client.fetch_message(&self.token, id).await {
                Ok(message) => return Ok(message),
                Err(err) => self.recover(err, &mut refreshed).await?,
            }
        }
    }

    async fn fetch_attachment(
        &mut self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Bytes, MailCallError> {
        let mut refreshed = false;
        loop {
            match self
                .client
                .fetch_attachment_bytes(&self.token, message_id, attachment_id)
                .await
            {
                Ok(bytes) => return Ok(bytes),
                Err(err) => self.recover(err, &mut refreshed).await?,
            }
        }
    }

    async fn recover(&mut self, err: ProviderError, refreshed: &mut bool) -> Result<(), MailCallError> {
        if !err.is_unauthorized() {
            return Err(MailCallError::Provider(err));
        }
        if *refreshed {
            let err = self.handle.quarantine_rejected(self.sink, &err.to_string());
            return Err(MailCallError::Fatal(err));
        }
        warn!(account_id = %self.handle.owner().id, "mailbox rejected token; refreshing");
        *refreshed = true;
        self.token = self
            .handle
            .refresh_after_rejection(&self.state.tokens, self.sink)
            .await
            .map_err(MailCallError::Fatal)?;
        Ok(())
    }
}

async fn ingest_account(
    state: &AppState,
    sink: &PgCredentialSink,
    cache: &mut RunCache,
    account: &EmailAccount,
) -> AccountResult {
    let mut result = AccountResult {
        account_id: account.id,
        email: account.email_address.clone(),
        ..AccountResult::default()
    };
    let started_at = Utc::now();

    let Some(provider) = MailProvider::parse(&account.provider) else {
        warn!(account_id = %account.id, provider = %account.provider, "unknown mail provider");
        return failed(result, format!("unknown mail provider {}", account.provider));
    };

    let mut handle = match TokenHandle::for_account(&state.cipher, account, provider, sink) {
        Ok(handle) => handle,
        Err(err) => return failed(result, err.to_string()),
    };
    let token = match handle.ensure_valid(&state.tokens, sink).await {
        Ok(token) => token,
        Err(err) => return failed(result, err.to_string()),
    };

    let mut mailbox = Mailbox {
        client: state.connectors.mail_client(provider),
        handle,
        token,
        state,
        sink,
    };

    let since = account
        .last_sync_at
        .map(|at| at.and_utc())
        .unwrap_or_else(|| started_at - Duration::hours(state.config.ingest_initial_lookback_hours));
    let limit = state.config.ingest_max_messages_per_account;

    let ids = match mailbox.list_message_ids(since, limit).await {
        Ok(ids) => ids,
        Err(MailCallError::Fatal(err)) => return failed(result, err.to_string()),
        Err(MailCallError::Provider(err)) => {
            error!(account_id = %account.id, error = %err, "failed to list messages");
            let result = failed(result, err.to_string());
            record_account_error(state, account.id, result.error.as_deref());
            return result;
        }
    };
    debug!(account_id = %account.id, messages = ids.len(), %since, "listed new messages");

    for id in ids.iter().take(limit) {
        let message = match mailbox.fetch_message(id).await {
            Ok(message) => message,
            Err(MailCallError::Fatal(err)) => return failed(result, err.to_string()),
            Err(MailCallError::Provider(err)) => {
                warn!(account_id = %account.id, message_id = %id, error = %err, "failed to fetch message");
                record_fetch_failure(state, account, id, &err);
                result.errors += 1;
                continue;
            }
        };

        match ingest_message(state, sink, cache, account, &mut mailbox, &message, &mut result).await {
            Ok(()) => result.processed += 1,
            Err(err) => return failed(result, err.to_string()),
        }
    }

    finish_account(state, account.id, started_at);
    info!(
        account_id = %account.id,
        processed = result.processed,
        stored = result.documents_stored,
        failed = result.documents_failed,
        "account ingested"
    );
    result
}

fn failed(mut result: AccountResult, message: String) -> AccountResult {
    result.errors += 1;
    result.error = Some(message);
    result
}

fn finish_account(state: &AppState, account_id: Uuid, started_at: DateTime<Utc>) {
    let updated = state.db().map_err(|err| err.to_string()).and_then(|mut conn| {
        diesel::update(email_accounts::table.find(account_id))
            .set((
                email_accounts::last_sync_at.eq(Some(started_at.naive_utc())),
                email_accounts::last_error.eq::<Option<String>>(None),
                email_accounts::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(&mut conn)
            .map_err(|err| err.to_string())
    });
    if let Err(err) = updated {
        error!(account_id = %account_id, error = %err, "failed to advance sync watermark");
    }
}

fn record_fetch_failure(state: &AppState, account: &EmailAccount, message_id: &str, err: &ProviderError) {
    let entry = ActivityEntry::new(account.organization_id, ACTION_MESSAGE_FETCH_FAILED, "email_account")
        .entity(account.id)
        .details(json!({
            "message_id": message_id,
            "category": err.category(),
            "error": err.to_string(),
        }));
    let recorded = state.db().map_err(|err| err.to_string()).and_then(|mut conn| {
        record_activity(&mut conn, entry).map_err(|err| err.to_string())
    });
    if let Err(store_err) = recorded {
        error!(account_id = %account.id, error = %store_err, "failed to record message fetch failure");
    }
}

fn record_account_error(state: &AppState, account_id: Uuid, message: Option<&str>) {
    let updated = state.db().map_err(|err| err.to_string()).and_then(|mut conn| {
        diesel::update(email_accounts::table.find(account_id))
            .set((
                email_accounts::last_error.eq(message),
                email_accounts::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(&mut conn)
            .map_err(|err| err.to_string())
    });
    if let Err(err) = updated {
        error!(account_id = %account_id, error = %err, "failed to record account error");
    }
}

struct MessageContext {
    request_id: Option<Uuid>,
    employee: Option<EmployeeContext>,
    extensions: Vec<String>,
}

/// Stores every attachment of one message. Only a token failure is returned,
/// after the message's remaining attachments are recorded as failed.
async fn ingest_message(
    state: &AppState,
    sink: &PgCredentialSink,
    cache: &mut RunCache,
    account: &EmailAccount,
    mailbox: &mut Mailbox<'_>,
    message: &InboundMessage,
    result: &mut AccountResult,
) -> Result<(), TokenError> {
    let context = match load_context(state, cache, account, message) {
        Ok(context) => context,
        Err(err) => {
            error!(message_id = %message.id, error = %err, "failed to load routing context");
            result.errors += 1;
            return Ok(());
        }
    };
    let rules = cache.rules.get(&account.organization_id).map(Vec::as_slice).unwrap_or(&[]);
    let input = RoutingInput {
        employee: context.employee.as_ref(),
        open_request: context.request_id,
        ..RoutingInput::new(message, &context.extensions)
    };
    let rule = select_rule(rules, &input).cloned();
    if let Some(rule) = &rule {
        debug!(message_id = %message.id, rule = %rule.name, "routing rule selected");
    }

    let mut token_failure: Option<TokenError> = None;
    for attachment in &message.attachments {
        let outcome = match &token_failure {
            Some(err) => {
                record_token_failure(state, account, message, attachment, &context, rule.as_ref(), err)
            }
            None => match ingest_attachment(
                state,
                sink,
                cache,
                account,
                mailbox,
                message,
                attachment,
                &context,
                rule.as_ref(),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    let outcome = record_token_failure(
                        state,
                        account,
                        message,
                        attachment,
                        &context,
                        rule.as_ref(),
                        &err,
                    );
                    token_failure = Some(err);
                    outcome
                }
            },
        };
        match outcome {
            AttachmentOutcome::Stored => result.documents_stored += 1,
            AttachmentOutcome::Failed => {
                result.documents_failed += 1;
                result.errors += 1;
            }
            AttachmentOutcome::Duplicate => result.duplicates_skipped += 1,
        }
    }

    if let Some(request_id) = context.request_id {
        let progress = state.db().map_err(|err| err.to_string()).and_then(|mut conn| {
            advance_request(&mut conn, request_id, Utc::now().naive_utc())
                .map_err(|err| err.to_string())
        });
        match progress {
            Ok(Some(progress)) if progress.from != progress.to => {
                info!(request_id = %request_id, from = %progress.from, to = %progress.to, "document request progressed");
            }
            Ok(_) => {}
            Err(err) => {
                error!(request_id = %request_id, error = %err, "failed to progress document request");
                result.errors += 1;
            }
        }
    }
    match token_failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn record_token_failure(
    state: &AppState,
    account: &EmailAccount,
    message: &InboundMessage,
    attachment: &AttachmentMeta,
    context: &MessageContext,
    rule: Option<&RoutingRule>,
    err: &TokenError,
) -> AttachmentOutcome {
    let mut draft = DocumentDraft::new(account, message, attachment, &attachment_mime_type(attachment));
    draft.routing_rule_id = rule.map(|rule| rule.id);
    draft.fail(ErrorCategory::Token, &err.to_string());
    persist(state, draft, context.request_id)
}

fn attachment_mime_type(attachment: &AttachmentMeta) -> String {
    attachment
        .mime_type
        .clone()
        .filter(|mime| !mime.trim().is_empty())
        .unwrap_or_else(|| {
            mime_guess::from_path(&attachment.filename)
                .first_raw()
                .unwrap_or(DEFAULT_MIME_TYPE)
                .to_string()
        })
}

fn load_context(
    state: &AppState,
    cache: &mut RunCache,
    account: &EmailAccount,
    message: &InboundMessage,
) -> Result<MessageContext, IngestError> {
    let mut conn = state
        .db()
        .map_err(|err| IngestError::Pool(err.to_string()))?;
    let organization_id = account.organization_id;

    if !cache.rules.contains_key(&organization_id) {
        let rows: Vec<RoutingRuleRow> = routing_rules::table
            .filter(routing_rules::organization_id.eq(organization_id))
            .filter(routing_rules::is_active.eq(true))
            .load(&mut conn)?;
        let (rules, errors) = compile_all(&rows);
        for err in &errors {
            warn!(organization_id = %organization_id, error = %err, "skipping unusable routing rule");
        }
        cache.rules.insert(organization_id, rules);
    }

    let candidates = load_open_requests(&mut conn, organization_id, &message.sender_email)?;
    let request_id = match_request(
        &candidates,
        &message.sender_email,
        &message.subject,
        state.config.request_match_fallback_earliest,
    )
    .map(|request| request.id);

    let employee = find_employee(&mut conn, organization_id, &message.sender_email)?.map(|employee| {
        EmployeeContext {
            email: employee.email,
            name: employee.full_name,
        }
    });

    Ok(MessageContext {
        request_id,
        employee,
        extensions: message.attachment_extensions(),
    })
}

fn find_employee(
    conn: &mut PgConnection,
    organization_id: Uuid,
    sender_email: &str,
) -> QueryResult<Option<Employee>> {
    employees::table
        .filter(employees::organization_id.eq(organization_id))
        .filter(employees::email.ilike(escape_like(sender_email.trim())))
        .first(conn)
        .optional()
}

pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

struct PriorCopy {
    id: Uuid,
    verified: bool,
}

fn find_prior_copy(
    conn: &mut PgConnection,
    organization_id: Uuid,
    message_id: &str,
    filename: &str,
    hash: &str,
) -> QueryResult<Option<PriorCopy>> {
    let same_attachment: Option<Document> = documents::table
        .filter(documents::organization_id.eq(organization_id))
        .filter(documents::message_id.eq(message_id))
        .filter(documents::filename.eq(filename))
        .filter(documents::content_hash.eq(hash))
        .order(documents::created_at.asc())
        .first(conn)
        .optional()?;
    if let Some(doc) = same_attachment {
        return Ok(Some(PriorCopy {
            id: doc.id,
            verified: doc.upload_verification_status == VerificationStatus::Verified.as_str(),
        }));
    }

    let same_content: Option<Uuid> = documents::table
        .filter(documents::organization_id.eq(organization_id))
        .filter(documents::content_hash.eq(hash))
        .filter(documents::upload_verification_status.ne(VerificationStatus::Failed.as_str()))
        .order(documents::created_at.asc())
        .select(documents::id)
        .first(conn)
        .optional()?;
    Ok(same_content.map(|id| PriorCopy {
        id,
        verified: false,
    }))
}

#[allow(clippy::too_many_arguments)]
async fn ingest_attachment(
    state: &AppState,
    sink: &PgCredentialSink,
    cache: &mut RunCache,
    account: &EmailAccount,
    mailbox: &mut Mailbox<'_>,
    message: &InboundMessage,
    attachment: &AttachmentMeta,
    context: &MessageContext,
    rule: Option<&RoutingRule>,
) -> Result<AttachmentOutcome, TokenError> {
    let mime_type = attachment_mime_type(attachment);
    let mut draft = DocumentDraft::new(account, message, attachment, &mime_type);
    draft.routing_rule_id = rule.map(|rule| rule.id);

    let bytes = match mailbox.fetch_attachment(&message.id, &attachment.id).await {
        Ok(bytes) => bytes,
        Err(MailCallError::Fatal(err)) => return Err(err),
        Err(MailCallError::Provider(err)) => {
            draft.fail(err.category(), &err.to_string());
            return Ok(persist(state, draft, context.request_id));
        }
    };
    let hash = content_hash(&bytes);
    draft.size_bytes = i64::try_from(bytes.len()).unwrap_or(i64::MAX);
    draft.content_hash = Some(hash.clone());

    let prior = state.db().map_err(|err| err.to_string()).and_then(|mut conn| {
        find_prior_copy(
            &mut conn,
            account.organization_id,
            &message.id,
            &attachment.filename,
            &hash,
        )
        .map_err(|err| err.to_string())
    });
    match prior {
        Ok(Some(prior)) if prior.verified => {
            debug!(message_id = %message.id, filename = %attachment.filename, "attachment already stored");
            return Ok(AttachmentOutcome::Duplicate);
        }
        Ok(Some(prior)) => draft.metadata["duplicate_of"] = json!(prior.id),
        Ok(None) => {}
        Err(err) => warn!(message_id = %message.id, error = %err, "duplicate lookup failed"),
    }

    let config = match resolve_destination(state, account.organization_id, rule) {
        Ok(Some(config)) => config,
        Ok(None) => {
            draft.fail(ErrorCategory::Validation, "no active storage destination configured");
            return Ok(persist(state, draft, context.request_id));
        }
        Err(err) => {
            draft.fail(ErrorCategory::Unknown, &err.to_string());
            return Ok(persist(state, draft, context.request_id));
        }
    };
    draft.storage_config_id = Some(config.id);
    draft.storage_provider = Some(config.provider.clone());

    let received_at = message.received_at;
    let folder_path = match rule.and_then(|rule| rule.actions.destination_path.as_deref()) {
        Some(template) => render_path(
            template,
            &PathContext {
                sender_email: &message.sender_email,
                sender_name: message.sender_name.as_deref(),
                employee: context.employee.as_ref(),
                received_at,
            },
        ),
        None => default_path(received_at),
    };

    let mut opening_error = None;
    if !cache.sessions.contains_key(&config.id) {
        let session = match open_session(state, sink, &config).await {
            Ok(session) => Ok(session),
            Err(err) => {
                let unavailable = err.unavailable();
                opening_error = Some(err);
                Err(unavailable)
            }
        };
        cache.sessions.insert(config.id, session);
    }
    let stored = match (opening_error, cache.sessions.get_mut(&config.id)) {
        (Some(err), _) => Err(err),
        (None, Some(Ok(session))) => {
            session
                .store(
                    &state.tokens,
                    sink,
                    &folder_path,
                    &attachment.filename,
                    bytes,
                    &mime_type,
                )
                .await
        }
        (None, Some(Err(err))) => Err(err.unavailable()),
        (None, None) => Err(StorageError::Config("storage session missing".into())),
    };

    match stored {
        Ok(outcome) => {
            draft.storage_location = Some(outcome.object.location_id);
            draft.storage_path = Some(outcome.object.path);
            draft.storage_url = outcome.object.url;
            draft.verification = outcome.verification;
            if outcome.verification == VerificationStatus::Failed {
                draft.upload_error = Some(format!(
                    "[{}] uploaded object could not be found",
                    ErrorCategory::Path.as_str()
                ));
            }
        }
        Err(err) => {
            warn!(
                config_id = %config.id,
                filename = %attachment.filename,
                error = %err,
                "attachment upload failed"
            );
            draft.fail(err.category(), &err.to_string());
        }
    }

    Ok(persist(state, draft, context.request_id))
}

fn resolve_destination(
    state: &AppState,
    organization_id: Uuid,
    rule: Option<&RoutingRule>,
) -> Result<Option<StorageConfig>, IngestError> {
    let mut conn = state
        .db()
        .map_err(|err| IngestError::Pool(err.to_string()))?;

    if let Some(config_id) = rule.and_then(|rule| rule.actions.storage_config_id) {
        let config: Option<StorageConfig> = storage_configs::table
            .find(config_id)
            .filter(storage_configs::organization_id.eq(organization_id))
            .filter(storage_configs::is_active.eq(true))
            .first(&mut conn)
            .optional()?;
        if config.is_some() {
            return Ok(config);
        }
        warn!(%config_id, "routing rule points at a missing or inactive storage config");
    }

    let config = storage_configs::table
        .filter(storage_configs::organization_id.eq(organization_id))
        .filter(storage_configs::is_active.eq(true))
        .order((
            storage_configs::is_default.desc(),
            storage_configs::created_at.asc(),
        ))
        .first(&mut conn)
        .optional()?;
    Ok(config)
}

async fn open_session(
    state: &AppState,
    sink: &PgCredentialSink,
    config: &StorageConfig,
) -> Result<StorageSession, StorageError> {
    let provider = StorageProvider::parse(&config.provider)
        .ok_or_else(|| StorageError::Config(format!("unknown storage provider {}", config.provider)))?;

    let secrets = match config.credentials_encrypted.as_deref() {
        Some(envelope) => {
            let plain = state
                .cipher
                .decrypt(envelope)
                .map_err(|err| StorageError::Config(format!("storage credentials unreadable: {err}")))?;
            let value: Value = serde_json::from_str(&plain)
                .map_err(|err| StorageError::Config(format!("storage credentials are not JSON: {err}")))?;
            Some(value)
        }
        None => None,
    };

    let target = StorageTarget {
        config,
        provider,
        secrets,
    };
    let backend = state
        .connectors
        .storage_backend(&target)
        .await?;

    let token = match provider.oauth_provider() {
        Some(oauth) => Some(TokenHandle::for_storage(&state.cipher, config, oauth, sink)?),
        None => None,
    };

    Ok(StorageSession::new(config.id, backend, token))
}

struct DocumentDraft {
    organization_id: Uuid,
    email_account_id: Uuid,
    routing_rule_id: Option<Uuid>,
    storage_config_id: Option<Uuid>,
    message_id: String,
    sender_email: String,
    sender_name: Option<String>,
    subject: String,
    filename: String,
    storage_provider: Option<String>,
    storage_location: Option<String>,
    storage_path: Option<String>,
    storage_url: Option<String>,
    size_bytes: i64,
    mime_type: String,
    content_hash: Option<String>,
    metadata: Value,
    verification: VerificationStatus,
    upload_error: Option<String>,
}

impl DocumentDraft {
    fn new(
        account: &EmailAccount,
        message: &InboundMessage,
        attachment: &AttachmentMeta,
        mime_type: &str,
    ) -> Self {
        Self {
            organization_id: account.organization_id,
            email_account_id: account.id,
            routing_rule_id: None,
            storage_config_id: None,
            message_id: message.id.clone(),
            sender_email: message.sender_email.clone(),
            sender_name: message.sender_name.clone(),
            subject: message.subject.clone(),
            filename: attachment.filename.clone(),
            storage_provider: None,
            storage_location: None,
            storage_path: None,
            storage_url: None,
            size_bytes: attachment.size.unwrap_or(0),
            mime_type: mime_type.to_string(),
            content_hash: None,
            metadata: json!({
                "attachment_id": attachment.id,
                "received_at": message.received_at,
                "recipients": message.recipients,
            }),
            verification: VerificationStatus::Unverified,
            upload_error: None,
        }
    }

    fn fail(&mut self, category: ErrorCategory, message: &str) {
        self.verification = VerificationStatus::Failed;
        self.upload_error = Some(format!("[{}] {message}", category.as_str()));
    }

    fn stored(&self) -> bool {
        self.verification != VerificationStatus::Failed
    }

    fn into_new(self, id: Uuid, request_id: Option<Uuid>) -> NewDocument {
        let linked = self.stored().then_some(request_id).flatten();
        NewDocument {
            id,
            organization_id: self.organization_id,
            email_account_id: Some(self.email_account_id),
            document_request_id: linked,
            routing_rule_id: self.routing_rule_id,
            storage_config_id: self.storage_config_id,
            message_id: self.message_id,
            sender_email: self.sender_email,
            sender_name: self.sender_name,
            subject: self.subject,
            filename: self.filename,
            storage_provider: self.storage_provider,
            storage_location: self.storage_location,
            storage_path: self.storage_path,
            storage_url: self.storage_url,
            size_bytes: self.size_bytes,
            mime_type: self.mime_type,
            content_hash: self.content_hash,
            metadata: self.metadata,
            upload_verification_status: self.verification.as_str().to_string(),
            upload_error: self.upload_error,
        }
    }
}

fn persist(state: &AppState, draft: DocumentDraft, request_id: Option<Uuid>) -> AttachmentOutcome {
    let stored = draft.stored();
    let organization_id = draft.organization_id;
    let document_id = Uuid::new_v4();
    let new_document = draft.into_new(document_id, request_id);

    let written = state.db().map_err(|err| err.to_string()).and_then(|mut conn| {
        write_document(&mut conn, &new_document).map_err(|err| err.to_string())
    });
    if let Err(err) = written {
        error!(filename = %new_document.filename, error = %err, "failed to record document");
        return AttachmentOutcome::Failed;
    }
    if !stored {
        return AttachmentOutcome::Failed;
    }

    if state.config.validation_queue_enabled {
        let queued = state.db().map_err(|err| err.to_string()).and_then(|mut conn| {
            jobs::enqueue(&mut conn, organization_id, document_id, Utc::now().naive_utc())
                .map_err(|err| err.to_string())
        });
        if let Err(err) = queued {
            error!(document_id = %document_id, error = %err, "failed to queue validation");
        }
    } else {
        spawn_direct_validation(state.clone(), organization_id, document_id);
    }
    AttachmentOutcome::Stored
}

fn write_document(conn: &mut PgConnection, document: &NewDocument) -> QueryResult<()> {
    conn.transaction::<_, diesel::result::Error, _>(|conn| {
        diesel::insert_into(documents::table)
            .values(document)
            .execute(conn)?;

        let (action, details) = match &document.upload_error {
            Some(error) if document.upload_verification_status == VerificationStatus::Failed.as_str() => (
                ACTION_DOCUMENT_UPLOAD_FAILED,
                json!({
                    "filename": document.filename,
                    "message_id": document.message_id,
                    "error": error,
                }),
            ),
            _ => (
                ACTION_DOCUMENT_UPLOADED,
                json!({
                    "filename": document.filename,
                    "message_id": document.message_id,
                    "storage_provider": document.storage_provider,
                    "storage_path": document.storage_path,
                    "verification": document.upload_verification_status,
                    "document_request_id": document.document_request_id,
                }),
            ),
        };
        record_activity(
            conn,
            ActivityEntry::new(document.organization_id, action, "document")
                .entity(document.id)
                .details(details),
        )
    })
}
