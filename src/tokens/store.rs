use chrono::{Duration, NaiveDateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{Credentials, OAuthProvider, TokenError, TokenManager, TokenStatus};
use crate::activity::{record_activity, ActivityEntry};
use crate::crypto::{CipherError, TokenCipher};
use crate::db::PgPool;
use crate::mail::MailProvider;
use crate::models::{EmailAccount, StorageConfig};
use crate::schema::{email_accounts, storage_configs};
use crate::state::AppState;
use crate::storage::StorageProvider;

#[derive(Debug, Error)]
pub enum TokenStoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("database pool error: {0}")]
    Pool(String),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error("stored tokens unreadable: {0}")]
    Unreadable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerKind {
    EmailAccount,
    StorageConfig,
}

impl OwnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerKind::EmailAccount => "email_account",
            OwnerKind::StorageConfig => "storage_config",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialOwner {
    pub kind: OwnerKind,
    pub id: Uuid,
    pub organization_id: Uuid,
}

#[derive(Debug)]
pub enum SaveOutcome {
    Saved {
        stored_access: Option<String>,
    },
    /// Another writer replaced the tokens first; these are its values.
    Superseded {
        stored_access: Option<String>,
        creds: Credentials,
    },
}

/// Where refreshed tokens and quarantine decisions are written.
pub trait CredentialSink: Send + Sync {
    /// Writes the new pair only if the stored access token is still
    /// `previous_access`.
    fn save(
        &self,
        owner: &CredentialOwner,
        previous_access: Option<&str>,
        creds: &Credentials,
    ) -> Result<SaveOutcome, TokenStoreError>;

    fn quarantine(&self, owner: &CredentialOwner, reason: &str) -> Result<(), TokenStoreError>;
}

pub struct PgCredentialSink {
    pool: PgPool,
    cipher: TokenCipher,
}

impl PgCredentialSink {
    pub fn new(pool: PgPool, cipher: TokenCipher) -> Self {
        Self { pool, cipher }
    }

    fn conn(
        &self,
    ) -> Result<
        diesel::r2d2::PooledConnection<diesel::r2d2::ConnectionManager<PgConnection>>,
        TokenStoreError,
    > {
        self.pool
            .get()
            .map_err(|err| TokenStoreError::Pool(err.to_string()))
    }
}

impl PgCredentialSink {
    fn reload(
        &self,
        conn: &mut PgConnection,
        owner: &CredentialOwner,
        provider: OAuthProvider,
    ) -> Result<SaveOutcome, TokenStoreError> {
        let (access, refresh, expires_at): (Option<String>, Option<String>, Option<NaiveDateTime>) =
            match owner.kind {
                OwnerKind::EmailAccount => email_accounts::table
                    .find(owner.id)
                    .select((
                        email_accounts::access_token_encrypted,
                        email_accounts::refresh_token_encrypted,
                        email_accounts::token_expires_at,
                    ))
                    .first(conn)?,
                OwnerKind::StorageConfig => storage_configs::table
                    .find(owner.id)
                    .select((
                        storage_configs::access_token_encrypted,
                        storage_configs::refresh_token_encrypted,
                        storage_configs::token_expires_at,
                    ))
                    .first(conn)?,
            };
        let creds = decrypt_credentials(
            &self.cipher,
            provider,
            access.as_deref(),
            refresh.as_deref(),
            expires_at,
        )
        .map_err(|err| TokenStoreError::Unreadable(err.reason().to_string()))?;
        Ok(SaveOutcome::Superseded {
            stored_access: access,
            creds,
        })
    }
}

impl CredentialSink for PgCredentialSink {
    fn save(
        &self,
        owner: &CredentialOwner,
        previous_access: Option<&str>,
        creds: &Credentials,
    ) -> Result<SaveOutcome, TokenStoreError> {
        let access = creds
            .access_token
            .as_deref()
            .map(|token| self.cipher.encrypt(token))
            .transpose()?;
        let refresh = creds
            .refresh_token
            .as_deref()
            .map(|token| self.cipher.encrypt(token))
            .transpose()?;
        let expires_at = creds.expires_at.map(|dt| dt.naive_utc());
        let now = Utc::now().naive_utc();
        let previous = previous_access.map(str::to_string);

        let mut conn = self.conn()?;
        let updated = match owner.kind {
            OwnerKind::EmailAccount => diesel::update(
                email_accounts::table
                    .find(owner.id)
                    .filter(email_accounts::access_token_encrypted.is_not_distinct_from(previous)),
            )
            .set((
                email_accounts::access_token_encrypted.eq(&access),
                email_accounts::refresh_token_encrypted.eq(&refresh),
                email_accounts::token_expires_at.eq(expires_at),
                email_accounts::last_error.eq::<Option<String>>(None),
                email_accounts::updated_at.eq(now),
            ))
            .execute(&mut conn)?,
            OwnerKind::StorageConfig => diesel::update(
                storage_configs::table
                    .find(owner.id)
                    .filter(storage_configs::access_token_encrypted.is_not_distinct_from(previous)),
            )
            .set((
                storage_configs::access_token_encrypted.eq(&access),
                storage_configs::refresh_token_encrypted.eq(&refresh),
                storage_configs::token_expires_at.eq(expires_at),
                storage_configs::last_error.eq::<Option<String>>(None),
                storage_configs::updated_at.eq(now),
            ))
            .execute(&mut conn)?,
        };

        if updated == 0 {
            warn!(
                owner = owner.kind.as_str(),
                owner_id = %owner.id,
                "stored token changed concurrently; adopting the other writer's value"
            );
            return self.reload(&mut conn, owner, creds.provider);
        }
        Ok(SaveOutcome::Saved {
            stored_access: access,
        })
    }

    fn quarantine(&self, owner: &CredentialOwner, reason: &str) -> Result<(), TokenStoreError> {
        let mut conn = self.conn()?;
        let now = Utc::now().naive_utc();
        match owner.kind {
            OwnerKind::EmailAccount => {
                diesel::update(email_accounts::table.find(owner.id))
                    .set((
                        email_accounts::is_active.eq(false),
                        email_accounts::last_error.eq(Some(reason)),
                        email_accounts::updated_at.eq(now),
                    ))
                    .execute(&mut conn)?;
            }
            OwnerKind::StorageConfig => {
                diesel::update(storage_configs::table.find(owner.id))
                    .set((
                        storage_configs::is_active.eq(false),
                        storage_configs::last_error.eq(Some(reason)),
                        storage_configs::updated_at.eq(now),
                    ))
                    .execute(&mut conn)?;
            }
        }

        record_activity(
            &mut conn,
            ActivityEntry::new(owner.organization_id, "credentials_quarantined", owner.kind.as_str())
                .entity(owner.id)
                .details(json!({ "reason": reason })),
        )?;
        Ok(())
    }
}

/// Live credentials for one owner during a run. Once quarantined, every later
/// call fails immediately so nothing is retried within the same run.
#[derive(Debug)]
pub struct TokenHandle {
    owner: CredentialOwner,
    creds: Credentials,
    stored_access: Option<String>,
    quarantined: Option<String>,
}

impl TokenHandle {
    pub fn new(owner: CredentialOwner, creds: Credentials, stored_access: Option<String>) -> Self {
        Self {
            owner,
            creds,
            stored_access,
            quarantined: None,
        }
    }

    pub fn for_account(
        cipher: &TokenCipher,
        account: &EmailAccount,
        provider: MailProvider,
        sink: &dyn CredentialSink,
    ) -> Result<Self, TokenError> {
        let owner = CredentialOwner {
            kind: OwnerKind::EmailAccount,
            id: account.id,
            organization_id: account.organization_id,
        };
        let creds = decrypt_credentials(
            cipher,
            provider.oauth_provider(),
            account.access_token_encrypted.as_deref(),
            account.refresh_token_encrypted.as_deref(),
            account.token_expires_at,
        );
        Self::opened(owner, creds, account.access_token_encrypted.clone(), sink)
    }

    pub fn for_storage(
        cipher: &TokenCipher,
        config: &StorageConfig,
        provider: OAuthProvider,
        sink: &dyn CredentialSink,
    ) -> Result<Self, TokenError> {
        let owner = CredentialOwner {
            kind: OwnerKind::StorageConfig,
            id: config.id,
            organization_id: config.organization_id,
        };
        let creds = decrypt_credentials(
            cipher,
            provider,
            config.access_token_encrypted.as_deref(),
            config.refresh_token_encrypted.as_deref(),
            config.token_expires_at,
        );
        Self::opened(owner, creds, config.access_token_encrypted.clone(), sink)
    }

    fn opened(
        owner: CredentialOwner,
        creds: Result<Credentials, TokenError>,
        stored_access: Option<String>,
        sink: &dyn CredentialSink,
    ) -> Result<Self, TokenError> {
        match creds {
            Ok(creds) => Ok(Self::new(owner, creds, stored_access)),
            Err(err) => {
                let placeholder = Credentials {
                    provider: OAuthProvider::Google,
                    access_token: None,
                    refresh_token: None,
                    expires_at: None,
                };
                Err(Self::new(owner, placeholder, None).quarantine(sink, err))
            }
        }
    }

    pub fn owner(&self) -> &CredentialOwner {
        &self.owner
    }

    pub fn credentials(&self) -> &Credentials {
        &self.creds
    }

    pub async fn ensure_valid(
        &mut self,
        manager: &TokenManager,
        sink: &dyn CredentialSink,
    ) -> Result<String, TokenError> {
        self.check_quarantine()?;
        match manager.ensure_valid(&mut self.creds, Utc::now()).await {
            Ok(TokenStatus::Current) => self.current_token(),
            Ok(TokenStatus::Refreshed) => {
                self.persist(sink);
                self.current_token()
            }
            Err(err) => Err(self.quarantine(sink, err)),
        }
    }

    pub async fn refresh_after_rejection(
        &mut self,
        manager: &TokenManager,
        sink: &dyn CredentialSink,
    ) -> Result<String, TokenError> {
        self.check_quarantine()?;
        match manager
            .refresh_after_rejection(&mut self.creds, Utc::now())
            .await
        {
            Ok(()) => {
                self.persist(sink);
                self.current_token()
            }
            Err(err) => Err(self.quarantine(sink, err)),
        }
    }

    pub fn quarantine_rejected(&mut self, sink: &dyn CredentialSink, detail: &str) -> TokenError {
        self.quarantine(
            sink,
            TokenError::Quarantined {
                reason: format!("token rejected after refresh: {detail}"),
            },
        )
    }

    fn check_quarantine(&self) -> Result<(), TokenError> {
        match &self.quarantined {
            Some(reason) => Err(TokenError::Quarantined {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn current_token(&self) -> Result<String, TokenError> {
        self.creds
            .access_token
            .clone()
            .ok_or_else(|| TokenError::Quarantined {
                reason: "no access token after validation".into(),
            })
    }

    fn persist(&mut self, sink: &dyn CredentialSink) {
        match sink.save(&self.owner, self.stored_access.as_deref(), &self.creds) {
            Ok(SaveOutcome::Saved { stored_access }) => {
                info!(
                    owner = self.owner.kind.as_str(),
                    owner_id = %self.owner.id,
                    "persisted refreshed tokens"
                );
                self.stored_access = stored_access;
            }
            Ok(SaveOutcome::Superseded { stored_access, creds }) => {
                self.stored_access = stored_access;
                self.creds = creds;
            }
            Err(err) => {
                // The in-memory token is still valid for this run.
                error!(
                    owner = self.owner.kind.as_str(),
                    owner_id = %self.owner.id,
                    error = %err,
                    "failed to persist refreshed tokens"
                );
            }
        }
    }

    fn quarantine(&mut self, sink: &dyn CredentialSink, err: TokenError) -> TokenError {
        let reason = err.reason().to_string();
        warn!(
            owner = self.owner.kind.as_str(),
            owner_id = %self.owner.id,
            %reason,
            "quarantining credentials"
        );
        if let Err(store_err) = sink.quarantine(&self.owner, &reason) {
            error!(owner_id = %self.owner.id, error = %store_err, "failed to record quarantine");
        }
        self.quarantined = Some(reason);
        err
    }
}

fn decrypt_credentials(
    cipher: &TokenCipher,
    provider: OAuthProvider,
    access: Option<&str>,
    refresh: Option<&str>,
    expires_at: Option<NaiveDateTime>,
) -> Result<Credentials, TokenError> {
    let open = |value: Option<&str>, label: &str| -> Result<Option<String>, TokenError> {
        value
            .map(|sealed| {
                cipher.decrypt(sealed).map_err(|err| TokenError::Quarantined {
                    reason: format!("stored {label} token could not be decrypted: {err}"),
                })
            })
            .transpose()
    };

    Ok(Credentials {
        provider,
        access_token: open(access, "access")?,
        refresh_token: open(refresh, "refresh")?,
        expires_at: expires_at.map(|naive| naive.and_utc()),
    })
}

#[derive(Debug, Default, Serialize)]
pub struct RefreshSummary {
    pub refreshed: usize,
    pub quarantined: usize,
    pub skipped: usize,
    pub errors: usize,
}

pub async fn refresh_expiring(state: &AppState) -> Result<RefreshSummary, TokenStoreError> {
    let window = Duration::minutes(state.config.token_refresh_window_minutes);
    let manager = state.tokens.clone().with_skew(window);
    let sink = state.credential_sink();
    let horizon = (Utc::now() + window).naive_utc();

    let (accounts, configs) = {
        let mut conn = state
            .db()
            .map_err(|err| TokenStoreError::Pool(err.to_string()))?;
        let accounts: Vec<EmailAccount> = email_accounts::table
            .filter(email_accounts::is_active.eq(true))
            .filter(
                email_accounts::token_expires_at
                    .is_null()
                    .or(email_accounts::token_expires_at.le(horizon)),
            )
            .order(email_accounts::created_at.asc())
            .load(&mut conn)?;
        let configs: Vec<StorageConfig> = storage_configs::table
            .filter(storage_configs::is_active.eq(true))
            .filter(storage_configs::refresh_token_encrypted.is_not_null())
            .filter(
                storage_configs::token_expires_at
                    .is_null()
                    .or(storage_configs::token_expires_at.le(horizon)),
            )
            .order(storage_configs::created_at.asc())
            .load(&mut conn)?;
        (accounts, configs)
    };

    let mut summary = RefreshSummary::default();

    for account in &accounts {
        let Some(provider) = MailProvider::parse(&account.provider) else {
            warn!(account_id = %account.id, provider = %account.provider, "unknown mail provider");
            summary.errors += 1;
            continue;
        };
        let handle = TokenHandle::for_account(&state.cipher, account, provider, &sink);
        tally(&mut summary, handle, &manager, &sink).await;
    }

    for config in &configs {
        let Some(oauth) = StorageProvider::parse(&config.provider).and_then(|p| p.oauth_provider())
        else {
            summary.skipped += 1;
            continue;
        };
        let handle = TokenHandle::for_storage(&state.cipher, config, oauth, &sink);
        tally(&mut summary, handle, &manager, &sink).await;
    }

    info!(
        refreshed = summary.refreshed,
        quarantined = summary.quarantined,
        skipped = summary.skipped,
        "token refresh run finished"
    );
    Ok(summary)
}

async fn tally(
    summary: &mut RefreshSummary,
    handle: Result<TokenHandle, TokenError>,
    manager: &TokenManager,
    sink: &dyn CredentialSink,
) {
    let mut handle = match handle {
        Ok(handle) => handle,
        Err(_) => {
            summary.quarantined += 1;
            return;
        }
    };
    let before = handle.credentials().access_token.clone();
    match handle.ensure_valid(manager, sink).await {
        Ok(token) if Some(&token) != before.as_ref() => summary.refreshed += 1,
        Ok(_) => summary.skipped += 1,
        Err(_) => summary.quarantined += 1,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::remote::ProviderError;
    use crate::tokens::tests::{ScriptedRefresher, GOOD_REFRESH};

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub saved: Mutex<Vec<Credentials>>,
        pub quarantined: Mutex<Vec<String>>,
        pub concurrent_winner: Mutex<Option<Credentials>>,
    }

    impl CredentialSink for RecordingSink {
        fn save(
            &self,
            _owner: &CredentialOwner,
            _previous_access: Option<&str>,
            creds: &Credentials,
        ) -> Result<SaveOutcome, TokenStoreError> {
            if let Some(winner) = self.concurrent_winner.lock().unwrap().clone() {
                return Ok(SaveOutcome::Superseded {
                    stored_access: Some(format!("sealed:{}", winner.access_token.clone().unwrap_or_default())),
                    creds: winner,
                });
            }
            self.saved.lock().unwrap().push(creds.clone());
            Ok(SaveOutcome::Saved {
                stored_access: Some(format!("sealed:{}", creds.access_token.clone().unwrap_or_default())),
            })
        }

        fn quarantine(&self, _owner: &CredentialOwner, reason: &str) -> Result<(), TokenStoreError> {
            self.quarantined.lock().unwrap().push(reason.to_string());
            Ok(())
        }
    }

    pub(crate) fn handle(provider: OAuthProvider, access: &str, refresh: &str) -> TokenHandle {
        TokenHandle::new(
            CredentialOwner {
                kind: OwnerKind::EmailAccount,
                id: Uuid::new_v4(),
                organization_id: Uuid::new_v4(),
            },
            Credentials {
                provider,
                access_token: Some(access.to_string()),
                refresh_token: Some(refresh.to_string()),
                expires_at: Some(Utc::now() + Duration::hours(1)),
            },
            Some("sealed:original".into()),
        )
    }

    #[tokio::test]
    async fn refreshed_tokens_are_saved() {
        let manager = TokenManager::new(Arc::new(ScriptedRefresher::granting("ya29.newAccessToken")));
        let sink = RecordingSink::default();
        let mut handle = handle(OAuthProvider::Google, "ya29.oldAccessToken", GOOD_REFRESH);

        let token = handle.refresh_after_rejection(&manager, &sink).await.unwrap();
        assert_eq!(token, "ya29.newAccessToken");
        assert_eq!(sink.saved.lock().unwrap().len(), 1);
        assert!(sink.quarantined.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn losing_a_concurrent_write_adopts_the_stored_tokens() {
        let manager = TokenManager::new(Arc::new(ScriptedRefresher::granting("ya29.ourAccessToken")));
        let sink = RecordingSink::default();
        *sink.concurrent_winner.lock().unwrap() = Some(Credentials {
            provider: OAuthProvider::Google,
            access_token: Some("ya29.theirAccessToken".into()),
            refresh_token: Some(GOOD_REFRESH.into()),
            expires_at: Some(Utc::now() + Duration::hours(1)),
        });
        let mut handle = handle(OAuthProvider::Google, "ya29.oldAccessToken", GOOD_REFRESH);

        let token = handle.refresh_after_rejection(&manager, &sink).await.unwrap();
        assert_eq!(token, "ya29.theirAccessToken");
        assert!(sink.saved.lock().unwrap().is_empty());

        let again = handle.ensure_valid(&manager, &sink).await.unwrap();
        assert_eq!(again, "ya29.theirAccessToken");
    }

    #[tokio::test]
    async fn quarantine_is_sticky_for_the_rest_of_the_run() {
        let refresher = Arc::new(ScriptedRefresher::new(vec![Err(ProviderError::Http {
            provider: "google-oauth",
            status: 400,
            body: "invalid_grant".into(),
        })]));
        let manager = TokenManager::new(refresher.clone());
        let sink = RecordingSink::default();
        let mut handle = handle(OAuthProvider::Google, "ya29.oldAccessToken", GOOD_REFRESH);

        assert!(handle.refresh_after_rejection(&manager, &sink).await.is_err());
        assert!(handle.ensure_valid(&manager, &sink).await.is_err());
        assert_eq!(sink.quarantined.lock().unwrap().len(), 1);
        assert_eq!(
            refresher.calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[test]
    fn undecryptable_tokens_are_quarantine_errors() {
        let cipher = TokenCipher::from_hex(&"11".repeat(32)).unwrap();
        let err = decrypt_credentials(
            &cipher,
            OAuthProvider::Google,
            Some("plaintext-token"),
            None,
            None,
        )
        .unwrap_err();
        assert!(err.reason().contains("could not be decrypted"));
    }
}
