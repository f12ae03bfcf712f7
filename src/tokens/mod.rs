use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::remote::ProviderError;

pub mod oauth;
pub mod store;

pub use oauth::OAuthClient;

pub const MIN_TOKEN_LENGTH: usize = 10;
const DEFAULT_EXPIRY_SKEW_SECONDS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OAuthProvider {
    Google,
    Microsoft,
}

impl OAuthProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthProvider::Google => "google",
            OAuthProvider::Microsoft => "microsoft",
        }
    }

    /// Google issues opaque (`ya29.`-style) access tokens; Microsoft identity
    /// platform access tokens for Graph are JWTs.
    pub fn issues_opaque_access_tokens(&self) -> bool {
        matches!(self, OAuthProvider::Google)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Access,
    Refresh,
}

/// A token is usable if it is non-empty, at least [`MIN_TOKEN_LENGTH`] chars,
/// and either JWT-shaped or issued by a provider known to hand out opaque
/// tokens. Refresh tokens are opaque for every supported provider.
pub fn is_well_formed(token: &str, provider: OAuthProvider, kind: TokenKind) -> bool {
    let token = token.trim();
    if token.is_empty() || token.chars().count() < MIN_TOKEN_LENGTH {
        return false;
    }
    if token.chars().any(char::is_whitespace) {
        return false;
    }

    let opaque_allowed = match kind {
        TokenKind::Refresh => true,
        TokenKind::Access => provider.issues_opaque_access_tokens(),
    };
    opaque_allowed || is_jwt_shaped(token)
}

pub fn is_jwt_shaped(token: &str) -> bool {
    let segments: Vec<&str> = token.split('.').collect();
    segments.len() >= 2 && segments.iter().take(2).all(|segment| !segment.is_empty())
}

pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    #[derive(Deserialize)]
    struct ExpiryClaim {
        exp: i64,
    }

    if token.split('.').count() != 3 {
        return None;
    }

    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data = decode::<ExpiryClaim>(token, &DecodingKey::from_secret(&[]), &validation).ok()?;
    DateTime::from_timestamp(data.claims.exp, 0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
}

#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(
        &self,
        provider: OAuthProvider,
        refresh_token: &str,
    ) -> Result<TokenGrant, ProviderError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub provider: OAuthProvider,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshReason {
    Missing,
    Malformed,
    Expired,
    Rejected,
}

impl RefreshReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshReason::Missing => "missing access token",
            RefreshReason::Malformed => "malformed access token",
            RefreshReason::Expired => "access token expired",
            RefreshReason::Rejected => "access token rejected by provider",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenStatus {
    Current,
    Refreshed,
}

#[derive(Debug, Error)]
pub enum TokenError {
    /// Irrecoverable; the owning account or config must be deactivated and
    /// nothing further attempted in this run.
    #[error("credentials quarantined: {reason}")]
    Quarantined { reason: String },
}

impl TokenError {
    fn quarantined(reason: impl Into<String>) -> Self {
        TokenError::Quarantined {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            TokenError::Quarantined { reason } => reason,
        }
    }
}

impl Credentials {
    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>, skew: Duration) -> Option<RefreshReason> {
        let Some(token) = self.access_token.as_deref() else {
            return Some(RefreshReason::Missing);
        };
        if !is_well_formed(token, self.provider, TokenKind::Access) {
            return Some(RefreshReason::Malformed);
        }

        let expires_at = self.expires_at.or_else(|| jwt_expiry(token));
        match expires_at {
            Some(expires_at) if expires_at <= now + skew => Some(RefreshReason::Expired),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct TokenManager {
    refresher: Arc<dyn TokenRefresher>,
    skew: Duration,
}

impl TokenManager {
    pub fn new(refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            refresher,
            skew: Duration::seconds(DEFAULT_EXPIRY_SKEW_SECONDS),
        }
    }

    pub fn with_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    /// Returns [`TokenStatus::Current`] when the stored access token can be
    /// used, otherwise refreshes exactly once. Calling it again after a
    /// refresh observes the new token and does nothing.
    pub async fn ensure_valid(
        &self,
        creds: &mut Credentials,
        now: DateTime<Utc>,
    ) -> Result<TokenStatus, TokenError> {
        if let Some(refresh) = creds.refresh_token.as_deref() {
            if !is_well_formed(refresh, creds.provider, TokenKind::Refresh) {
                return Err(TokenError::quarantined("malformed refresh token"));
            }
        }

        match creds.needs_refresh(now, self.skew) {
            None => Ok(TokenStatus::Current),
            Some(reason) => {
                self.refresh(creds, reason, now).await?;
                Ok(TokenStatus::Refreshed)
            }
        }
    }

    /// Reactive path after a provider answered 401.
    pub async fn refresh_after_rejection(
        &self,
        creds: &mut Credentials,
        now: DateTime<Utc>,
    ) -> Result<(), TokenError> {
        self.refresh(creds, RefreshReason::Rejected, now).await
    }

    async fn refresh(
        &self,
        creds: &mut Credentials,
        reason: RefreshReason,
        now: DateTime<Utc>,
    ) -> Result<(), TokenError> {
        let refresh_token = match creds.refresh_token.as_deref() {
            Some(token) if is_well_formed(token, creds.provider, TokenKind::Refresh) => {
                token.to_string()
            }
            Some(_) => return Err(TokenError::quarantined("malformed refresh token")),
            None => {
                return Err(TokenError::quarantined(format!(
                    "{} and no refresh token stored",
                    reason.as_str()
                )))
            }
        };

        info!(
            provider = creds.provider.as_str(),
            reason = reason.as_str(),
            "refreshing access token"
        );

        let grant = self
            .refresher
            .refresh(creds.provider, &refresh_token)
            .await
            .map_err(|err| {
                warn!(provider = creds.provider.as_str(), error = %err, "token refresh failed");
                TokenError::quarantined(format!("token refresh failed: {err}"))
            })?;

        if !is_well_formed(&grant.access_token, creds.provider, TokenKind::Access) {
            return Err(TokenError::quarantined(
                "provider returned a malformed access token",
            ));
        }
        let next_refresh = grant.refresh_token.unwrap_or(refresh_token);
        if !is_well_formed(&next_refresh, creds.provider, TokenKind::Refresh) {
            return Err(TokenError::quarantined(
                "provider returned a malformed refresh token",
            ));
        }

        creds.expires_at = grant
            .expires_in
            .map(|seconds| now + Duration::seconds(seconds))
            .or_else(|| jwt_expiry(&grant.access_token));
        creds.access_token = Some(grant.access_token);
        creds.refresh_token = Some(next_refresh);
        Ok(())
    }
}
