use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{OAuthProvider, TokenGrant, TokenRefresher};
use crate::config::AppConfig;
use crate::remote::{check_status, ProviderError};

const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const MICROSOFT_SCOPES: &str =
    "offline_access https://graph.microsoft.com/Mail.Read https://graph.microsoft.com/Files.ReadWrite.All";

#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Clone)]
pub struct OAuthClient {
    http: Client,
    google: Option<ClientCredentials>,
    microsoft: Option<ClientCredentials>,
    google_token_url: String,
    microsoft_token_url: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl OAuthClient {
    pub fn from_config(http: Client, config: &AppConfig) -> Self {
        let pair = |id: &Option<String>, secret: &Option<String>| match (id, secret) {
            (Some(client_id), Some(client_secret)) => Some(ClientCredentials {
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
            }),
            _ => None,
        };

        Self {
            http,
            google: pair(&config.google_client_id, &config.google_client_secret),
            microsoft: pair(&config.microsoft_client_id, &config.microsoft_client_secret),
            google_token_url: GOOGLE_TOKEN_URL.to_string(),
            microsoft_token_url: format!(
                "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
                config.microsoft_tenant
            ),
        }
    }

    fn endpoint(
        &self,
        provider: OAuthProvider,
    ) -> (&'static str, &str, Option<&ClientCredentials>) {
        match provider {
            OAuthProvider::Google => (
                "google-oauth",
                self.google_token_url.as_str(),
                self.google.as_ref(),
            ),
            OAuthProvider::Microsoft => (
                "microsoft-oauth",
                self.microsoft_token_url.as_str(),
                self.microsoft.as_ref(),
            ),
        }
    }
}

#[async_trait]
impl TokenRefresher for OAuthClient {
    async fn refresh(
        &self,
        provider: OAuthProvider,
        refresh_token: &str,
    ) -> Result<TokenGrant, ProviderError> {
        let (label, url, credentials) = self.endpoint(provider);
        let credentials = credentials.ok_or_else(|| {
            ProviderError::decode(label, "client credentials are not configured")
        })?;

        let mut form = vec![
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        if provider == OAuthProvider::Microsoft {
            form.push(("scope", MICROSOFT_SCOPES));
        }

        let response = self
            .http
            .post(url)
            .form(&form)
            .send()
            .await
            .map_err(ProviderError::transport(label))?;
        let response = check_status(label, response).await?;
        let payload: TokenResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::decode(label, err.to_string()))?;

        Ok(TokenGrant {
            access_token: payload.access_token,
            refresh_token: payload.refresh_token.filter(|token| !token.is_empty()),
            expires_in: payload.expires_in,
        })
    }
}
