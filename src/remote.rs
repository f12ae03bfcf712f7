use reqwest::Response;
use thiserror::Error;

use crate::error::ErrorCategory;

const REDACTED_BODY_MAX_LEN: usize = 300;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} request failed with status {status}: {body}")]
    Http {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("{provider} request error: {source}")]
    Transport {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{provider} returned an unexpected payload: {message}")]
    Decode {
        provider: &'static str,
        message: String,
    },
}

impl ProviderError {
    pub fn transport(provider: &'static str) -> impl FnOnce(reqwest::Error) -> Self {
        move |source| ProviderError::Transport { provider, source }
    }

    pub fn decode(provider: &'static str, message: impl Into<String>) -> Self {
        ProviderError::Decode {
            provider,
            message: message.into(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Http { status, .. } => Some(*status),
            ProviderError::Transport { source, .. } => source.status().map(|s| s.as_u16()),
            ProviderError::Decode { .. } => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ProviderError::Transport { source, .. }
                if source.is_timeout() || source.is_connect() =>
            {
                ErrorCategory::Network
            }
            ProviderError::Decode { .. } => ErrorCategory::Validation,
            _ => ErrorCategory::categorize(self.status(), &self.to_string()),
        }
    }
}

pub async fn check_status(
    provider: &'static str,
    response: Response,
) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Http {
        provider,
        status: status.as_u16(),
        body: redact_body(&body),
    })
}

pub fn redact_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= REDACTED_BODY_MAX_LEN {
        return trimmed.to_string();
    }
    let mut shortened: String = trimmed.chars().take(REDACTED_BODY_MAX_LEN).collect();
    shortened.push_str("...");
    shortened
}
