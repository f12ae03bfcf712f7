use std::fmt::{self, Display};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized")
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "resource not found")
    }

    pub fn internal<E: Display>(error: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.status)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
        });
        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl From<diesel::result::Error> for AppError {
    fn from(value: diesel::result::Error) -> Self {
        match value {
            diesel::result::Error::NotFound => AppError::not_found(),
            _ => AppError::internal(value),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        AppError::internal(value)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        AppError::bad_request(format!("invalid JSON body: {value}"))
    }
}

/// Coarse failure classes used for retry policy and for the `upload_error`
/// strings surfaced on failed documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Token,
    Permission,
    Path,
    RateLimit,
    Network,
    Validation,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Token => "token",
            ErrorCategory::Permission => "permission",
            ErrorCategory::Path => "path",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Network => "network",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Unknown => "unknown",
        }
    }

    pub fn categorize(status: Option<u16>, message: &str) -> Self {
        match status {
            Some(401) => return ErrorCategory::Token,
            Some(403) => return ErrorCategory::Permission,
            Some(404) => return ErrorCategory::Path,
            Some(429) => return ErrorCategory::RateLimit,
            Some(400) | Some(409) | Some(413) | Some(422) => return ErrorCategory::Validation,
            Some(408) | Some(502) | Some(503) | Some(504) => return ErrorCategory::Network,
            _ => {}
        }

        let lower = message.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));

        if has(&["401", "unauthorized", "expired", "authentication", "invalid_grant"]) {
            ErrorCategory::Token
        } else if has(&["403", "forbidden", "permission", "access denied"]) {
            ErrorCategory::Permission
        } else if has(&["404", "not found", "no such"]) {
            ErrorCategory::Path
        } else if has(&["429", "rate limit", "too many requests", "throttl"]) {
            ErrorCategory::RateLimit
        } else if has(&["timeout", "timed out", "connection", "network", "dns"]) {
            ErrorCategory::Network
        } else if has(&["invalid", "validation", "unsupported", "too large"]) {
            ErrorCategory::Validation
        } else {
            ErrorCategory::Unknown
        }
    }
}

impl Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorCategory;

    #[test]
    fn status_codes_map_to_categories() {
        assert_eq!(ErrorCategory::categorize(Some(401), ""), ErrorCategory::Token);
        assert_eq!(ErrorCategory::categorize(Some(403), ""), ErrorCategory::Permission);
        assert_eq!(ErrorCategory::categorize(Some(404), ""), ErrorCategory::Path);
        assert_eq!(ErrorCategory::categorize(Some(429), ""), ErrorCategory::RateLimit);
        assert_eq!(ErrorCategory::categorize(Some(503), ""), ErrorCategory::Network);
    }

    #[test]
    fn status_beats_message_text() {
        assert_eq!(
            ErrorCategory::categorize(Some(403), "token expired"),
            ErrorCategory::Permission
        );
    }

    #[test]
    fn message_heuristics_apply_without_status() {
        assert_eq!(
            ErrorCategory::categorize(None, "Access token has expired"),
            ErrorCategory::Token
        );
        assert_eq!(
            ErrorCategory::categorize(None, "request timed out after 30s"),
            ErrorCategory::Network
        );
        assert_eq!(
            ErrorCategory::categorize(None, "Item not found"),
            ErrorCategory::Path
        );
        assert_eq!(
            ErrorCategory::categorize(None, "something odd happened"),
            ErrorCategory::Unknown
        );
    }
}
