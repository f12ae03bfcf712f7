use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use ring::constant_time::verify_slices_are_equal;
use tracing::warn;

use crate::{error::AppError, state::AppState};

#[derive(Debug, Clone, Copy)]
pub struct CronCaller;

#[async_trait]
impl FromRequestParts<AppState> for CronCaller {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(secret) = state.config.cron_secret.as_deref() else {
            return Ok(CronCaller);
        };

        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::unauthorized())?;

        if secret_matches(secret, bearer.token()) {
            Ok(CronCaller)
        } else {
            warn!(path = %parts.uri.path(), "rejected cron call with wrong secret");
            Err(AppError::unauthorized())
        }
    }
}

fn secret_matches(expected: &str, presented: &str) -> bool {
    verify_slices_are_equal(expected.as_bytes(), presented.as_bytes()).is_ok()
}

#[cfg(test)]
mod tests {
    use super::secret_matches;

    #[test]
    fn compares_whole_secret() {
        assert!(secret_matches("s3cret", "s3cret"));
        assert!(!secret_matches("s3cret", "s3cre"));
        assert!(!secret_matches("s3cret", "S3CRET"));
        assert!(!secret_matches("s3cret", ""));
    }
}
