use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use crate::{
    auth::CronCaller,
    error::{AppError, AppResult},
    ingest::run_ingestion,
    state::AppState,
    tokens::store::refresh_expiring,
    workers::{effective_batch_size, process_batch},
};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessValidationsRequest {
    pub batch_size: Option<i64>,
}

fn optional_body<T: Default + for<'de> Deserialize<'de>>(body: &Bytes) -> AppResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(body)?)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn success(mut counts: Value, started: Instant) -> Response {
    if let Value::Object(fields) = &mut counts {
        fields.insert("success".into(), json!(true));
        fields.insert("duration_ms".into(), json!(elapsed_ms(started)));
    }
    (StatusCode::OK, Json(counts)).into_response()
}

fn failure(job: &str, err: impl std::fmt::Display, started: Instant) -> Response {
    error!(job, error = %err, "cron run failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "success": false,
            "error": err.to_string(),
            "duration_ms": elapsed_ms(started),
        })),
    )
        .into_response()
}

pub async fn ingest_emails(_caller: CronCaller, State(state): State<AppState>) -> Response {
    let started = Instant::now();
    match run_ingestion(&state).await {
        Ok(summary) => success(
            json!({
                "processed": summary.processed,
                "errors": summary.errors,
                "accounts_processed": summary.accounts_processed,
                "account_results": summary.account_results,
            }),
            started,
        ),
        Err(err) => failure("ingest-emails", err, started),
    }
}

pub async fn refresh_tokens(_caller: CronCaller, State(state): State<AppState>) -> Response {
    let started = Instant::now();
    match refresh_expiring(&state).await {
        Ok(summary) => success(
            json!({
                "refreshed": summary.refreshed,
                "quarantined": summary.quarantined,
                "skipped": summary.skipped,
                "errors": summary.errors,
            }),
            started,
        ),
        Err(err) => failure("refresh-tokens", err, started),
    }
}

pub async fn process_validations(
    _caller: CronCaller,
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, AppError> {
    let started = Instant::now();
    let request: ProcessValidationsRequest = optional_body(&body)?;
    let batch_size = effective_batch_size(
        request.batch_size,
        state.config.validation_default_batch_size,
        state.config.validation_max_batch_size,
    );

    Ok(match process_batch(&state, batch_size).await {
        Ok(summary) => success(
            json!({
                "batch_size": batch_size,
                "processed": summary.claimed,
                "completed": summary.completed,
                "retried": summary.retried,
                "dead_lettered": summary.dead_lettered,
                "released_stale": summary.released_stale,
                "errors": summary.errors,
            }),
            started,
        ),
        Err(err) => failure("process-validations", err, started),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_object_bodies_are_accepted() {
        let empty: ProcessValidationsRequest = optional_body(&Bytes::new()).unwrap();
        assert_eq!(empty.batch_size, None);

        let braces: ProcessValidationsRequest = optional_body(&Bytes::from_static(b"{}")).unwrap();
        assert_eq!(braces.batch_size, None);

        let sized: ProcessValidationsRequest =
            optional_body(&Bytes::from_static(br#"{"batchSize": 25}"#)).unwrap();
        assert_eq!(sized.batch_size, Some(25));
    }

    #[test]
    fn malformed_body_is_a_bad_request() {
        let err = optional_body::<ProcessValidationsRequest>(&Bytes::from_static(b"{nope"))
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
