use axum::{extract::State, http::StatusCode, response::Json};
use diesel::{sql_query, RunQueryDsl};
use serde_json::{json, Value};

use crate::state::AppState;

/// Liveness plus a database round trip. Reports 503 when the pool cannot serve a query.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let probe = tokio::task::spawn_blocking(move || -> Result<(), String> {
        let mut conn = state.pool.get().map_err(|err| err.to_string())?;
        sql_query("SELECT 1")
            .execute(&mut conn)
            .map_err(|err| err.to_string())?;
        Ok(())
    })
    .await
    .unwrap_or_else(|err| Err(err.to_string()));

    match probe {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "database": "ok" })),
        ),
        Err(err) => {
            tracing::warn!(error = %err, "health check could not reach database");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "database": "unreachable" })),
            )
        }
    }
}
