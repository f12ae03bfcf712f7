use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod cron;
pub mod health;

pub fn create_router(state: AppState) -> Router<()> {
    let cron_routes = Router::new()
        .route("/ingest-emails", post(cron::ingest_emails))
        .route("/refresh-tokens", post(cron::refresh_tokens))
        .route("/process-validations", post(cron::process_validations));

    Router::new()
        .nest("/api/cron", cron_routes)
        .route("/api/health", get(health::health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
