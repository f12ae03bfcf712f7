use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::activity::{record_activity, ActivityEntry, ACTION_VALIDATION_FLAGGED};
use crate::models::NewDocumentValidation;
use crate::remote::{check_status, ProviderError};
use crate::schema::document_validations;

const PROVIDER: &str = "validation";

pub const STATUS_PASS: &str = "pass";
pub const STATUS_NEEDS_REVIEW: &str = "needs_review";
pub const STATUS_REJECT: &str = "reject";

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("validation service URL is not configured")]
    NotConfigured,
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ValidationResult {
    pub overall_status: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub details: serde_json::Map<String, Value>,
}

impl ValidationResult {
    pub fn normalized_status(&self) -> String {
        self.overall_status.trim().to_ascii_lowercase().replace('-', "_")
    }

    pub fn is_flagged(&self) -> bool {
        matches!(
            self.normalized_status().as_str(),
            STATUS_NEEDS_REVIEW | STATUS_REJECT
        )
    }
}

/// The external document-validation collaborator.
#[async_trait]
pub trait ValidationClient: Send + Sync {
    async fn validate(&self, document_id: Uuid) -> Result<ValidationResult, ValidationError>;
}

#[derive(Clone)]
pub struct HttpValidationClient {
    http: Client,
    url: Option<String>,
}

impl HttpValidationClient {
    pub fn new(http: Client, url: Option<String>) -> Self {
        Self {
            http,
            url: url.filter(|url| !url.trim().is_empty()),
        }
    }
}

#[async_trait]
impl ValidationClient for HttpValidationClient {
    async fn validate(&self, document_id: Uuid) -> Result<ValidationResult, ValidationError> {
        let url = self.url.as_deref().ok_or(ValidationError::NotConfigured)?;
        let response = self
            .http
            .post(url)
            .json(&json!({ "document_id": document_id }))
            .send()
            .await
            .map_err(ProviderError::transport(PROVIDER))?;
        let response = check_status(PROVIDER, response).await?;
        let result = response
            .json::<ValidationResult>()
            .await
            .map_err(|err| ProviderError::decode(PROVIDER, err.to_string()))?;
        Ok(result)
    }
}

pub fn record_validation(
    conn: &mut PgConnection,
    organization_id: Uuid,
    document_id: Uuid,
    result: &ValidationResult,
) -> QueryResult<()> {
    let status = result.normalized_status();
    conn.transaction::<_, diesel::result::Error, _>(|conn| {
        diesel::insert_into(document_validations::table)
            .values(&NewDocumentValidation {
                id: Uuid::new_v4(),
                document_id,
                overall_status: status.clone(),
                expires_at: result.expires_at.map(|dt| dt.naive_utc()),
                details: Value::Object(result.details.clone()),
            })
            .execute(conn)?;

        if result.is_flagged() {
            record_activity(
                conn,
                ActivityEntry::new(organization_id, ACTION_VALIDATION_FLAGGED, "document")
                    .entity(document_id)
                    .details(json!({ "overall_status": status })),
            )?;
        }
        Ok(())
    })?;

    info!(document_id = %document_id, overall_status = %status, "validation recorded");
    Ok(())
}
