use chrono::NaiveDateTime;
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = email_accounts)]
pub struct EmailAccount {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub provider: String,
    pub email_address: String,
    pub access_token_encrypted: Option<String>,
    pub refresh_token_encrypted: Option<String>,
    pub token_expires_at: Option<NaiveDateTime>,
    pub last_sync_at: Option<NaiveDateTime>,
    pub is_active: bool,
    pub last_error: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = email_accounts)]
pub struct NewEmailAccount {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub provider: String,
    pub email_address: String,
    pub access_token_encrypted: Option<String>,
    pub refresh_token_encrypted: Option<String>,
    pub token_expires_at: Option<NaiveDateTime>,
    pub last_sync_at: Option<NaiveDateTime>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = storage_configs)]
pub struct StorageConfig {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub provider: String,
    pub config: serde_json::Value,
    pub credentials_encrypted: Option<String>,
    pub access_token_encrypted: Option<String>,
    pub refresh_token_encrypted: Option<String>,
    pub token_expires_at: Option<NaiveDateTime>,
    pub is_default: bool,
    pub is_active: bool,
    pub last_error: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = storage_configs)]
pub struct NewStorageConfig {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub provider: String,
    pub config: serde_json::Value,
    pub credentials_encrypted: Option<String>,
    pub access_token_encrypted: Option<String>,
    pub refresh_token_encrypted: Option<String>,
    pub token_expires_at: Option<NaiveDateTime>,
    pub is_default: bool,
    pub is_active: bool,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = routing_rules)]
pub struct RoutingRuleRow {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub priority: i32,
    pub is_active: bool,
    pub conditions: serde_json::Value,
    pub actions: serde_json::Value,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = routing_rules)]
pub struct NewRoutingRule {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub priority: i32,
    pub is_active: bool,
    pub conditions: serde_json::Value,
    pub actions: serde_json::Value,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = employees)]
pub struct Employee {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub email: String,
    pub full_name: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = employees)]
pub struct NewEmployee {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub email: String,
    pub full_name: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = document_requests)]
pub struct DocumentRequest {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub recipient_email: String,
    pub recipient_name: Option<String>,
    pub subject: String,
    pub body: Option<String>,
    pub template_id: Option<Uuid>,
    pub status: String,
    pub document_count: i32,
    pub expected_document_count: Option<i32>,
    pub due_date: Option<NaiveDateTime>,
    pub repeat_interval_type: Option<String>,
    pub repeat_interval_value: Option<i32>,
    pub reminder_enabled: bool,
    pub reminder_interval_days: Option<i32>,
    pub parent_request_id: Option<Uuid>,
    pub received_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = document_requests)]
pub struct NewDocumentRequest {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub recipient_email: String,
    pub recipient_name: Option<String>,
    pub subject: String,
    pub body: Option<String>,
    pub template_id: Option<Uuid>,
    pub status: String,
    pub document_count: i32,
    pub expected_document_count: Option<i32>,
    pub due_date: Option<NaiveDateTime>,
    pub repeat_interval_type: Option<String>,
    pub repeat_interval_value: Option<i32>,
    pub reminder_enabled: bool,
    pub reminder_interval_days: Option<i32>,
    pub parent_request_id: Option<Uuid>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = documents)]
pub struct Document {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub email_account_id: Option<Uuid>,
    pub document_request_id: Option<Uuid>,
    pub routing_rule_id: Option<Uuid>,
    pub storage_config_id: Option<Uuid>,
    pub message_id: String,
    pub sender_email: String,
    pub sender_name: Option<String>,
    pub subject: String,
    pub filename: String,
    pub storage_provider: Option<String>,
    pub storage_location: Option<String>,
    pub storage_path: Option<String>,
    pub storage_url: Option<String>,
    pub size_bytes: i64,
    pub mime_type: String,
    pub content_hash: Option<String>,
    pub metadata: serde_json::Value,
    pub upload_verification_status: String,
    pub upload_error: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = documents)]
pub struct NewDocument {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub email_account_id: Option<Uuid>,
    pub document_request_id: Option<Uuid>,
    pub routing_rule_id: Option<Uuid>,
    pub storage_config_id: Option<Uuid>,
    pub message_id: String,
    pub sender_email: String,
    pub sender_name: Option<String>,
    pub subject: String,
    pub filename: String,
    pub storage_provider: Option<String>,
    pub storage_location: Option<String>,
    pub storage_path: Option<String>,
    pub storage_url: Option<String>,
    pub size_bytes: i64,
    pub mime_type: String,
    pub content_hash: Option<String>,
    pub metadata: serde_json::Value,
    pub upload_verification_status: String,
    pub upload_error: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = document_validations)]
pub struct DocumentValidation {
    pub id: Uuid,
    pub document_id: Uuid,
    pub overall_status: String,
    pub expires_at: Option<NaiveDateTime>,
    pub details: serde_json::Value,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = document_validations)]
pub struct NewDocumentValidation {
    pub id: Uuid,
    pub document_id: Uuid,
    pub overall_status: String,
    pub expires_at: Option<NaiveDateTime>,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = validation_jobs)]
pub struct ValidationJob {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub document_id: Uuid,
    pub status: String,
    pub attempt: i32,
    pub max_attempts: i32,
    pub next_run_at: NaiveDateTime,
    pub last_error: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = validation_jobs)]
pub struct NewValidationJob {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub document_id: Uuid,
    pub status: String,
    pub attempt: i32,
    pub max_attempts: i32,
    pub next_run_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = validation_dlq)]
pub struct ValidationDlqEntry {
    pub id: Uuid,
    pub job_id: Uuid,
    pub organization_id: Uuid,
    pub document_id: Uuid,
    pub final_attempt: i32,
    pub final_error: String,
    pub failed_at: NaiveDateTime,
    pub resolved_at: Option<NaiveDateTime>,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = validation_dlq)]
pub struct NewValidationDlqEntry {
    pub id: Uuid,
    pub job_id: Uuid,
    pub organization_id: Uuid,
    pub document_id: Uuid,
    pub final_attempt: i32,
    pub final_error: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = activity_logs)]
pub struct ActivityLog {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<Uuid>,
    pub details: serde_json::Value,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = activity_logs)]
pub struct NewActivityLog {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<Uuid>,
    pub details: serde_json::Value,
}
