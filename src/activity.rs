use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::models::NewActivityLog;
use crate::schema::activity_logs;

pub const ACTION_DOCUMENT_UPLOADED: &str = "document_uploaded";
pub const ACTION_DOCUMENT_UPLOAD_FAILED: &str = "document_upload_failed";
pub const ACTION_MESSAGE_FETCH_FAILED: &str = "message_fetch_failed";
pub const ACTION_REQUEST_STATUS_CHANGED: &str = "request_status_changed";
pub const ACTION_REQUEST_REPEATED: &str = "request_repeated";
pub const ACTION_VALIDATION_FLAGGED: &str = "validation_flagged";
pub const ACTION_VALIDATION_DEAD_LETTERED: &str = "validation_dead_lettered";

#[derive(Debug, Clone)]
pub struct ActivityEntry {
    organization_id: Uuid,
    action: String,
    entity_type: String,
    entity_id: Option<Uuid>,
    details: Value,
}

impl ActivityEntry {
    pub fn new(organization_id: Uuid, action: &str, entity_type: &str) -> Self {
        Self {
            organization_id,
            action: action.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: None,
            details: json!({}),
        }
    }

    pub fn entity(mut self, id: Uuid) -> Self {
        self.entity_id = Some(id);
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

pub fn record_activity(conn: &mut PgConnection, entry: ActivityEntry) -> QueryResult<()> {
    let row = NewActivityLog {
        id: Uuid::new_v4(),
        organization_id: entry.organization_id,
        action: entry.action,
        entity_type: entry.entity_type,
        entity_id: entry.entity_id,
        details: entry.details,
    };
    diesel::insert_into(activity_logs::table)
        .values(&row)
        .execute(conn)?;
    Ok(())
}
