use chrono::{Duration, NaiveDateTime};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::activity::{record_activity, ActivityEntry, ACTION_VALIDATION_DEAD_LETTERED};
use crate::models::{NewValidationDlqEntry, NewValidationJob, ValidationDlqEntry, ValidationJob};
use crate::schema::{validation_dlq, validation_jobs};

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_CANCELLED: &str = "cancelled";

pub const DEFAULT_MAX_ATTEMPTS: i32 = 6;
pub const STALE_PROCESSING_MINUTES: i64 = 30;

const BACKOFF_SCHEDULE_SECONDS: [i64; 6] = [60, 5 * 60, 15 * 60, 60 * 60, 6 * 60 * 60, 24 * 60 * 60];

#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("database pool error: {0}")]
    Pool(String),
    #[error("dead-letter entry {0} is already resolved")]
    AlreadyResolved(Uuid),
}

pub type JobQueueResult<T> = Result<T, JobQueueError>;

pub fn backoff(attempt: i32) -> Duration {
    let index = usize::try_from(attempt.max(1) - 1)
        .unwrap_or(0)
        .min(BACKOFF_SCHEDULE_SECONDS.len() - 1);
    Duration::seconds(BACKOFF_SCHEDULE_SECONDS[index])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Retry { next_run_at: NaiveDateTime },
    DeadLetter,
}

pub fn failure_disposition(attempt: i32, max_attempts: i32, now: NaiveDateTime) -> FailureDisposition {
    if attempt >= max_attempts {
        FailureDisposition::DeadLetter
    } else {
        FailureDisposition::Retry {
            next_run_at: now + backoff(attempt),
        }
    }
}

/// Queues validation for a document. A document with a job still pending or
/// processing gets that job back instead of a second one.
pub fn enqueue(
    conn: &mut PgConnection,
    organization_id: Uuid,
    document_id: Uuid,
    now: NaiveDateTime,
) -> JobQueueResult<ValidationJob> {
    conn.transaction(|conn| {
        let existing = validation_jobs::table
            .filter(validation_jobs::document_id.eq(document_id))
            .filter(validation_jobs::status.eq_any([STATUS_PENDING, STATUS_PROCESSING]))
            .first::<ValidationJob>(conn)
            .optional()?;
        if let Some(job) = existing {
            return Ok(job);
        }

        let new_job = NewValidationJob {
            id: Uuid::new_v4(),
            organization_id,
            document_id,
            status: STATUS_PENDING.to_string(),
            attempt: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            next_run_at: now,
        };
        diesel::insert_into(validation_jobs::table)
            .values(&new_job)
            .execute(conn)?;
        validation_jobs::table.find(new_job.id).first(conn)
    })
    .map_err(JobQueueError::from)
}

/// Claims up to `limit` due jobs, marking them processing and counting the
/// attempt. Rows locked by another worker are skipped.
pub fn claim_batch(
    conn: &mut PgConnection,
    limit: i64,
    now: NaiveDateTime,
) -> JobQueueResult<Vec<ValidationJob>> {
    conn.transaction(|conn| {
        let due: Vec<ValidationJob> = validation_jobs::table
            .filter(validation_jobs::status.eq(STATUS_PENDING))
            .filter(validation_jobs::next_run_at.le(now))
            .order((validation_jobs::next_run_at.asc(), validation_jobs::id.asc()))
            .limit(limit.max(0))
            .for_update()
            .skip_locked()
            .load(conn)?;

        let ids: Vec<Uuid> = due.iter().map(|job| job.id).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        diesel::update(validation_jobs::table.filter(validation_jobs::id.eq_any(&ids)))
            .set((
                validation_jobs::status.eq(STATUS_PROCESSING),
                validation_jobs::attempt.eq(validation_jobs::attempt + 1),
                validation_jobs::updated_at.eq(now),
            ))
            .execute(conn)?;

        validation_jobs::table
            .filter(validation_jobs::id.eq_any(&ids))
            .order((validation_jobs::next_run_at.asc(), validation_jobs::id.asc()))
            .load(conn)
    })
    .map_err(JobQueueError::from)
}

pub fn complete(conn: &mut PgConnection, job_id: Uuid, now: NaiveDateTime) -> JobQueueResult<()> {
    diesel::update(validation_jobs::table.find(job_id))
        .set((
            validation_jobs::status.eq(STATUS_COMPLETED),
            validation_jobs::last_error.eq::<Option<String>>(None),
            validation_jobs::updated_at.eq(now),
        ))
        .execute(conn)?;
    Ok(())
}

/// Reschedules with backoff, or moves the job to the dead-letter table in
/// the same transaction once its attempts are spent.
pub fn fail(
    conn: &mut PgConnection,
    job_id: Uuid,
    error_message: &str,
    now: NaiveDateTime,
) -> JobQueueResult<FailureDisposition> {
    conn.transaction(|conn| {
        let job: ValidationJob = validation_jobs::table
            .find(job_id)
            .for_update()
            .first(conn)?;
        let disposition = failure_disposition(job.attempt, job.max_attempts, now);

        match disposition {
            FailureDisposition::Retry { next_run_at } => {
                diesel::update(validation_jobs::table.find(job_id))
                    .set((
                        validation_jobs::status.eq(STATUS_PENDING),
                        validation_jobs::next_run_at.eq(next_run_at),
                        validation_jobs::last_error.eq(Some(error_message)),
                        validation_jobs::updated_at.eq(now),
                    ))
                    .execute(conn)?;
                info!(job_id = %job_id, attempt = job.attempt, %next_run_at, "validation job rescheduled");
            }
            FailureDisposition::DeadLetter => {
                diesel::update(validation_jobs::table.find(job_id))
                    .set((
                        validation_jobs::status.eq(STATUS_FAILED),
                        validation_jobs::last_error.eq(Some(error_message)),
                        validation_jobs::updated_at.eq(now),
                    ))
                    .execute(conn)?;
                let entry = NewValidationDlqEntry {
                    id: Uuid::new_v4(),
                    job_id,
                    organization_id: job.organization_id,
                    document_id: job.document_id,
                    final_attempt: job.attempt,
                    final_error: error_message.to_string(),
                };
                diesel::insert_into(validation_dlq::table)
                    .values(&entry)
                    .execute(conn)?;
                record_activity(
                    conn,
                    ActivityEntry::new(job.organization_id, ACTION_VALIDATION_DEAD_LETTERED, "document")
                        .entity(job.document_id)
                        .details(json!({
                            "job_id": job_id,
                            "final_attempt": job.attempt,
                            "error": error_message,
                        })),
                )?;
                warn!(job_id = %job_id, attempt = job.attempt, "validation job moved to dead-letter queue");
            }
        }

        Ok::<FailureDisposition, diesel::result::Error>(disposition)
    })
    .map_err(JobQueueError::from)
}

pub fn cancel(conn: &mut PgConnection, job_id: Uuid, now: NaiveDateTime) -> JobQueueResult<bool> {
    let updated = diesel::update(
        validation_jobs::table
            .find(job_id)
            .filter(validation_jobs::status.eq_any([STATUS_PENDING, STATUS_PROCESSING])),
    )
    .set((
        validation_jobs::status.eq(STATUS_CANCELLED),
        validation_jobs::updated_at.eq(now),
    ))
    .execute(conn)?;
    Ok(updated > 0)
}

pub fn release_stale(conn: &mut PgConnection, now: NaiveDateTime) -> JobQueueResult<usize> {
    let cutoff = now - Duration::minutes(STALE_PROCESSING_MINUTES);
    let released = diesel::update(
        validation_jobs::table
            .filter(validation_jobs::status.eq(STATUS_PROCESSING))
            .filter(validation_jobs::updated_at.lt(cutoff)),
    )
    .set((
        validation_jobs::status.eq(STATUS_PENDING),
        validation_jobs::next_run_at.eq(now),
        validation_jobs::updated_at.eq(now),
    ))
    .execute(conn)?;
    if released > 0 {
        warn!(released, "released stale validation jobs");
    }
    Ok(released)
}

pub fn resolve_dlq(
    conn: &mut PgConnection,
    entry_id: Uuid,
    resolved_by: &str,
    notes: Option<&str>,
    now: NaiveDateTime,
) -> JobQueueResult<ValidationDlqEntry> {
    conn.transaction(|conn| {
        let entry: ValidationDlqEntry = validation_dlq::table
            .find(entry_id)
            .for_update()
            .first(conn)?;
        if entry.resolved_at.is_some() {
            return Err(JobQueueError::AlreadyResolved(entry_id));
        }

        diesel::update(validation_dlq::table.find(entry_id))
            .set((
                validation_dlq::resolved_at.eq(Some(now)),
                validation_dlq::resolved_by.eq(Some(resolved_by)),
                validation_dlq::resolution_notes.eq(notes),
            ))
            .execute(conn)?;
        Ok(validation_dlq::table.find(entry_id).first(conn)?)
    })
}

pub fn list_unresolved_dlq(conn: &mut PgConnection, limit: i64) -> JobQueueResult<Vec<ValidationDlqEntry>> {
    let entries = validation_dlq::table
        .filter(validation_dlq::resolved_at.is_null())
        .order(validation_dlq::failed_at.asc())
        .limit(limit)
        .load(conn)?;
    Ok(entries)
}
