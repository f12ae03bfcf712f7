use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    jobs::{claim_batch, complete, fail, release_stale, FailureDisposition, JobQueueError},
    models::ValidationJob,
    state::AppState,
};

pub mod validation;

pub use validation::{
    record_validation, HttpValidationClient, ValidationClient, ValidationError, ValidationResult,
};

#[derive(Debug)]
pub enum JobExecution {
    Success(ValidationResult),
    Failed { error: String },
}

#[derive(Debug, Default, Serialize)]
pub struct ValidationRunSummary {
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub released_stale: usize,
    pub errors: usize,
}

pub fn effective_batch_size(requested: Option<i64>, default: i64, max: i64) -> i64 {
    requested.unwrap_or(default).clamp(1, max.max(1))
}

/// One externally triggered worker pass: reclaim stale jobs, claim a bounded
/// batch and run each job through the validation collaborator in turn.
pub async fn process_batch(
    state: &AppState,
    batch_size: i64,
) -> Result<ValidationRunSummary, JobQueueError> {
    let mut summary = ValidationRunSummary::default();

    let jobs = {
        let mut conn = state
            .db()
            .map_err(|err| JobQueueError::Pool(err.to_string()))?;
        let now = Utc::now().naive_utc();
        summary.released_stale = release_stale(&mut conn, now)?;
        claim_batch(&mut conn, batch_size, now)?
    };
    summary.claimed = jobs.len();
    info!(claimed = jobs.len(), batch_size, "validation batch claimed");

    for job in jobs {
        let execution = execute(state, &job).await;
        if let Err(err) = settle(state, &job, execution, &mut summary) {
            error!(job_id = %job.id, error = %err, "failed to record validation job outcome");
            summary.errors += 1;
        }
    }

    Ok(summary)
}

async fn execute(state: &AppState, job: &ValidationJob) -> JobExecution {
    match state.validator.validate(job.document_id).await {
        Ok(result) => JobExecution::Success(result),
        Err(err) => {
            warn!(job_id = %job.id, attempt = job.attempt, error = %err, "validation attempt failed");
            JobExecution::Failed {
                error: err.to_string(),
            }
        }
    }
}

fn settle(
    state: &AppState,
    job: &ValidationJob,
    execution: JobExecution,
    summary: &mut ValidationRunSummary,
) -> Result<(), JobQueueError> {
    let mut conn = state
        .db()
        .map_err(|err| JobQueueError::Pool(err.to_string()))?;
    let now = Utc::now().naive_utc();

    match execution {
        JobExecution::Success(result) => {
            record_validation(&mut conn, job.organization_id, job.document_id, &result)?;
            complete(&mut conn, job.id, now)?;
            summary.completed += 1;
        }
        JobExecution::Failed { error } => match fail(&mut conn, job.id, &error, now)? {
            FailureDisposition::Retry { .. } => summary.retried += 1,
            FailureDisposition::DeadLetter => summary.dead_lettered += 1,
        },
    }
    Ok(())
}

/// Used when queueing is disabled: validates in the background and only logs
/// failures, with no retry.
pub fn spawn_direct_validation(state: AppState, organization_id: Uuid, document_id: Uuid) {
    tokio::spawn(async move {
        match state.validator.validate(document_id).await {
            Ok(result) => {
                let recorded = state.db().map_err(|err| err.to_string()).and_then(|mut conn| {
                    record_validation(&mut conn, organization_id, document_id, &result)
                        .map_err(|err| err.to_string())
                });
                if let Err(err) = recorded {
                    error!(document_id = %document_id, error = %err, "failed to record direct validation");
                }
            }
            Err(err) => {
                warn!(document_id = %document_id, error = %err, "direct validation call failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::effective_batch_size;

    #[test]
    fn batch_size_is_clamped() {
        assert_eq!(effective_batch_size(None, 10, 50), 10);
        assert_eq!(effective_batch_size(Some(500), 10, 50), 50);
        assert_eq!(effective_batch_size(Some(0), 10, 50), 1);
        assert_eq!(effective_batch_size(Some(-4), 10, 50), 1);
    }
}
