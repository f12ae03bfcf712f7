use std::fmt;

use chrono::{Duration, Months, NaiveDateTime};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::Serialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::activity::{record_activity, ActivityEntry, ACTION_REQUEST_REPEATED, ACTION_REQUEST_STATUS_CHANGED};
use crate::models::{DocumentRequest, NewDocumentRequest};
use crate::routing::normalize_subject;
use crate::schema::{document_requests, documents};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Sent,
    Received,
    Verifying,
    Completed,
    Expired,
    MissingFiles,
}

impl RequestStatus {
    pub const OPEN: [RequestStatus; 5] = [
        RequestStatus::Pending,
        RequestStatus::Sent,
        RequestStatus::Received,
        RequestStatus::Verifying,
        RequestStatus::MissingFiles,
    ];

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RequestStatus::Pending),
            "sent" => Some(RequestStatus::Sent),
            "received" => Some(RequestStatus::Received),
            "verifying" => Some(RequestStatus::Verifying),
            "completed" => Some(RequestStatus::Completed),
            "expired" => Some(RequestStatus::Expired),
            "missing_files" => Some(RequestStatus::MissingFiles),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Sent => "sent",
            RequestStatus::Received => "received",
            RequestStatus::Verifying => "verifying",
            RequestStatus::Completed => "completed",
            RequestStatus::Expired => "expired",
            RequestStatus::MissingFiles => "missing_files",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Expired)
    }

    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Pending, Sent)
                | (Pending, Received)
                | (Pending, Expired)
                | (Sent, Received)
                | (Sent, Expired)
                | (Received, Verifying)
                | (Received, Expired)
                | (Received, MissingFiles)
                | (Verifying, Completed)
                | (Verifying, Expired)
                | (Verifying, MissingFiles)
                | (MissingFiles, Verifying)
                | (MissingFiles, Expired)
        )
    }

    pub fn open_strs() -> Vec<&'static str> {
        Self::OPEN.iter().map(RequestStatus::as_str).collect()
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Picks the open request an inbound message belongs to. Sender must match
/// case-insensitively; among those, a normalized subject overlap wins and the
/// earliest-created overlap breaks ties. Without an overlap the earliest
/// candidate is used only when `fallback_earliest` is set.
pub fn match_request<'a>(
    candidates: &'a [DocumentRequest],
    sender_email: &str,
    subject: &str,
    fallback_earliest: bool,
) -> Option<&'a DocumentRequest> {
    let sender = sender_email.trim();
    let normalized = normalize_subject(subject);

    let from_sender: Vec<&DocumentRequest> = candidates
        .iter()
        .filter(|request| {
            RequestStatus::parse(&request.status).map_or(false, |status| !status.is_terminal())
        })
        .filter(|request| request.recipient_email.trim().eq_ignore_ascii_case(sender))
        .collect();

    let overlapping = earliest(from_sender.iter().copied().filter(|request| {
        subjects_overlap(&normalize_subject(&request.subject), &normalized)
    }));
    if overlapping.is_some() {
        return overlapping;
    }
    if fallback_earliest {
        return earliest(from_sender.into_iter());
    }
    None
}

fn earliest<'a>(
    requests: impl Iterator<Item = &'a DocumentRequest>,
) -> Option<&'a DocumentRequest> {
    requests.min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
}

fn subjects_overlap(request_subject: &str, message_subject: &str) -> bool {
    if request_subject.is_empty() || message_subject.is_empty() {
        return false;
    }
    message_subject.contains(request_subject) || request_subject.contains(message_subject)
}

/// Transitions the system applies after a matching email arrives, given the
/// recounted number of linked documents. Never leaves a terminal state.
pub fn plan_progress(
    current: RequestStatus,
    document_count: i32,
    expected: Option<i32>,
) -> Vec<RequestStatus> {
    let mut steps = Vec::new();
    let mut status = current;

    if matches!(status, RequestStatus::Pending | RequestStatus::Sent) {
        status = RequestStatus::Received;
        steps.push(status);
    }
    if document_count > 0 && matches!(status, RequestStatus::Received | RequestStatus::MissingFiles) {
        status = RequestStatus::Verifying;
        steps.push(status);
    }
    if status == RequestStatus::Verifying {
        if let Some(expected) = expected.filter(|expected| *expected > 0) {
            if document_count >= expected {
                steps.push(RequestStatus::Completed);
            }
        }
    }
    steps
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatInterval {
    Days(u32),
    Weeks(u32),
    Months(u32),
    Years(u32),
}

impl RepeatInterval {
    pub fn parse(kind: Option<&str>, value: Option<i32>) -> Option<Self> {
        let value = u32::try_from(value?).ok().filter(|value| *value > 0)?;
        match kind?.trim().to_ascii_lowercase().as_str() {
            "day" | "days" | "daily" => Some(RepeatInterval::Days(value)),
            "week" | "weeks" | "weekly" => Some(RepeatInterval::Weeks(value)),
            "month" | "months" | "monthly" => Some(RepeatInterval::Months(value)),
            "year" | "years" | "yearly" => Some(RepeatInterval::Years(value)),
            _ => None,
        }
    }

    pub fn advance(&self, from: NaiveDateTime) -> Option<NaiveDateTime> {
        match *self {
            RepeatInterval::Days(n) => from.checked_add_signed(Duration::days(n.into())),
            RepeatInterval::Weeks(n) => from.checked_add_signed(Duration::weeks(n.into())),
            RepeatInterval::Months(n) => from.checked_add_months(Months::new(n)),
            RepeatInterval::Years(n) => from.checked_add_months(Months::new(n.checked_mul(12)?)),
        }
    }
}

pub fn next_in_chain(request: &DocumentRequest, completed_at: NaiveDateTime) -> Option<NewDocumentRequest> {
    let interval = RepeatInterval::parse(
        request.repeat_interval_type.as_deref(),
        request.repeat_interval_value,
    )?;
    let due_date = interval.advance(request.due_date.unwrap_or(completed_at))?;

    Some(NewDocumentRequest {
        id: Uuid::new_v4(),
        organization_id: request.organization_id,
        recipient_email: request.recipient_email.clone(),
        recipient_name: request.recipient_name.clone(),
        subject: request.subject.clone(),
        body: request.body.clone(),
        template_id: request.template_id,
        status: RequestStatus::Pending.as_str().to_string(),
        document_count: 0,
        expected_document_count: request.expected_document_count,
        due_date: Some(due_date),
        repeat_interval_type: request.repeat_interval_type.clone(),
        repeat_interval_value: request.repeat_interval_value,
        reminder_enabled: request.reminder_enabled,
        reminder_interval_days: request.reminder_interval_days,
        parent_request_id: Some(request.id),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestProgress {
    pub request_id: Uuid,
    pub from: RequestStatus,
    pub to: RequestStatus,
    pub document_count: i32,
    pub spawned_request_id: Option<Uuid>,
}

pub fn load_open_requests(
    conn: &mut PgConnection,
    organization_id: Uuid,
    sender_email: &str,
) -> QueryResult<Vec<DocumentRequest>> {
    document_requests::table
        .filter(document_requests::organization_id.eq(organization_id))
        .filter(document_requests::status.eq_any(RequestStatus::open_strs()))
        .filter(document_requests::recipient_email.ilike(escape_like(sender_email.trim())))
        .order((document_requests::created_at.asc(), document_requests::id.asc()))
        .load(conn)
}

pub(crate) fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Recounts linked documents and applies the planned transitions under a
/// row lock. Completing a repeating request spawns its successor in the same
/// transaction.
pub fn advance_request(
    conn: &mut PgConnection,
    request_id: Uuid,
    now: NaiveDateTime,
) -> QueryResult<Option<RequestProgress>> {
    conn.transaction(|conn| {
        let request: DocumentRequest = document_requests::table
            .find(request_id)
            .for_update()
            .first(conn)?;
        let Some(current) = RequestStatus::parse(&request.status) else {
            return Ok(None);
        };
        if current.is_terminal() {
            return Ok(None);
        }

        let linked: i64 = documents::table
            .filter(documents::document_request_id.eq(request_id))
            .count()
            .get_result(conn)?;
        let document_count = i32::try_from(linked).unwrap_or(i32::MAX);

        let steps = plan_progress(current, document_count, request.expected_document_count);
        let target = steps.last().copied().unwrap_or(current);

        let received_at = request.received_at.or_else(|| {
            steps
                .contains(&RequestStatus::Received)
                .then_some(now)
        });
        let completed_at = (target == RequestStatus::Completed).then_some(now);

        diesel::update(document_requests::table.find(request_id))
            .set((
                document_requests::status.eq(target.as_str()),
                document_requests::document_count.eq(document_count),
                document_requests::received_at.eq(received_at),
                document_requests::completed_at.eq(completed_at.or(request.completed_at)),
                document_requests::updated_at.eq(now),
            ))
            .execute(conn)?;

        let mut from = current;
        for step in &steps {
            record_activity(
                conn,
                ActivityEntry::new(request.organization_id, ACTION_REQUEST_STATUS_CHANGED, "document_request")
                    .entity(request_id)
                    .details(json!({
                        "from": from.as_str(),
                        "to": step.as_str(),
                        "document_count": document_count,
                    })),
            )?;
            from = *step;
        }

        let mut spawned_request_id = None;
        if target == RequestStatus::Completed {
            if let Some(next) = next_in_chain(&request, now) {
                diesel::insert_into(document_requests::table)
                    .values(&next)
                    .execute(conn)?;
                record_activity(
                    conn,
                    ActivityEntry::new(request.organization_id, ACTION_REQUEST_REPEATED, "document_request")
                        .entity(next.id)
                        .details(json!({
                            "parent_request_id": request_id,
                            "due_date": next.due_date,
                        })),
                )?;
                spawned_request_id = Some(next.id);
            }
        }

        if !steps.is_empty() {
            info!(
                request_id = %request_id,
                from = current.as_str(),
                to = target.as_str(),
                document_count,
                "document request advanced"
            );
        }

        Ok(Some(RequestProgress {
            request_id,
            from: current,
            to: target,
            document_count,
            spawned_request_id,
        }))
    })
}

pub fn expire_overdue(conn: &mut PgConnection, now: NaiveDateTime) -> QueryResult<usize> {
    conn.transaction(|conn| {
        let overdue: Vec<DocumentRequest> = document_requests::table
            .filter(document_requests::status.eq_any(RequestStatus::open_strs()))
            .filter(document_requests::due_date.lt(now))
            .for_update()
            .skip_locked()
            .load(conn)?;

        let mut expired = 0;
        for request in overdue {
            let Some(current) = RequestStatus::parse(&request.status) else {
                continue;
            };
            if !current.can_transition_to(RequestStatus::Expired) {
                continue;
            }
            diesel::update(document_requests::table.find(request.id))
                .set((
                    document_requests::status.eq(RequestStatus::Expired.as_str()),
                    document_requests::updated_at.eq(now),
                ))
                .execute(conn)?;
            record_activity(
                conn,
                ActivityEntry::new(request.organization_id, ACTION_REQUEST_STATUS_CHANGED, "document_request")
                    .entity(request.id)
                    .details(json!({ "from": current.as_str(), "to": "expired" })),
            )?;
            expired += 1;
        }
        Ok(expired)
    })
}
