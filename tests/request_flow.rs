mod common;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use chrono::{Duration, Months, NaiveDateTime, Utc};
use common::{acquire_db_lock, body_json, FakeMessage, TestApp, CRON_SECRET, GOOGLE_ACCESS};
use diesel::prelude::*;
use intake::models::DocumentRequest;
use intake::requests::expire_overdue;
use intake::schema::document_requests;
use uuid::Uuid;

async fn load_requests(app: &TestApp) -> Result<Vec<DocumentRequest>> {
    app.with_conn(|conn| {
        document_requests::table
            .order(document_requests::created_at.asc())
            .load(conn)
            .context("failed to load requests")
    })
    .await
}

async fn set_due_date(app: &TestApp, id: Uuid, due: NaiveDateTime) -> Result<()> {
    app.with_conn(move |conn| {
        diesel::update(document_requests::table.find(id))
            .set(document_requests::due_date.eq(Some(due)))
            .execute(conn)
            .context("failed to set due date")?;
        Ok(())
    })
    .await
}

#[tokio::test]
async fn second_document_completes_request_and_schedules_the_next() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    app.insert_account(GOOGLE_ACCESS).await?;
    app.insert_storage_config("Archive", true).await?;
    let request_id = app
        .insert_request("joy@client.example", "Monthly payroll", "sent", Some(2))
        .await?;
    let due = (Utc::now() + Duration::days(3))
        .date_naive()
        .and_hms_opt(12, 0, 0)
        .context("invalid due date")?;
    set_due_date(&app, request_id, due).await?;
    app.with_conn(move |conn| {
        diesel::update(document_requests::table.find(request_id))
            .set((
                document_requests::repeat_interval_type.eq(Some("months")),
                document_requests::repeat_interval_value.eq(Some(1)),
            ))
            .execute(conn)
            .context("failed to set repeat interval")?;
        Ok(())
    })
    .await?;

    let sent_at = Utc::now() - Duration::hours(2);
    app.mail
        .deliver(
            FakeMessage::new("msg-p1", "joy@client.example", "RE: Monthly payroll", sent_at)
                .attach("payroll.pdf", "application/pdf", b"payroll"),
        )
        .await;
    app.mail
        .deliver(
            FakeMessage::new("msg-p2", "joy@client.example", "Fwd: Monthly payroll", sent_at + Duration::minutes(30))
                .attach("taxes.pdf", "application/pdf", b"taxes"),
        )
        .await;

    let response = app.post_cron("/api/cron/ingest-emails", "", Some(CRON_SECRET)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response.into_body()).await?;
    assert_eq!(body["account_results"][0]["documents_stored"], 2);

    let requests = load_requests(&app).await?;
    assert_eq!(requests.len(), 2);

    let original = requests
        .iter()
        .find(|request| request.id == request_id)
        .context("original request missing")?;
    assert_eq!(original.status, "completed");
    assert_eq!(original.document_count, 2);
    assert!(original.received_at.is_some());
    assert!(original.completed_at.is_some());

    let next = requests
        .iter()
        .find(|request| request.id != request_id)
        .context("repeat request missing")?;
    assert_eq!(next.status, "pending");
    assert_eq!(next.parent_request_id, Some(request_id));
    assert_eq!(next.subject, "Monthly payroll");
    assert_eq!(next.document_count, 0);
    assert_eq!(next.due_date, due.checked_add_months(Months::new(1)));

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn overdue_open_requests_expire() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let now = Utc::now().naive_utc();
    let overdue = app
        .insert_request("kim@client.example", "Passport copy", "sent", None)
        .await?;
    set_due_date(&app, overdue, now - Duration::days(1)).await?;
    let upcoming = app
        .insert_request("kim@client.example", "Utility bill", "pending", None)
        .await?;
    set_due_date(&app, upcoming, now + Duration::days(1)).await?;
    let finished = app
        .insert_request("kim@client.example", "Lease", "completed", None)
        .await?;
    set_due_date(&app, finished, now - Duration::days(5)).await?;

    let expired = app.with_conn(move |conn| Ok(expire_overdue(conn, now)?)).await?;
    assert_eq!(expired, 1);

    let status_of = |id: Uuid, requests: &[DocumentRequest]| {
        requests
            .iter()
            .find(|request| request.id == id)
            .map(|request| request.status.clone())
    };
    let requests = load_requests(&app).await?;
    assert_eq!(status_of(overdue, &requests).as_deref(), Some("expired"));
    assert_eq!(status_of(upcoming, &requests).as_deref(), Some("pending"));
    assert_eq!(status_of(finished, &requests).as_deref(), Some("completed"));

    let again = app.with_conn(move |conn| Ok(expire_overdue(conn, now)?)).await?;
    assert_eq!(again, 0);

    app.cleanup().await?;
    Ok(())
}
