use std::env;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use intake::{config::AppConfig, db, db::PgPool, jobs, requests};

const USAGE: &str = "Usage: maintenance <command>
  expire-requests                     expire open requests past their due date
  list-dlq [limit]                    list unresolved dead-lettered validation jobs
  resolve-dlq <entry-id> <by> [notes] mark a dead-letter entry resolved
  cancel-job <job-id>                 cancel a pending or processing validation job";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{USAGE}");
        std::process::exit(1);
    };

    let pool = connect()?;
    match command.as_str() {
        "expire-requests" => expire_requests(&pool)?,
        "list-dlq" => {
            let limit = match args.get(1) {
                Some(raw) => raw.parse().context("limit must be an integer")?,
                None => 100,
            };
            list_dlq(&pool, limit)?
        }
        "resolve-dlq" => {
            let (Some(entry), Some(by)) = (args.get(1), args.get(2)) else {
                eprintln!("{USAGE}");
                std::process::exit(1);
            };
            let entry_id = Uuid::parse_str(entry).context("entry id must be a UUID")?;
            let notes = (args.len() > 3).then(|| args[3..].join(" "));
            resolve_dlq(&pool, entry_id, by, notes.as_deref())?
        }
        "cancel-job" => {
            let Some(job) = args.get(1) else {
                eprintln!("{USAGE}");
                std::process::exit(1);
            };
            let job_id = Uuid::parse_str(job).context("job id must be a UUID")?;
            cancel_job(&pool, job_id)?
        }
        other => {
            eprintln!("Unknown command: {other}\n{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn connect() -> Result<PgPool> {
    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        "loaded intake configuration"
    );
    db::init_pool_with_size(&config.database_url, 1)
}

fn expire_requests(pool: &PgPool) -> Result<()> {
    let mut conn = pool.get().context("failed to get database connection")?;
    let expired = requests::expire_overdue(&mut conn, Utc::now().naive_utc())
        .context("failed to expire overdue requests")?;
    println!("Expired {expired} overdue requests.");
    Ok(())
}

fn list_dlq(pool: &PgPool, limit: i64) -> Result<()> {
    let mut conn = pool.get().context("failed to get database connection")?;
    let entries = jobs::list_unresolved_dlq(&mut conn, limit)?;
    if entries.is_empty() {
        println!("No unresolved dead-letter entries.");
        return Ok(());
    }
    for entry in &entries {
        println!(
            "{}  job={}  document={}  attempts={}  failed_at={}  error={}",
            entry.id,
            entry.job_id,
            entry.document_id,
            entry.final_attempt,
            entry.failed_at,
            entry.final_error
        );
    }
    Ok(())
}

fn resolve_dlq(pool: &PgPool, entry_id: Uuid, by: &str, notes: Option<&str>) -> Result<()> {
    let mut conn = pool.get().context("failed to get database connection")?;
    let entry = jobs::resolve_dlq(&mut conn, entry_id, by, notes, Utc::now().naive_utc())?;
    println!("Resolved dead-letter entry {} (job {}).", entry.id, entry.job_id);
    Ok(())
}

fn cancel_job(pool: &PgPool, job_id: Uuid) -> Result<()> {
    let mut conn = pool.get().context("failed to get database connection")?;
    if !jobs::cancel(&mut conn, job_id, Utc::now().naive_utc())? {
        bail!("job {job_id} is not pending or processing");
    }
    println!("Cancelled validation job {job_id}.");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
