//! Operator CLI for pipeline jobs.
//!
//! Works directly against the job store: listing and inspecting jobs,
//! releasing claims left behind by a crashed run, re-arming failed
//! batches, cancelling, and purging old terminal jobs. Workers pick up
//! repaired state the next time the pipeline process resumes the job.

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use pipeline::stores::SqliteJobStore;
use pipeline::{Batch, BatchStatus, Job, JobFilter, JobStatus, JobStore};

#[derive(Parser)]
#[command(name = "jobctl", about = "Inspect and repair pipeline jobs")]
struct Cli {
    /// SQLite database URL (defaults to $PIPELINE_DB)
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List jobs, newest first
    List {
        /// Only jobs in this status (pending, running, completed, failed, cancelled)
        #[arg(long)]
        status: Option<String>,

        /// Only jobs belonging to this owner
        #[arg(long)]
        owner: Option<String>,

        /// Maximum number of jobs to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show one job with its per-batch breakdown
    Show {
        job_id: Uuid,

        /// Emit machine-readable JSON instead of the summary
        #[arg(long)]
        json: bool,
    },

    /// Release claims orphaned by a crashed run
    Resume { job_id: Uuid },

    /// Re-arm the failed batches of a failed job
    Retry { job_id: Uuid },

    /// Cancel a job
    Cancel { job_id: Uuid },

    /// Purge terminal jobs older than a cutoff
    Clean {
        /// Age cutoff in days
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let database_url = match &cli.db {
        Some(url) => url.clone(),
        None => std::env::var("PIPELINE_DB")
            .context("no database given: pass --db or set PIPELINE_DB")?,
    };

    let store = SqliteJobStore::new(&database_url)
        .await
        .with_context(|| format!("failed to open job store at {database_url}"))?;

    match cli.command {
        Command::List {
            status,
            owner,
            limit,
        } => list(&store, status, owner, limit).await,
        Command::Show { job_id, json } => show(&store, job_id, json).await,
        Command::Resume { job_id } => resume(&store, job_id).await,
        Command::Retry { job_id } => retry(&store, job_id).await,
        Command::Cancel { job_id } => cancel(&store, job_id).await,
        Command::Clean { days } => clean(&store, days).await,
    }
}

async fn list(
    store: &SqliteJobStore,
    status: Option<String>,
    owner: Option<String>,
    limit: usize,
) -> Result<()> {
    let mut filter = JobFilter::all().with_limit(limit);
    if let Some(raw) = status {
        let status = JobStatus::parse(&raw)
            .with_context(|| format!("unknown status {raw:?}"))?;
        filter = filter.with_status(status);
    }
    if let Some(owner) = owner {
        filter = filter.for_owner(owner);
    }

    let jobs = store.list_jobs(&filter).await?;
    if jobs.is_empty() {
        println!("no jobs");
        return Ok(());
    }

    println!(
        "{:<36}  {:<10}  {:<7}  {:<20}  {}",
        "ID", "STATUS", "BATCHES", "CREATED", "OWNER"
    );
    for job in jobs {
        println!(
            "{:<36}  {:<10}  {:<7}  {:<20}  {}",
            job.id,
            job.status,
            job.total_batches,
            job.created_at.format("%Y-%m-%d %H:%M:%S"),
            job.owner
        );
    }
    Ok(())
}

async fn show(store: &SqliteJobStore, job_id: Uuid, json: bool) -> Result<()> {
    let job = store
        .get_job(job_id)
        .await?
        .with_context(|| format!("job {job_id} not found"))?;
    let batches = store.batches_for_job(job_id).await?;

    if json {
        let doc = serde_json::json!({ "job": job, "batches": batches });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    print_summary(&job, &batches);
    Ok(())
}

fn print_summary(job: &Job, batches: &[Batch]) {
    println!("job      {}", job.id);
    println!("owner    {}", job.owner);
    println!("status   {}", job.status);
    println!("created  {}", job.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("input    {}", job.input_ref);
    if let Some(artifact) = &job.final_artifact_ref {
        println!("artifact {artifact}");
    }
    if let Some(error) = &job.error {
        println!("error    {error}");
    }

    let count = |status: BatchStatus| batches.iter().filter(|b| b.status == status).count();
    println!(
        "batches  {} total: {} completed, {} pending, {} claimed, {} failed",
        batches.len(),
        count(BatchStatus::Completed),
        count(BatchStatus::Pending),
        count(BatchStatus::Claimed),
        count(BatchStatus::Failed),
    );

    for batch in batches.iter().filter(|b| b.status == BatchStatus::Failed) {
        println!(
            "  batch {:>4}  attempts {}  {}",
            batch.index,
            batch.attempt_count,
            batch.last_error.as_deref().unwrap_or("unknown error")
        );
    }
}

async fn resume(store: &SqliteJobStore, job_id: Uuid) -> Result<()> {
    let job = store
        .get_job(job_id)
        .await?
        .with_context(|| format!("job {job_id} not found"))?;
    if job.status.is_terminal() {
        bail!("job {job_id} is {}; nothing to resume", job.status);
    }

    let released = store.release_claims(job_id).await?;
    let outstanding = store.outstanding_batches(job_id).await?;
    println!(
        "released {released} orphaned claim(s); {} batch(es) outstanding",
        outstanding.len()
    );
    Ok(())
}

async fn retry(store: &SqliteJobStore, job_id: Uuid) -> Result<()> {
    store
        .reopen_job(job_id)
        .await
        .context("only failed jobs can be retried")?;
    let reset = store.reset_failed_batches(job_id).await?;
    println!("re-armed {reset} failed batch(es); job is running again");
    Ok(())
}

async fn cancel(store: &SqliteJobStore, job_id: Uuid) -> Result<()> {
    store.update_job_status(job_id, JobStatus::Cancelled).await?;
    println!("cancelled job {job_id}");
    Ok(())
}

async fn clean(store: &SqliteJobStore, days: i64) -> Result<()> {
    let cutoff = Utc::now() - Duration::days(days);
    let purged = store.purge_jobs_before(cutoff).await?;
    println!("purged {purged} terminal job(s) older than {days} day(s)");
    Ok(())
}
