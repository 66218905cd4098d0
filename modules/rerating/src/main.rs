use anyhow::Context;
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::Instrument;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use rerating_rs::{
    config::Config,
    db,
    job::{run_job, BatchJob, JobReport},
    rating::HttpRatingEngine,
    services::view_builder::drop_graph_views,
    RatingCancellationJob, RerateDispatcherJob,
};

#[derive(Debug, Parser)]
#[command(name = "rerating-rs", about = "Rating cancellation and mass rerating")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Cancel rated artifacts of TO_RERATE wallet operations
    Cancel,
    /// Submit TO_RERATE wallet operations to the rating engine
    Dispatch,
    /// Cancel, then dispatch
    Run,
    /// Drop graph views kept by an interrupted run
    DropViews,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match run(cli.command).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            tracing::error!(error = ?e, "Rerating run failed");
            ExitCode::FAILURE
        }
    }
}

/// Returns `Ok(false)` when a job failed items or stopped early
async fn run(command: Command) -> anyhow::Result<bool> {
    let config = Config::from_env()
        .map_err(anyhow::Error::msg)
        .context("Failed to load configuration from environment")?;

    tracing::info!(
        workers = config.rerate.workers,
        max_units_per_tx = config.rerate.max_units_per_tx,
        view_prefix = config.rerate.views.prefix(),
        allow_billed_items = config.rerate.allow_billed_items,
        "Configuration loaded"
    );

    let pool = db::init_pool(&config.database_url, config.rerate.workers)
        .await
        .context("Failed to connect to database")?;

    match command {
        Command::Cancel => Ok(cancel(&config, pool).await?.is_complete()),
        Command::Dispatch => Ok(dispatch(&config, pool).await?.is_complete()),
        Command::Run => {
            let cancelled = cancel(&config, pool.clone()).await?;
            if !cancelled.is_complete() {
                tracing::warn!(
                    failed = cancelled.failed,
                    stopped_early = cancelled.stopped_early,
                    "Cancellation did not complete, dispatch skipped"
                );
                return Ok(false);
            }
            Ok(dispatch(&config, pool).await?.is_complete())
        }
        Command::DropViews => {
            drop_graph_views(&pool, &config.rerate.views).await?;
            Ok(true)
        }
    }
}

async fn cancel(config: &Config, pool: sqlx::PgPool) -> anyhow::Result<JobReport> {
    let job = Arc::new(RatingCancellationJob::new(pool, config.rerate.clone()));
    execute(job, config).await
}

async fn dispatch(config: &Config, pool: sqlx::PgPool) -> anyhow::Result<JobReport> {
    let url = config
        .rating_engine_url
        .as_deref()
        .context("RATING_ENGINE_URL must be set to dispatch")?;
    let engine = Arc::new(HttpRatingEngine::new(url)?);

    let job = Arc::new(RerateDispatcherJob::new(
        pool,
        engine,
        config.rerate.clone(),
        config.dispatch.clone(),
    ));
    execute(job, config).await
}

async fn execute<J: BatchJob>(job: Arc<J>, config: &Config) -> anyhow::Result<JobReport> {
    let run_id = Uuid::new_v4();
    let span = tracing::info_span!("job_run", job = job.name(), run_id = %run_id);

    let report: JobReport = run_job(job, config.rerate.workers, config.limits.clone())
        .instrument(span)
        .await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(report)
}
