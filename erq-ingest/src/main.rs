//! erq-ingest - emergency-room occupancy ingestion
//!
//! Fetches the hourly MSSS extract, historizes every row and refreshes the
//! current occupancy snapshot of each facility.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use erq_common::config::{config_file_path, load_toml_config, RootFolderInitializer, RootFolderResolver};
use erq_ingest::db::IngestStore;
use erq_ingest::models::CycleOutcome;
use erq_ingest::services::facility_directory::backfill_locations;
use erq_ingest::services::{run_schedule, FacilityDirectory};
use erq_ingest::IngestContext;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Command-line arguments for erq-ingest
#[derive(Parser, Debug)]
#[command(name = "erq-ingest")]
#[command(about = "Emergency-room occupancy ingestion")]
#[command(version)]
struct Args {
    /// TOML config file
    #[arg(short, long, env = "ERQ_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Root folder holding the database
    #[arg(short, long, env = "ERQ_ROOT_FOLDER", global = true)]
    root_folder: Option<PathBuf>,

    /// Override `source.location` (URL or file path)
    #[arg(long, global = true)]
    source: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a single ingestion cycle
    RunOnce,
    /// Run cycles on a fixed interval until interrupted
    Schedule {
        /// Override `ingest.interval_secs`
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Show the source lease and recent cycles
    LeaseStatus {
        #[arg(long, default_value = "5")]
        cycles: i64,
    },
    /// Insert the health regions if missing
    SeedRegions,
    /// Give coordinates to facilities created without them
    BackfillLocations {
        /// Facility reference CSV; defaults to `source.facility_directory`
        #[arg(long)]
        directory: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = config_file_path(args.config.as_deref());
    let mut config = load_toml_config(config_path.as_deref()).context("Failed to load configuration")?;
    if let Some(source) = args.source.clone() {
        config.source.location = source;
    }

    erq_common::logging::init(&erq_common::logging::directive_for("erq_ingest", &config.logging.level));
    info!("Starting erq-ingest {}", env!("CARGO_PKG_VERSION"));

    let root_folder = RootFolderResolver::new("erq-ingest")
        .with_cli_arg(args.root_folder.clone())
        .with_toml(&config)
        .resolve();
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory()
        .context("Failed to initialize root folder")?;

    let db_path = initializer.database_path();
    let db = erq_common::db::init::init_database(&db_path)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;
    let ctx = IngestContext::new(config, db);

    match args.command {
        Command::RunOnce => run_once(&ctx).await,
        Command::Schedule { interval_secs } => schedule(&ctx, interval_secs).await,
        Command::LeaseStatus { cycles } => lease_status(&ctx, cycles).await,
        Command::SeedRegions => {
            let added = erq_common::db::regions::seed_regions(&ctx.db).await?;
            println!("{added} regions added");
            Ok(())
        }
        Command::BackfillLocations { directory } => backfill(&ctx, directory).await,
    }
}

async fn run_once(ctx: &IngestContext) -> Result<()> {
    erq_common::db::regions::seed_regions(&ctx.db)
        .await
        .context("Failed to seed regions")?;
    let orchestrator = ctx.orchestrator().context("Failed to build orchestrator")?;
    match orchestrator.run_cycle().await.context("Ingestion cycle failed")? {
        CycleOutcome::Committed(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        CycleOutcome::Skipped => {
            println!("skipped: another cycle holds the lease for {}", orchestrator.settings().source_name);
        }
    }
    Ok(())
}

async fn schedule(ctx: &IngestContext, interval_secs: Option<u64>) -> Result<()> {
    erq_common::db::regions::seed_regions(&ctx.db)
        .await
        .context("Failed to seed regions")?;
    let orchestrator = Arc::new(ctx.orchestrator().context("Failed to build orchestrator")?);
    let every = Duration::from_secs(interval_secs.unwrap_or(ctx.config.ingest.interval_secs).max(1));

    let cancel = CancellationToken::new();
    let scheduler = tokio::spawn(run_schedule(orchestrator, every, cancel.clone()));

    shutdown_signal().await;
    cancel.cancel();
    scheduler.await.context("Scheduler task failed")?;

    info!("Scheduler shutdown complete");
    Ok(())
}

async fn lease_status(ctx: &IngestContext, cycles: i64) -> Result<()> {
    let store = ctx.store();
    let source = &ctx.config.source.name;

    match store.lease(source).await? {
        Some(lease) if lease.is_active(chrono::Utc::now()) => println!(
            "{source}: held by {} since {} (expires {})",
            lease.holder,
            erq_common::time::to_db(&lease.acquired_at),
            erq_common::time::to_db(&lease.expires_at)
        ),
        Some(lease) => println!("{source}: free (expired lease of {})", lease.holder),
        None => println!("{source}: free"),
    }

    for cycle in store.recent_cycles(source, cycles).await? {
        println!(
            "{}  {}  {:<15}  parsed={} valid={} quarantined={} stale={} rejected={}{}",
            erq_common::time::to_db(&cycle.started_at),
            cycle.id,
            cycle.status.as_str(),
            cycle.rows_parsed,
            cycle.rows_valid,
            cycle.rows_quarantined,
            cycle.rows_stale,
            cycle.rows_rejected,
            cycle.error.map(|e| format!("  error: {e}")).unwrap_or_default()
        );
    }
    Ok(())
}

async fn backfill(ctx: &IngestContext, directory: Option<PathBuf>) -> Result<()> {
    let path = directory
        .or_else(|| ctx.config.source.facility_directory.clone())
        .context("No facility directory given (--directory or source.facility_directory)")?;
    let directory = FacilityDirectory::from_path(&path)
        .with_context(|| format!("Failed to read facility directory {}", path.display()))?;
    let updated = backfill_locations(&ctx.db, &directory).await?;
    println!("{updated} facilities located");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
