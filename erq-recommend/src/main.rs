//! erq-recommend - nearby emergency rooms ranked by occupancy

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use erq_common::config::{config_file_path, load_toml_config, RootFolderInitializer, RootFolderResolver};
use erq_common::geo::GeoPoint;
use erq_recommend::{freshness_window, trends, Origin, RecommendContext};
use tracing::info;
use uuid::Uuid;

/// Command-line arguments for erq-recommend
#[derive(Parser, Debug)]
#[command(name = "erq-recommend")]
#[command(about = "Nearby emergency rooms ranked by occupancy")]
#[command(version)]
struct Args {
    /// TOML config file
    #[arg(short, long, env = "ERQ_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Root folder holding the database
    #[arg(short, long, env = "ERQ_ROOT_FOLDER", global = true)]
    root_folder: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Less congested emergency rooms near a facility or a coordinate
    Nearby {
        /// Origin facility id
        #[arg(long, conflicts_with_all = ["latitude", "longitude"], required_unless_present = "latitude")]
        facility: Option<Uuid>,

        #[arg(long, requires = "longitude", allow_negative_numbers = true)]
        latitude: Option<f64>,

        #[arg(long, requires = "latitude", allow_negative_numbers = true)]
        longitude: Option<f64>,

        /// Override `recommend.default_radius_meters`
        #[arg(long)]
        radius: Option<f64>,

        /// Override `recommend.default_max_results`
        #[arg(long)]
        max: Option<usize>,

        /// Override `recommend.freshness_window_minutes`
        #[arg(long)]
        freshness_minutes: Option<i64>,
    },
    /// Recorded history of one facility
    History {
        facility: Uuid,

        #[arg(long, default_value = "7")]
        days: i64,
    },
    /// Current load per health region
    Regions,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = config_file_path(args.config.as_deref());
    let config = load_toml_config(config_path.as_deref()).context("Failed to load configuration")?;

    erq_common::logging::init(&erq_common::logging::directive_for("erq_recommend", &config.logging.level));
    info!("Starting erq-recommend {}", env!("CARGO_PKG_VERSION"));

    let root_folder = RootFolderResolver::new("erq-recommend")
        .with_cli_arg(args.root_folder.clone())
        .with_toml(&config)
        .resolve();
    let db_path = RootFolderInitializer::new(root_folder).database_path();
    let db = erq_recommend::db::connect_readonly(&db_path)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;
    let ctx = RecommendContext::new(config, db);

    match args.command {
        Command::Nearby {
            facility,
            latitude,
            longitude,
            radius,
            max,
            freshness_minutes,
        } => {
            let origin = match (facility, latitude, longitude) {
                (Some(id), _, _) => Origin::Facility(id),
                (None, Some(lat), Some(lon)) => Origin::Coordinate(GeoPoint::new(lat, lon)?),
                _ => anyhow::bail!("Give --facility or both --latitude and --longitude"),
            };
            let mut query = ctx.query(origin);
            if let Some(radius) = radius {
                query.radius_meters = radius;
            }
            if let Some(max) = max {
                query.max_results = max;
            }
            if let Some(minutes) = freshness_minutes {
                query.freshness_window = freshness_window(minutes)?;
            }
            nearby(&ctx, &query, args.json).await
        }
        Command::History { facility, days } => history(&ctx, facility, days, args.json).await,
        Command::Regions => regions(&ctx, args.json).await,
    }
}

async fn nearby(ctx: &RecommendContext, query: &erq_recommend::RecommendationQuery, json: bool) -> Result<()> {
    let results = ctx.engine().recommend(query).await.context("Recommendation failed")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }
    if results.is_empty() {
        println!("No emergency room with fresh data within {:.0} m", query.radius_meters);
        return Ok(());
    }
    for (rank, r) in results.iter().enumerate() {
        println!(
            "{:>2}. {:<50} {:>6.1} km  {:>5.0}%  ({} min old)  {}",
            rank + 1,
            r.name,
            r.distance_meters / 1000.0,
            r.occupancy_ratio * 100.0,
            r.snapshot_age_seconds / 60,
            r.facility_id
        );
    }
    Ok(())
}

async fn history(ctx: &RecommendContext, facility: Uuid, days: i64, json: bool) -> Result<()> {
    let entries = trends::facility_history(&ctx.db, facility, days, chrono::Utc::now()).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    for e in &entries {
        println!(
            "{}  {:<11}  occupied={:<4} functional={:<4} ratio={:<6} {}",
            e.extracted_at
                .map(|t| erq_common::time::to_db(&t))
                .unwrap_or_else(|| "-".to_string()),
            e.status.as_str(),
            e.metrics.occupied_stretchers.map(|v| v.to_string()).unwrap_or_default(),
            e.metrics.functional_stretchers.map(|v| v.to_string()).unwrap_or_default(),
            e.metrics.occupancy_ratio.map(|v| format!("{v:.2}")).unwrap_or_default(),
            e.reason.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn regions(ctx: &RecommendContext, json: bool) -> Result<()> {
    let stats = trends::region_statistics(&ctx.db).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    for s in &stats {
        println!(
            "{}  {:<45} facilities={:<3} reporting={:<3} mean={:<6} waiting={}",
            s.code,
            s.name,
            s.facilities,
            s.reporting,
            s.mean_occupancy_ratio.map(|v| format!("{v:.2}")).unwrap_or_else(|| "-".to_string()),
            s.patients_waiting
        );
    }
    Ok(())
}
