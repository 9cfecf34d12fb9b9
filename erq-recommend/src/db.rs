//! Read-only database access
//!
//! The recommendation side never writes. Connections are opened read-only
//! on the WAL database, so a query sees the last committed snapshot set and
//! never waits on an ingestion transaction.

use erq_common::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Open an existing database without write access
pub async fn connect_readonly(db_path: &Path) -> Result<SqlitePool> {
    if !db_path.exists() {
        return Err(Error::MissingDatabase(db_path.to_path_buf()));
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .read_only(true)
        .busy_timeout(Duration::from_millis(5000));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    info!("Opened database read-only: {}", db_path.display());
    Ok(pool)
}
