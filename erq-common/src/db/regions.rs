//! Health region registry (Québec RSS)

use crate::canon::canonicalize;
use crate::models::Region;
use crate::Result;
use sqlx::{Row, SqlitePool};
use tracing::info;

/// The 18 réseaux locaux de services regions, by RSS code
pub const RSS_REGIONS: [(&str, &str); 18] = [
    ("01", "Bas-Saint-Laurent"),
    ("02", "Saguenay-Lac-Saint-Jean"),
    ("03", "Capitale-Nationale"),
    ("04", "Mauricie et Centre-du-Québec"),
    ("05", "Estrie"),
    ("06", "Montréal"),
    ("07", "Outaouais"),
    ("08", "Abitibi-Témiscamingue"),
    ("09", "Côte-Nord"),
    ("10", "Nord-du-Québec"),
    ("11", "Gaspésie-Îles-de-la-Madeleine"),
    ("12", "Chaudière-Appalaches"),
    ("13", "Laval"),
    ("14", "Lanaudière"),
    ("15", "Laurentides"),
    ("16", "Montérégie"),
    ("17", "Nunavik"),
    ("18", "Terres-Cries-de-la-Baie-James"),
];

/// Insert missing regions; returns how many were added
pub async fn seed_regions(pool: &SqlitePool) -> Result<usize> {
    let mut tx = pool.begin().await?;
    let mut added = 0;

    for (code, name) in RSS_REGIONS {
        let result = sqlx::query(
            "INSERT INTO regions (code, name, name_key) VALUES (?, ?, ?) ON CONFLICT(code) DO NOTHING",
        )
        .bind(code)
        .bind(name)
        .bind(canonicalize(name))
        .execute(&mut *tx)
        .await?;
        added += result.rows_affected() as usize;
    }

    tx.commit().await?;

    if added > 0 {
        info!(added, "Seeded health regions");
    }
    Ok(added)
}

pub async fn load_regions(pool: &SqlitePool) -> Result<Vec<Region>> {
    let rows = sqlx::query("SELECT code, name, name_key FROM regions ORDER BY code")
        .fetch_all(pool)
        .await?;

    Ok(rows
        .into_iter()
        .map(|row| Region {
            code: row.get("code"),
            name: row.get("name"),
            name_key: row.get("name_key"),
        })
        .collect())
}

/// Region code for an extract value such as "06", "6" or "RSS06"
pub fn normalize_region_code(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.parse::<u8>() {
        Ok(n) if (1..=18).contains(&n) => Some(format!("{n:02}")),
        _ => None,
    }
}
