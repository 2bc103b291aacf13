//! Duplicate index statistics.
//!
//! Used by `docsift stats` to show how many similarity clusters have been
//! recorded and over what period.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

/// Snapshot of the `duplicate_records` table.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexStats {
    pub records: i64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

pub async fn collect(pool: &SqlitePool) -> Result<IndexStats> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS records, MIN(first_seen) AS oldest, MAX(first_seen) AS newest FROM duplicate_records",
    )
    .fetch_one(pool)
    .await
    .context("Failed to read duplicate_records (has `docsift init` been run?)")?;

    let millis = |col: &str| -> Result<Option<DateTime<Utc>>> {
        let value: Option<i64> = row.try_get(col)?;
        Ok(value.and_then(DateTime::<Utc>::from_timestamp_millis))
    };

    Ok(IndexStats {
        records: row.try_get("records")?,
        oldest: millis("oldest")?,
        newest: millis("newest")?,
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = collect(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("docsift — Duplicate Index");
    println!("=========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Threshold:   {} bits", config.index.similarity_threshold);
    println!();
    println!("  Records:     {}", stats.records);
    println!("  Oldest:      {}", format_ts(stats.oldest));
    println!("  Newest:      {}", format_ts(stats.newest));
    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_ts(ts: Option<DateTime<Utc>>) -> String {
    match ts {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => "-".to_string(),
    }
}
