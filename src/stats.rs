//! Database statistics and health overview.
//!
//! Summarizes what the pipeline has loaded: base-relation counts, contacts
//! without an entity, mapping coverage per customer, and the published
//! aggregate snapshot. Used by `civic stats` after a pipeline run.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::aggregate::{current_snapshot, SnapshotInfo};
use crate::config::Config;
use crate::db;

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub places: i64,
    pub contacts: i64,
    pub contacts_without_place: i64,
    pub tech_tags: i64,
    pub mappings: Vec<MappingStats>,
    #[serde(skip)]
    pub snapshot: Option<SnapshotInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MappingStats {
    pub customer: String,
    pub rows: i64,
    pub places: i64,
}

pub async fn collect_stats(pool: &SqlitePool) -> Result<Stats> {
    let places: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM places")
        .fetch_one(pool)
        .await?;
    let contacts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM contacts")
        .fetch_one(pool)
        .await?;
    let contacts_without_place: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM contacts WHERE place_id IS NULL")
            .fetch_one(pool)
            .await?;
    let tech_tags: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tech_tags")
        .fetch_one(pool)
        .await?;

    let mapping_rows = sqlx::query(
        r#"
        SELECT customer, COUNT(*) AS row_count, COUNT(DISTINCT place_id) AS place_count
        FROM customer_mappings
        GROUP BY customer
        ORDER BY customer
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mappings = mapping_rows
        .iter()
        .map(|row| MappingStats {
            customer: row.get("customer"),
            rows: row.get("row_count"),
            places: row.get("place_count"),
        })
        .collect();

    let snapshot = current_snapshot(pool).await?;

    Ok(Stats {
        places,
        contacts,
        contacts_without_place,
        tech_tags,
        mappings,
        snapshot,
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = collect_stats(&pool).await?;
    pool.close().await;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Civic Search: Database Stats");
    println!("============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Places:      {}", stats.places);
    println!(
        "  Contacts:    {} ({} without entity)",
        stats.contacts, stats.contacts_without_place
    );
    println!("  Tech tags:   {}", stats.tech_tags);

    if !stats.mappings.is_empty() {
        println!();
        println!("  Customer mappings:");
        println!("  {:<10} {:>8} {:>8}", "CUSTOMER", "ROWS", "PLACES");
        println!("  {}", "-".repeat(28));
        for m in &stats.mappings {
            println!("  {:<10} {:>8} {:>8}", m.customer, m.rows, m.places);
        }
    }

    println!();
    match stats.snapshot {
        Some(ref snap) => {
            println!("  Snapshot:    v{}", snap.version);
            println!("  Records:     {}", snap.record_count);
            println!("  Built:       {}", format_ts_relative(snap.built_at));
        }
        None => println!("  Snapshot:    none (run `civic pipeline` or `civic rebuild`)"),
    }
    println!();

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

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
