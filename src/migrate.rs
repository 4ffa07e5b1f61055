//! Database schema migrations (idempotent).
//!
//! Four base relations hold the normalized sources. The aggregate view is
//! stored as versioned snapshots: `aggregate_records` and `aggregate_fts`
//! carry a `version` column, and the single row of `aggregate_current`
//! names the version readers should see.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Entities; parent_place_id is a soft self reference cleaned up by the loader
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS places (
            place_id TEXT PRIMARY KEY,
            display_name TEXT,
            lat REAL,
            long REAL,
            pop_estimate_2022 INTEGER,
            state_abbr TEXT,
            county_fips TEXT,
            geoid TEXT,
            parent_place_id TEXT,
            address TEXT,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS contacts (
            id TEXT PRIMARY KEY,
            place_id TEXT,
            first_name TEXT,
            last_name TEXT,
            emails TEXT,
            phone TEXT,
            title TEXT,
            department TEXT,
            created_at TEXT,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (place_id) REFERENCES places(place_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tech_tags (
            id TEXT PRIMARY KEY,
            place_id TEXT NOT NULL,
            name TEXT NOT NULL,
            category TEXT,
            FOREIGN KEY (place_id) REFERENCES places(place_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Historical rows are kept; the aggregate picks the latest per (customer, place_id)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS customer_mappings (
            customer TEXT NOT NULL CHECK (customer IN ('a', 'b')),
            external_id TEXT NOT NULL,
            place_id TEXT NOT NULL,
            seen_at INTEGER NOT NULL,
            seen_seq INTEGER NOT NULL,
            PRIMARY KEY (customer, external_id, place_id),
            FOREIGN KEY (place_id) REFERENCES places(place_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One row per reserved version: 'building' until published, 'failed'
    // once discarded
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS aggregate_snapshots (
            version INTEGER PRIMARY KEY,
            built_at INTEGER NOT NULL,
            record_count INTEGER NOT NULL,
            state TEXT NOT NULL DEFAULT 'published'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS aggregate_current (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS aggregate_records (
            version INTEGER NOT NULL,
            contact_id TEXT NOT NULL,
            emails TEXT,
            title TEXT,
            display_name TEXT,
            population INTEGER,
            lat REAL,
            long REAL,
            tech_names TEXT NOT NULL DEFAULT '',
            customer_a_id TEXT,
            customer_b_id TEXT,
            document TEXT NOT NULL DEFAULT '',
            PRIMARY KEY (version, contact_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='aggregate_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE aggregate_fts USING fts5(
                version UNINDEXED,
                contact_id UNINDEXED,
                document
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_contacts_place_id ON contacts(place_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tech_tags_place_id ON tech_tags(place_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_customer_mappings_place ON customer_mappings(customer, place_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_places_parent ON places(parent_place_id)")
        .execute(pool)
        .await?;

    Ok(())
}
