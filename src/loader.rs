//! Chunked, idempotent upserts into the base relations.
//!
//! Every relation is written with `INSERT ... ON CONFLICT DO UPDATE` keyed
//! by its natural key, so re-running a batch (or an overlapping one) never
//! duplicates rows. Batches are split into fixed-size chunks, each in its
//! own transaction; a failed chunk is reported and does not undo the chunks
//! committed before it.
//!
//! Rows that reference an unknown `place_id` are reported as
//! [`ReferentialError`]s. Tech tags and customer mappings are rejected;
//! contacts are kept with a null `place_id` so they still reach the
//! aggregate view.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::config::LoaderConfig;
use crate::error::{ReferentialError, RowError, RowRejection, ValidationError};
use crate::models::{Contact, CustomerMapping, Place, TechTag};
use crate::progress::{ProgressEvent, ProgressReporter};

/// A normalized row that knows how to upsert itself.
#[async_trait]
pub trait Upsert: Send + Sync + 'static {
    /// Target relation name, used in reports.
    const RELATION: &'static str;

    /// Whether an unknown `place_id` is cleared (row kept) instead of
    /// rejecting the row.
    const DETACHABLE: bool = false;

    /// Natural key, used to identify the row in reports.
    fn key(&self) -> String;

    /// The entity this row points at, if any.
    fn place_id(&self) -> Option<&str>;

    /// Drop the entity reference. Only called when [`Upsert::DETACHABLE`].
    fn detach_place(&mut self) {}

    async fn upsert(&self, conn: &mut SqliteConnection, now: i64) -> sqlx::Result<()>;
}

#[async_trait]
impl Upsert for Place {
    const RELATION: &'static str = "places";

    fn key(&self) -> String {
        self.place_id.clone()
    }

    fn place_id(&self) -> Option<&str> {
        None
    }

    async fn upsert(&self, conn: &mut SqliteConnection, now: i64) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO places (place_id, display_name, lat, long, pop_estimate_2022,
                                state_abbr, county_fips, geoid, parent_place_id, address, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(place_id) DO UPDATE SET
                display_name = excluded.display_name,
                lat = excluded.lat,
                long = excluded.long,
                pop_estimate_2022 = excluded.pop_estimate_2022,
                state_abbr = excluded.state_abbr,
                county_fips = excluded.county_fips,
                geoid = excluded.geoid,
                parent_place_id = excluded.parent_place_id,
                address = excluded.address,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&self.place_id)
        .bind(&self.display_name)
        .bind(self.lat)
        .bind(self.long)
        .bind(self.pop_estimate_2022)
        .bind(&self.state_abbr)
        .bind(&self.county_fips)
        .bind(&self.geoid)
        .bind(&self.parent_place_id)
        .bind(&self.address)
        .bind(now)
        .execute(conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Upsert for Contact {
    const RELATION: &'static str = "contacts";
    const DETACHABLE: bool = true;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn place_id(&self) -> Option<&str> {
        self.place_id.as_deref()
    }

    fn detach_place(&mut self) {
        self.place_id = None;
    }

    async fn upsert(&self, conn: &mut SqliteConnection, now: i64) -> sqlx::Result<()> {
        let created_at = self
            .created_at
            .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string());

        sqlx::query(
            r#"
            INSERT INTO contacts (id, place_id, first_name, last_name, emails, phone,
                                  title, department, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                place_id = excluded.place_id,
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                emails = excluded.emails,
                phone = excluded.phone,
                title = excluded.title,
                department = excluded.department,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&self.id)
        .bind(&self.place_id)
        .bind(&self.first_name)
        .bind(&self.last_name)
        .bind(&self.emails)
        .bind(&self.phone)
        .bind(&self.title)
        .bind(&self.department)
        .bind(created_at)
        .bind(now)
        .execute(conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Upsert for TechTag {
    const RELATION: &'static str = "tech_tags";

    fn key(&self) -> String {
        self.id.clone()
    }

    fn place_id(&self) -> Option<&str> {
        Some(self.place_id.as_str())
    }

    async fn upsert(&self, conn: &mut SqliteConnection, _now: i64) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tech_tags (id, place_id, name, category) VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                place_id = excluded.place_id,
                name = excluded.name,
                category = excluded.category
            "#,
        )
        .bind(&self.id)
        .bind(&self.place_id)
        .bind(&self.name)
        .bind(&self.category)
        .execute(conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Upsert for CustomerMapping {
    const RELATION: &'static str = "customer_mappings";

    fn key(&self) -> String {
        format!("{}:{}", self.customer.key(), self.external_id)
    }

    fn place_id(&self) -> Option<&str> {
        Some(self.place_id.as_str())
    }

    async fn upsert(&self, conn: &mut SqliteConnection, now: i64) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO customer_mappings (customer, external_id, place_id, seen_at, seen_seq)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(customer, external_id, place_id) DO UPDATE SET
                seen_at = excluded.seen_at,
                seen_seq = excluded.seen_seq
            "#,
        )
        .bind(self.customer.key())
        .bind(&self.external_id)
        .bind(&self.place_id)
        .bind(now)
        .bind(self.seen_seq)
        .execute(conn)
        .await?;
        Ok(())
    }
}

/// Outcome of loading one batch into one relation.
#[derive(Debug, Clone)]
pub struct LoadSummary {
    pub relation: &'static str,
    /// Rows written (including detached contacts).
    pub accepted: usize,
    pub rejected: usize,
    /// Rows written with their entity reference cleared.
    pub detached: usize,
    pub failed_chunks: Vec<usize>,
    pub rejections: Vec<RowRejection>,
}

impl LoadSummary {
    fn new(relation: &'static str) -> Self {
        Self {
            relation,
            accepted: 0,
            rejected: 0,
            detached: 0,
            failed_chunks: Vec::new(),
            rejections: Vec::new(),
        }
    }
}

struct ChunkOutcome {
    accepted: usize,
    detached: usize,
    rejections: Vec<RowRejection>,
    failure: Option<String>,
}

/// Writes normalized batches into the base relations.
pub struct Loader<'a> {
    pool: SqlitePool,
    chunk_size: usize,
    parallelism: usize,
    /// Timestamp shared by every row written in this run.
    run_at: i64,
    progress: &'a dyn ProgressReporter,
}

impl<'a> Loader<'a> {
    pub fn new(pool: SqlitePool, config: &LoaderConfig, progress: &'a dyn ProgressReporter) -> Self {
        Self {
            pool,
            chunk_size: config.chunk_size.max(1),
            parallelism: config.parallelism.max(1),
            run_at: chrono::Utc::now().timestamp_millis(),
            progress,
        }
    }

    /// Upsert `records` into `T::RELATION` in chunks.
    ///
    /// Row-level problems end up in the summary. Only failing to read the
    /// set of known entities aborts the load.
    pub async fn load<T: Upsert>(&self, records: Vec<T>) -> Result<LoadSummary> {
        let mut summary = LoadSummary::new(T::RELATION);
        let total = records.len() as u64;

        let known_places = Arc::new(self.known_places().await?);

        let mut pending: VecDeque<(usize, Vec<String>, tokio::task::JoinHandle<ChunkOutcome>)> =
            VecDeque::new();
        let mut outcomes: Vec<(usize, Vec<String>, Result<ChunkOutcome, String>)> = Vec::new();
        let mut done = 0u64;

        let mut iter = records.into_iter();
        let mut index = 0usize;
        loop {
            let chunk: Vec<T> = iter.by_ref().take(self.chunk_size).collect();
            if chunk.is_empty() {
                break;
            }

            if pending.len() >= self.parallelism {
                if let Some((i, keys, handle)) = pending.pop_front() {
                    done += keys.len() as u64;
                    outcomes.push((i, keys, handle.await.map_err(|e| e.to_string())));
                    self.report::<T>(done, total);
                }
            }

            let keys: Vec<String> = chunk.iter().map(|r| r.key()).collect();
            let handle = tokio::spawn(upsert_chunk(
                self.pool.clone(),
                chunk,
                Arc::clone(&known_places),
                self.run_at,
            ));
            pending.push_back((index, keys, handle));
            index += 1;
        }

        while let Some((i, keys, handle)) = pending.pop_front() {
            done += keys.len() as u64;
            outcomes.push((i, keys, handle.await.map_err(|e| e.to_string())));
            self.report::<T>(done, total);
        }

        outcomes.sort_by_key(|(i, _, _)| *i);
        for (i, keys, outcome) in outcomes {
            let failure = match outcome {
                Ok(ChunkOutcome {
                    failure: Some(msg), ..
                }) => msg,
                Err(msg) => msg,
                Ok(chunk) => {
                    summary.accepted += chunk.accepted;
                    summary.detached += chunk.detached;
                    summary.rejected += keys.len() - chunk.accepted;
                    summary.rejections.extend(chunk.rejections);
                    continue;
                }
            };

            tracing::error!(relation = T::RELATION, chunk = i, error = %failure, "chunk failed");
            summary.failed_chunks.push(i);
            summary.rejected += keys.len();
            summary
                .rejections
                .extend(keys.into_iter().map(|k| {
                    RowRejection::for_key(
                        k,
                        RowError::ChunkFailed {
                            chunk: i,
                            message: failure.clone(),
                        },
                    )
                }));
        }

        tracing::info!(
            relation = T::RELATION,
            accepted = summary.accepted,
            rejected = summary.rejected,
            detached = summary.detached,
            failed_chunks = summary.failed_chunks.len(),
            "loaded relation"
        );

        Ok(summary)
    }

    /// Load entities, then repair the parent references so the
    /// `parent_place_id` relation stays a forest of existing entities.
    pub async fn load_places(&self, records: Vec<Place>) -> Result<LoadSummary> {
        let mut summary = self.load(records).await?;
        let repairs = repair_parent_links(&self.pool).await?;
        summary.detached += repairs.len();
        summary.rejections.extend(repairs);
        Ok(summary)
    }

    async fn known_places(&self) -> Result<HashSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT place_id FROM places")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }

    fn report<T: Upsert>(&self, n: u64, total: u64) {
        self.progress.report(ProgressEvent::Loading {
            relation: T::RELATION.to_string(),
            n,
            total,
        });
    }
}

async fn upsert_chunk<T: Upsert>(
    pool: SqlitePool,
    mut rows: Vec<T>,
    known_places: Arc<HashSet<String>>,
    now: i64,
) -> ChunkOutcome {
    let mut outcome = ChunkOutcome {
        accepted: 0,
        detached: 0,
        rejections: Vec::new(),
        failure: None,
    };

    let mut tx = match pool.begin().await {
        Ok(tx) => tx,
        Err(e) => {
            outcome.failure = Some(e.to_string());
            return outcome;
        }
    };

    for row in rows.iter_mut() {
        if let Some(place_id) = row.place_id() {
            if !known_places.contains(place_id) {
                let err = ReferentialError {
                    relation: T::RELATION.to_string(),
                    key: row.key(),
                    place_id: place_id.to_string(),
                };
                outcome.rejections.push(RowRejection::for_key(row.key(), err));
                if !T::DETACHABLE {
                    continue;
                }
                row.detach_place();
                outcome.detached += 1;
            }
        }

        // A failed statement only rolls back itself; the chunk continues
        match row.upsert(&mut *tx, now).await {
            Ok(()) => outcome.accepted += 1,
            Err(e) => outcome
                .rejections
                .push(RowRejection::for_key(row.key(), RowError::Database(e.to_string()))),
        }
    }

    if let Err(e) = tx.commit().await {
        outcome.failure = Some(e.to_string());
    }
    outcome
}

/// Clear parent references to missing entities and break parent cycles.
/// Returns one rejection per repaired entity.
async fn repair_parent_links(pool: &SqlitePool) -> Result<Vec<RowRejection>> {
    let mut tx = pool.begin().await?;
    let mut repairs = Vec::new();

    let dangling = sqlx::query(
        r#"
        SELECT place_id, parent_place_id FROM places
        WHERE parent_place_id IS NOT NULL
          AND parent_place_id NOT IN (SELECT place_id FROM places)
        "#,
    )
    .fetch_all(&mut *tx)
    .await?;

    for row in &dangling {
        let place_id: String = row.get("place_id");
        let parent: String = row.get("parent_place_id");
        repairs.push(RowRejection::for_key(
            place_id.clone(),
            ReferentialError {
                relation: "places".to_string(),
                key: place_id,
                place_id: parent,
            },
        ));
    }
    sqlx::query(
        r#"
        UPDATE places SET parent_place_id = NULL
        WHERE parent_place_id IS NOT NULL
          AND parent_place_id NOT IN (SELECT place_id FROM places)
        "#,
    )
    .execute(&mut *tx)
    .await?;

    let links = sqlx::query(
        "SELECT place_id, parent_place_id FROM places WHERE parent_place_id IS NOT NULL",
    )
    .fetch_all(&mut *tx)
    .await?;
    let parents: HashMap<String, String> = links
        .iter()
        .map(|r| (r.get("place_id"), r.get("parent_place_id")))
        .collect();

    for place_id in break_parent_cycles(&parents) {
        sqlx::query("UPDATE places SET parent_place_id = NULL WHERE place_id = ?")
            .bind(&place_id)
            .execute(&mut *tx)
            .await?;
        repairs.push(RowRejection::for_key(
            place_id,
            ValidationError::new("parent_place_id", "parent chain forms a cycle"),
        ));
    }

    tx.commit().await?;

    if !repairs.is_empty() {
        tracing::warn!(count = repairs.len(), "cleared invalid parent_place_id links");
    }
    Ok(repairs)
}

/// Pick one entity per parent cycle whose link must be cut: the smallest
/// `place_id` on the cycle. Output is sorted.
pub fn break_parent_cycles(parents: &HashMap<String, String>) -> Vec<String> {
    // 0 = unvisited, 1 = on current path, 2 = finished
    let mut state: HashMap<&str, u8> = HashMap::new();
    let mut cut: Vec<String> = Vec::new();

    let mut starts: Vec<&str> = parents.keys().map(String::as_str).collect();
    starts.sort_unstable();

    for start in starts {
        let mut path: Vec<&str> = Vec::new();
        let mut node = Some(start);

        while let Some(current) = node {
            match state.get(current).copied().unwrap_or(0) {
                2 => break,
                1 => {
                    if let Some(pos) = path.iter().position(|p| *p == current) {
                        if let Some(min) = path[pos..].iter().min() {
                            cut.push(min.to_string());
                        }
                    }
                    break;
                }
                _ => {
                    state.insert(current, 1);
                    path.push(current);
                    node = parents.get(current).map(String::as_str);
                }
            }
        }

        for p in path {
            state.insert(p, 2);
        }
    }

    cut.sort();
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    fn links(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    #[test]
    fn forest_has_no_cycles() {
        let parents = links(&[("city", "county"), ("county", "state"), ("town", "county")]);
        assert!(break_parent_cycles(&parents).is_empty());
    }

    #[test]
    fn two_cycle_cut_once() {
        let parents = links(&[("a", "b"), ("b", "a"), ("c", "a")]);
        assert_eq!(break_parent_cycles(&parents), vec!["a".to_string()]);
    }

    #[test]
    fn separate_cycles_each_cut() {
        let parents = links(&[("x", "y"), ("y", "z"), ("z", "x"), ("m", "n"), ("n", "m")]);
        assert_eq!(
            break_parent_cycles(&parents),
            vec!["m".to_string(), "x".to_string()]
        );
    }
}
