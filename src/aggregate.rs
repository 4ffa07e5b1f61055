//! Aggregate view builder.
//!
//! Rebuilds the denormalized, search-indexed view from the base relations.
//! Each rebuild writes a complete new snapshot version next to the live one
//! (the shadow), then publishes it by swapping the single-row
//! `aggregate_current` pointer inside one transaction. Readers resolve the
//! pointer in the same statement that reads records, so they see either
//! the old or the new snapshot in full. Older versions are pruned after the
//! swap.
//!
//! Versions are reserved up front in `aggregate_snapshots` (`building`), so
//! overlapping rebuilds never share a version and pruning skips versions
//! still in progress. A rebuild that finishes after a newer one was
//! published is discarded.
//!
//! Entity-level data (places, tech names, latest mappings) is held in
//! memory; contacts are streamed in keyset pages.

use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::error::RebuildError;
use crate::models::{AggregateRecord, Customer};
use crate::progress::{ProgressEvent, ProgressReporter};

/// Entity attributes copied onto every contact of that entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaceFacts {
    pub display_name: Option<String>,
    pub population: Option<i64>,
    pub lat: Option<f64>,
    pub long: Option<f64>,
}

/// The contact columns the aggregate needs.
#[derive(Debug, Clone, Default)]
pub struct ContactFacts {
    pub id: String,
    pub place_id: Option<String>,
    pub emails: Option<String>,
    pub title: Option<String>,
}

/// Latest external id per customer for one entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaceMappings {
    pub customer_a_id: Option<String>,
    pub customer_b_id: Option<String>,
}

/// Metadata of a published snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotInfo {
    pub version: i64,
    pub built_at: i64,
    pub record_count: i64,
}

/// The search-token field: lower-cased emails, title and tech names joined
/// by single spaces, blank parts skipped.
pub fn search_document(emails: Option<&str>, title: Option<&str>, tech_names: &str) -> String {
    [emails, title, Some(tech_names)]
        .into_iter()
        .flatten()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Group tech tag names by entity: lower-cased, sorted, repeats dropped,
/// space-joined.
pub fn group_tech_names<I>(tags: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
    for (place_id, name) in tags {
        let name = name.trim().to_lowercase();
        if !name.is_empty() {
            grouped.entry(place_id).or_default().push(name);
        }
    }

    grouped
        .into_iter()
        .map(|(place_id, mut names)| {
            names.sort();
            names.dedup();
            (place_id, names.join(" "))
        })
        .collect()
}

/// Reduce mapping rows, already ordered newest first within each
/// (`customer`, `place_id`), to one external id per customer per entity.
pub fn latest_mappings<I>(rows: I) -> HashMap<String, PlaceMappings>
where
    I: IntoIterator<Item = (Customer, String, String)>,
{
    let mut out: HashMap<String, PlaceMappings> = HashMap::new();
    for (customer, place_id, external_id) in rows {
        let entry = out.entry(place_id).or_default();
        let slot = match customer {
            Customer::A => &mut entry.customer_a_id,
            Customer::B => &mut entry.customer_b_id,
        };
        if slot.is_none() {
            *slot = Some(external_id);
        }
    }
    out
}

/// Flatten one contact. A missing entity leaves the entity fields null.
pub fn build_record(
    contact: &ContactFacts,
    place: Option<&PlaceFacts>,
    tech_names: Option<&str>,
    mappings: Option<&PlaceMappings>,
) -> AggregateRecord {
    let emails = contact.emails.as_ref().map(|e| e.to_lowercase());
    let title = contact.title.as_ref().map(|t| t.to_lowercase());
    let tech_names = tech_names.unwrap_or_default().to_string();
    let document = search_document(emails.as_deref(), title.as_deref(), &tech_names);

    AggregateRecord {
        contact_id: contact.id.clone(),
        emails,
        title,
        display_name: place.and_then(|p| p.display_name.as_ref().map(|d| d.to_lowercase())),
        population: place.and_then(|p| p.population),
        lat: place.and_then(|p| p.lat),
        long: place.and_then(|p| p.long),
        tech_names,
        customer_a_id: mappings.and_then(|m| m.customer_a_id.clone()),
        customer_b_id: mappings.and_then(|m| m.customer_b_id.clone()),
        document,
    }
}

/// Entity-level lookups shared by every contact page.
struct EntityIndex {
    places: HashMap<String, PlaceFacts>,
    tech_names: HashMap<String, String>,
    mappings: HashMap<String, PlaceMappings>,
}

impl EntityIndex {
    fn build(&self, contact: &ContactFacts) -> AggregateRecord {
        let place_id = contact.place_id.as_deref();
        build_record(
            contact,
            place_id.and_then(|p| self.places.get(p)),
            place_id
                .and_then(|p| self.tech_names.get(p))
                .map(String::as_str),
            place_id.and_then(|p| self.mappings.get(p)),
        )
    }
}

pub struct AggregateBuilder<'a> {
    pool: SqlitePool,
    page_size: usize,
    progress: &'a dyn ProgressReporter,
}

impl<'a> AggregateBuilder<'a> {
    pub fn new(pool: SqlitePool, page_size: usize, progress: &'a dyn ProgressReporter) -> Self {
        Self {
            pool,
            page_size: page_size.max(1),
            progress,
        }
    }

    /// Rebuild the aggregate view and publish it atomically.
    ///
    /// On any error the shadow version is discarded and the previously
    /// published snapshot stays current. Concurrent rebuilds write distinct
    /// versions; the pointer only ever moves forward.
    pub async fn rebuild(&self) -> Result<SnapshotInfo, RebuildError> {
        let index = self.read_entities().await?;
        let version = self.reserve().await?;

        tracing::info!(version, "building aggregate snapshot");

        let record_count = match self.write_shadow(version, &index).await {
            Ok(n) => n,
            Err(e) => {
                self.discard(version).await;
                return Err(e);
            }
        };

        let built_at = chrono::Utc::now().timestamp();
        if let Err(e) = self.swap(version, built_at, record_count).await {
            self.discard(version).await;
            return Err(e);
        }

        self.prune(version).await;

        tracing::info!(version, records = record_count, "published aggregate snapshot");
        Ok(SnapshotInfo {
            version,
            built_at,
            record_count,
        })
    }

    /// Claim the next version with a `building` row. A single statement, so
    /// two rebuilds can never claim the same number.
    async fn reserve(&self) -> Result<i64, RebuildError> {
        let result = sqlx::query(
            r#"
            INSERT INTO aggregate_snapshots (version, built_at, record_count, state)
            SELECT COALESCE(MAX(v), 0) + 1, ?, 0, 'building' FROM (
                SELECT MAX(version) AS v FROM aggregate_snapshots
                UNION ALL
                SELECT MAX(version) AS v FROM aggregate_records
            )
            "#,
        )
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(|source| RebuildError::Unreadable {
            relation: "aggregate_snapshots",
            source,
        })?;

        Ok(result.last_insert_rowid())
    }

    async fn read_entities(&self) -> Result<EntityIndex, RebuildError> {
        let place_rows =
            sqlx::query("SELECT place_id, display_name, pop_estimate_2022, lat, long FROM places")
                .fetch_all(&self.pool)
                .await
                .map_err(|source| RebuildError::Unreadable {
                    relation: "places",
                    source,
                })?;
        let places = place_rows
            .iter()
            .map(|r| {
                (
                    r.get::<String, _>("place_id"),
                    PlaceFacts {
                        display_name: r.get("display_name"),
                        population: r.get("pop_estimate_2022"),
                        lat: r.get("lat"),
                        long: r.get("long"),
                    },
                )
            })
            .collect();

        let tag_rows = sqlx::query("SELECT place_id, name FROM tech_tags")
            .fetch_all(&self.pool)
            .await
            .map_err(|source| RebuildError::Unreadable {
                relation: "tech_tags",
                source,
            })?;
        let tech_names = group_tech_names(
            tag_rows
                .iter()
                .map(|r| (r.get::<String, _>("place_id"), r.get::<String, _>("name"))),
        );

        let mapping_rows = sqlx::query(
            r#"
            SELECT customer, place_id, external_id FROM customer_mappings
            ORDER BY customer, place_id, seen_at DESC, seen_seq DESC, external_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|source| RebuildError::Unreadable {
            relation: "customer_mappings",
            source,
        })?;
        let mappings = latest_mappings(mapping_rows.iter().filter_map(|r| {
            let customer = Customer::from_key(r.get::<String, _>("customer").as_str())?;
            Some((
                customer,
                r.get::<String, _>("place_id"),
                r.get::<String, _>("external_id"),
            ))
        }));

        Ok(EntityIndex {
            places,
            tech_names,
            mappings,
        })
    }

    /// Write every contact's record under `version`. Returns the count.
    async fn write_shadow(&self, version: i64, index: &EntityIndex) -> Result<i64, RebuildError> {
        let mut after = String::new();
        let mut written: i64 = 0;

        loop {
            let rows = sqlx::query(
                r#"
                SELECT id, place_id, emails, title FROM contacts
                WHERE id > ?
                ORDER BY id
                LIMIT ?
                "#,
            )
            .bind(&after)
            .bind(self.page_size as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|source| RebuildError::Unreadable {
                relation: "contacts",
                source,
            })?;

            if rows.is_empty() {
                break;
            }

            let records: Vec<AggregateRecord> = rows
                .iter()
                .map(|r| {
                    index.build(&ContactFacts {
                        id: r.get("id"),
                        place_id: r.get("place_id"),
                        emails: r.get("emails"),
                        title: r.get("title"),
                    })
                })
                .collect();

            self.insert_page(version, &records)
                .await
                .map_err(|source| RebuildError::Write { version, source })?;

            written += records.len() as i64;
            if let Some(last) = records.last() {
                after = last.contact_id.clone();
            }
            self.progress.report(ProgressEvent::Rebuilding {
                version,
                n: written as u64,
            });
        }

        Ok(written)
    }

    async fn insert_page(&self, version: i64, records: &[AggregateRecord]) -> sqlx::Result<()> {
        let mut tx = self.pool.begin().await?;
        for rec in records {
            sqlx::query(
                r#"
                INSERT INTO aggregate_records (version, contact_id, emails, title, display_name,
                                               population, lat, long, tech_names,
                                               customer_a_id, customer_b_id, document)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(version)
            .bind(&rec.contact_id)
            .bind(&rec.emails)
            .bind(&rec.title)
            .bind(&rec.display_name)
            .bind(rec.population)
            .bind(rec.lat)
            .bind(rec.long)
            .bind(&rec.tech_names)
            .bind(&rec.customer_a_id)
            .bind(&rec.customer_b_id)
            .bind(&rec.document)
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO aggregate_fts (version, contact_id, document) VALUES (?, ?, ?)")
                .bind(version)
                .bind(&rec.contact_id)
                .bind(&rec.document)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await
    }

    /// Publish `version`. The snapshot row is updated first so the
    /// transaction holds the write lock before anything is checked.
    async fn swap(
        &self,
        version: i64,
        built_at: i64,
        record_count: i64,
    ) -> Result<(), RebuildError> {
        let swap_err = |source: sqlx::Error| RebuildError::Swap { version, source };

        let mut tx = self.pool.begin().await.map_err(swap_err)?;
        sqlx::query(
            r#"
            UPDATE aggregate_snapshots
            SET state = 'published', built_at = ?, record_count = ?
            WHERE version = ? AND state = 'building'
            "#,
        )
        .bind(built_at)
        .bind(record_count)
        .bind(version)
        .execute(&mut *tx)
        .await
        .map_err(swap_err)?;

        let found: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM aggregate_records WHERE version = ?")
                .bind(version)
                .fetch_one(&mut *tx)
                .await
                .map_err(swap_err)?;
        if found != record_count {
            return Err(RebuildError::Incomplete {
                version,
                expected: record_count,
                found,
            });
        }

        let current: Option<i64> =
            sqlx::query_scalar("SELECT version FROM aggregate_current WHERE id = 1")
                .fetch_optional(&mut *tx)
                .await
                .map_err(swap_err)?;
        if let Some(current) = current.filter(|c| *c >= version) {
            return Err(RebuildError::Superseded { version, current });
        }

        sqlx::query(
            r#"
            INSERT INTO aggregate_current (id, version) VALUES (1, ?)
            ON CONFLICT(id) DO UPDATE SET version = excluded.version
            "#,
        )
        .bind(version)
        .execute(&mut *tx)
        .await
        .map_err(swap_err)?;

        tx.commit().await.map_err(swap_err)
    }

    /// Best-effort removal of an unpublished shadow version.
    async fn discard(&self, version: i64) {
        for sql in [
            "DELETE FROM aggregate_records WHERE version = ?",
            "DELETE FROM aggregate_fts WHERE version = ?",
            "UPDATE aggregate_snapshots SET state = 'failed' WHERE version = ? AND state = 'building'",
        ] {
            if let Err(e) = sqlx::query(sql).bind(version).execute(&self.pool).await {
                tracing::warn!(version, error = %e, "failed to discard shadow snapshot rows");
            }
        }
    }

    /// Drop records of versions older than the published one. Versions
    /// still being built by another rebuild are left alone.
    async fn prune(&self, current: i64) {
        for sql in [
            r#"DELETE FROM aggregate_records WHERE version < ? AND version NOT IN
               (SELECT version FROM aggregate_snapshots WHERE state = 'building')"#,
            r#"DELETE FROM aggregate_fts WHERE version < ? AND version NOT IN
               (SELECT version FROM aggregate_snapshots WHERE state = 'building')"#,
        ] {
            if let Err(e) = sqlx::query(sql).bind(current).execute(&self.pool).await {
                tracing::warn!(version = current, error = %e, "failed to prune old snapshots");
            }
        }
    }
}

/// The published snapshot, if any rebuild has completed.
pub async fn current_snapshot(pool: &SqlitePool) -> sqlx::Result<Option<SnapshotInfo>> {
    let row = sqlx::query(
        r#"
        SELECT s.version, s.built_at, s.record_count
        FROM aggregate_current c
        JOIN aggregate_snapshots s ON s.version = c.version
        WHERE c.id = 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| SnapshotInfo {
        version: r.get("version"),
        built_at: r.get("built_at"),
        record_count: r.get("record_count"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(id: &str, place: Option<&str>, emails: &str, title: &str) -> ContactFacts {
        ContactFacts {
            id: id.to_string(),
            place_id: place.map(str::to_string),
            emails: Some(emails.to_string()),
            title: Some(title.to_string()),
        }
    }

    #[test]
    fn document_joins_lowercased_parts() {
        assert_eq!(
            search_document(Some("Bob@City.gov"), Some("Finance Director"), "accela tyler"),
            "bob@city.gov finance director accela tyler"
        );
        assert_eq!(search_document(None, Some("clerk"), ""), "clerk");
        assert_eq!(search_document(None, None, ""), "");
    }

    #[test]
    fn tech_names_sorted_and_deduped() {
        let grouped = group_tech_names(vec![
            ("p1".to_string(), "Tyler".to_string()),
            ("p1".to_string(), "accela".to_string()),
            ("p2".to_string(), "esri".to_string()),
            ("p1".to_string(), "ACCELA".to_string()),
        ]);
        assert_eq!(grouped["p1"], "accela tyler");
        assert_eq!(grouped["p2"], "esri");
    }

    #[test]
    fn first_mapping_per_customer_wins() {
        let m = latest_mappings(vec![
            (Customer::A, "p1".to_string(), "00NEW".to_string()),
            (Customer::A, "p1".to_string(), "00OLD".to_string()),
            (Customer::B, "p1".to_string(), "hs1".to_string()),
        ]);
        assert_eq!(m["p1"].customer_a_id.as_deref(), Some("00NEW"));
        assert_eq!(m["p1"].customer_b_id.as_deref(), Some("hs1"));
    }

    #[test]
    fn unmatched_contact_keeps_null_entity_fields() {
        let rec = build_record(&contact("c1", None, "a@b.gov", "Clerk"), None, None, None);
        assert_eq!(rec.contact_id, "c1");
        assert_eq!(rec.display_name, None);
        assert_eq!(rec.population, None);
        assert_eq!(rec.tech_names, "");
        assert_eq!(rec.document, "a@b.gov clerk");
    }

    #[test]
    fn matched_contact_carries_entity_fields() {
        let place = PlaceFacts {
            display_name: Some("Springfield City".to_string()),
            population: Some(120_000),
            lat: Some(39.78),
            long: Some(-89.65),
        };
        let maps = PlaceMappings {
            customer_a_id: Some("00ABC".to_string()),
            customer_b_id: None,
        };
        let rec = build_record(
            &contact("c1", Some("p1"), "bob@springfield.gov", "finance director"),
            Some(&place),
            Some("accela"),
            Some(&maps),
        );
        assert_eq!(rec.display_name.as_deref(), Some("springfield city"));
        assert_eq!(rec.population, Some(120_000));
        assert_eq!(rec.customer_a_id.as_deref(), Some("00ABC"));
        assert_eq!(rec.customer_b_id, None);
        assert_eq!(rec.document, "bob@springfield.gov finance director accela");
    }

    #[test]
    fn document_is_deterministic() {
        let c = contact("c1", Some("p1"), "x@y.gov", "Mayor");
        let a = build_record(&c, None, Some("esri"), None);
        let b = build_record(&c, None, Some("esri"), None);
        assert_eq!(a, b);
    }
}
