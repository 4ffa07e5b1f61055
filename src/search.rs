//! Query execution against the published aggregate snapshot.
//!
//! Queries are translated by [`crate::translate`] and executed read-only.
//! Each statement resolves the `aggregate_current` pointer itself, so a
//! query running during a rebuild sees one complete snapshot.

use anyhow::Result;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::models::AggregateRecord;
use crate::translate::{self, CompiledQuery, Param};

/// Rows returned for one query, with the SQL that produced them.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub compiled: CompiledQuery,
    pub records: Vec<AggregateRecord>,
}

/// Translate and run `query`, returning at most `limit` records ordered by
/// contact id.
pub async fn run_query(pool: &SqlitePool, query: &str, limit: i64) -> Result<QueryOutcome> {
    let compiled = translate::translate(query, limit)?;
    let records = execute(pool, &compiled).await?;
    Ok(QueryOutcome { compiled, records })
}

pub async fn execute(pool: &SqlitePool, compiled: &CompiledQuery) -> Result<Vec<AggregateRecord>> {
    let mut q: sqlx::query::Query<'_, Sqlite, SqliteArguments<'_>> = sqlx::query(&compiled.sql);
    for param in &compiled.params {
        q = match param {
            Param::Text(s) => q.bind(s.as_str()),
            Param::Real(n) => q.bind(*n),
            Param::Integer(n) => q.bind(*n),
        };
    }

    let rows = q.fetch_all(pool).await?;
    Ok(rows.iter().map(record_from_row).collect())
}

/// Map a row selected with the aggregate output columns.
pub fn record_from_row(row: &SqliteRow) -> AggregateRecord {
    let emails: Option<String> = row.get("emails");
    let title: Option<String> = row.get("title");
    let tech_names: String = row.get("tech_names");
    let document = crate::aggregate::search_document(emails.as_deref(), title.as_deref(), &tech_names);

    AggregateRecord {
        contact_id: row.get("contact_id"),
        emails,
        title,
        display_name: row.get("display_name"),
        population: row.get("population"),
        lat: row.get("lat"),
        long: row.get("long"),
        tech_names,
        customer_a_id: row.get("customer_a_id"),
        customer_b_id: row.get("customer_b_id"),
        document,
    }
}

/// Render one record as a numbered block, like the search listing.
pub fn render_record(index: usize, rec: &AggregateRecord) -> String {
    let mut out = format!(
        "{}. {} / {}\n",
        index,
        rec.contact_id,
        rec.display_name.as_deref().unwrap_or("(no entity)")
    );
    out.push_str(&format!("    emails: {}\n", rec.emails.as_deref().unwrap_or("-")));
    out.push_str(&format!("    title: {}\n", rec.title.as_deref().unwrap_or("-")));
    match rec.population {
        Some(p) => out.push_str(&format!("    population: {}\n", p)),
        None => out.push_str("    population: -\n"),
    }
    if let (Some(lat), Some(long)) = (rec.lat, rec.long) {
        out.push_str(&format!("    location: {:.4}, {:.4}\n", lat, long));
    }
    if !rec.tech_names.is_empty() {
        out.push_str(&format!("    tech: {}\n", rec.tech_names));
    }
    if let Some(ref id) = rec.customer_a_id {
        out.push_str(&format!("    customer a: {}\n", id));
    }
    if let Some(ref id) = rec.customer_b_id {
        out.push_str(&format!("    customer b: {}\n", id));
    }
    out
}

/// `civic query`: run one shorthand query and print the results.
pub async fn run_search(
    config: &Config,
    query: &str,
    explain: bool,
    json: bool,
    limit: Option<i64>,
) -> Result<()> {
    let limit = limit.unwrap_or(config.query.row_limit).max(1);

    // Translate before connecting so syntax errors never touch the database
    let compiled = translate::translate(query, limit)?;

    // With --json the SQL goes to stderr so stdout stays parseable
    if explain && json {
        eprintln!("{}", compiled.explain());
    } else if explain {
        println!("{}\n", compiled.explain());
    }

    let pool = db::connect(config).await?;
    let records = execute(&pool, &compiled).await?;
    pool.close().await;

    tracing::debug!(query, rows = records.len(), "query executed");

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, rec) in records.iter().enumerate() {
        println!("{}", render_record(i + 1, rec));
    }
    println!("Returned {} rows.", records.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> AggregateRecord {
        AggregateRecord {
            contact_id: "c1".to_string(),
            emails: Some("bob@springfield.gov".to_string()),
            title: Some("finance director".to_string()),
            display_name: Some("springfield city".to_string()),
            population: Some(120_000),
            lat: Some(39.7817),
            long: Some(-89.6501),
            tech_names: "accela".to_string(),
            customer_a_id: Some("00ABCDEFGHIJ".to_string()),
            customer_b_id: None,
            document: String::new(),
        }
    }

    #[test]
    fn render_shows_entity_and_crm() {
        let text = render_record(1, &record());
        assert!(text.starts_with("1. c1 / springfield city\n"));
        assert!(text.contains("    population: 120000\n"));
        assert!(text.contains("    tech: accela\n"));
        assert!(text.contains("    customer a: 00ABCDEFGHIJ\n"));
        assert!(!text.contains("customer b"));
    }

    #[test]
    fn render_without_entity() {
        let mut rec = record();
        rec.display_name = None;
        rec.population = None;
        rec.lat = None;
        rec.tech_names.clear();
        let text = render_record(3, &rec);
        assert!(text.starts_with("3. c1 / (no entity)\n"));
        assert!(text.contains("    population: -\n"));
        assert!(!text.contains("location"));
        assert!(!text.contains("tech:"));
    }
}
