//! Record normalization.
//!
//! Turns raw CSV rows into typed base-relation rows. Each source type has a
//! row-level function returning either a record or a [`ValidationError`]
//! naming the offending field, and a batch function that applies it to a
//! whole source, reduces duplicates by natural key (last one wins) and
//! produces a [`BatchReport`].
//!
//! Generated identifiers are UUID v5 values derived from row content, so
//! re-running a batch assigns the same ids and upserts stay idempotent.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::LazyLock;
use uuid::Uuid;

use crate::error::{RowRejection, ValidationError};
use crate::models::{Contact, Customer, CustomerMapping, Place, RawRow, SourceKind, TechTag};
use crate::sources::SourceRows;

/// Namespace for content-derived identifiers.
const ID_NAMESPACE: Uuid = Uuid::from_u128(0x6c1d_9a4e_52b7_4f0e_9d3a_81c2_e5f0_7b14);

/// Unit separator between hashed fields so `("ab", "c")` and `("a", "bc")`
/// do not collide.
const FIELD_SEP: &str = "\u{1f}";

static PARENTHESIZED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(.*?\)").expect("valid annotation regex"));

/// Per-batch outcome of normalization.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub source: SourceKind,
    pub rows_read: usize,
    pub cleaned: usize,
    pub rejected: usize,
    pub duplicates_discarded: usize,
    pub rejections: Vec<RowRejection>,
}

impl BatchReport {
    fn new(source: SourceKind) -> Self {
        Self {
            source,
            rows_read: 0,
            cleaned: 0,
            rejected: 0,
            duplicates_discarded: 0,
            rejections: Vec::new(),
        }
    }
}

/// Normalized records of one source plus the report describing them.
#[derive(Debug, Clone)]
pub struct Normalized<T> {
    pub records: Vec<T>,
    pub report: BatchReport,
}

// ============ Field helpers ============

fn text(row: &RawRow, column: &str) -> Option<String> {
    row.get(column).map(str::to_string)
}

fn lower(row: &RawRow, column: &str) -> Option<String> {
    row.get(column).map(str::to_lowercase)
}

fn required(row: &RawRow, column: &str) -> Result<String, ValidationError> {
    text(row, column).ok_or_else(|| ValidationError::missing(column))
}

/// First non-blank cell among `columns`.
fn first_of(row: &RawRow, columns: &[&str]) -> Option<String> {
    columns.iter().find_map(|c| text(row, c))
}

/// Parse a coordinate, failing closed to `None` on malformed or
/// out-of-range input.
pub fn parse_coordinate(raw: Option<&str>, limit: f64) -> Option<f64> {
    let value: f64 = raw?.trim().parse().ok()?;
    (value.is_finite() && value.abs() <= limit).then_some(value)
}

/// Parse a population estimate. Accepts thousands separators and decimal
/// notation (`12,345`, `12345.0`); anything else is `None`.
pub fn parse_population(raw: Option<&str>) -> Option<i64> {
    let cleaned: String = raw?.chars().filter(|c| *c != ',' && *c != '_').collect();
    let value: f64 = cleaned.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 || value > i64::MAX as f64 {
        return None;
    }
    Some(value.round() as i64)
}

/// Parse a contact creation timestamp. Parenthesized annotations such as
/// `(Eastern Standard Time)` are stripped first.
pub fn parse_created_at(raw: Option<&str>) -> Option<NaiveDateTime> {
    let stripped = PARENTHESIZED.replace_all(raw?, "");
    let s = stripped.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%a %b %d %Y %H:%M:%S GMT%z") {
        return Some(dt.naive_utc());
    }

    const DATETIME_FORMATS: [&str; 5] = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%m/%d/%Y %H:%M:%S",
        "%m/%d/%Y %H:%M",
    ];
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }

    for fmt in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }

    None
}

/// Lower-case, split on `;` or `,`, drop blanks and repeats, rejoin with `;`.
pub fn normalize_emails(raw: Option<&str>) -> Option<String> {
    let mut seen: Vec<String> = Vec::new();
    for part in raw?.split([';', ',']) {
        let email = part.trim().to_lowercase();
        if !email.is_empty() && !seen.contains(&email) {
            seen.push(email);
        }
    }
    (!seen.is_empty()).then(|| seen.join(";"))
}

fn content_id(parts: &[&str]) -> String {
    Uuid::new_v5(&ID_NAMESPACE, parts.join(FIELD_SEP).as_bytes()).to_string()
}

// ============ Row-level normalization ============

pub fn place_from_row(row: &RawRow) -> Result<Place, ValidationError> {
    let place_id = required(row, "place_id")?;
    let parent_place_id = text(row, "parent_place_id");
    if parent_place_id.as_deref() == Some(place_id.as_str()) {
        return Err(ValidationError::new(
            "parent_place_id",
            "entity cannot be its own parent",
        ));
    }

    Ok(Place {
        display_name: first_of(row, &["display_name", "name"]),
        lat: parse_coordinate(row.get("lat").or(row.get("latitude")), 90.0),
        long: parse_coordinate(
            row.get("long")
                .or(row.get("lng"))
                .or(row.get("longitude")),
            180.0,
        ),
        pop_estimate_2022: parse_population(
            row.get("pop_estimate_2022").or(row.get("population")),
        ),
        state_abbr: text(row, "state_abbr").map(|s| s.to_uppercase()),
        county_fips: text(row, "county_fips"),
        geoid: text(row, "geoid"),
        parent_place_id,
        address: text(row, "address"),
        place_id,
    })
}

pub fn contact_from_row(row: &RawRow) -> Result<Contact, ValidationError> {
    let place_id = text(row, "place_id");
    let first_name = text(row, "first_name");
    let last_name = text(row, "last_name");
    let emails = normalize_emails(row.get("emails").or(row.get("email")));
    let phone = text(row, "phone");
    let title = lower(row, "title");
    let department = text(row, "department");
    let created_at = parse_created_at(row.get("created_at"));

    let id = match text(row, "id") {
        Some(id) => id,
        None => {
            let created = created_at.map(|c| c.to_string()).unwrap_or_default();
            content_id(&[
                "contact",
                place_id.as_deref().unwrap_or_default(),
                first_name.as_deref().unwrap_or_default(),
                last_name.as_deref().unwrap_or_default(),
                emails.as_deref().unwrap_or_default(),
                phone.as_deref().unwrap_or_default(),
                title.as_deref().unwrap_or_default(),
                department.as_deref().unwrap_or_default(),
                created.as_str(),
            ])
        }
    };

    Ok(Contact {
        id,
        place_id,
        first_name,
        last_name,
        emails,
        phone,
        title,
        department,
        created_at,
    })
}

pub fn tech_tag_from_row(row: &RawRow) -> Result<TechTag, ValidationError> {
    let place_id = required(row, "place_id")?;
    let name = lower(row, "name")
        .or_else(|| lower(row, "tech_name"))
        .ok_or_else(|| ValidationError::missing("name"))?;
    let category = text(row, "category");
    let id = content_id(&[
        "tech",
        place_id.as_str(),
        name.as_str(),
        category.as_deref().unwrap_or_default(),
    ]);

    Ok(TechTag {
        id,
        place_id,
        name,
        category,
    })
}

pub fn mapping_from_row(
    customer: Customer,
    id_column: &str,
    row: &RawRow,
) -> Result<CustomerMapping, ValidationError> {
    let id_column = id_column.trim().to_lowercase();
    let external_id = required(row, &id_column)?;
    let place_id = required(row, "place_id")?;

    Ok(CustomerMapping {
        customer,
        external_id,
        place_id,
        seen_seq: row.line as i64,
    })
}

// ============ Batch normalization ============

/// Keep the last record seen for each key, at the position of the first.
/// Returns the survivors and the number of discarded duplicates.
pub fn dedup_last<T, K, F>(records: Vec<T>, key: F) -> (Vec<T>, usize)
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut index: HashMap<K, usize> = HashMap::with_capacity(records.len());
    let mut out: Vec<T> = Vec::with_capacity(records.len());
    let mut discarded = 0;

    for record in records {
        match index.get(&key(&record)) {
            Some(&pos) => {
                out[pos] = record;
                discarded += 1;
            }
            None => {
                index.insert(key(&record), out.len());
                out.push(record);
            }
        }
    }

    (out, discarded)
}

fn normalize_batch<T, F, K, G>(
    kind: SourceKind,
    source: &SourceRows,
    convert: F,
    key: G,
) -> Normalized<T>
where
    F: Fn(&RawRow) -> Result<T, ValidationError>,
    K: Eq + Hash,
    G: Fn(&T) -> K,
{
    let mut report = BatchReport::new(kind);
    report.rows_read = source.rows.len() + source.malformed.len();
    report.rejections.extend(source.malformed.iter().cloned());

    let mut records = Vec::with_capacity(source.rows.len());
    for row in &source.rows {
        match convert(row) {
            Ok(r) => records.push(r),
            Err(e) => {
                tracing::debug!(source = %kind, line = row.line, error = %e, "row rejected");
                report.rejections.push(RowRejection::at_line(row.line, e));
            }
        }
    }

    let (records, discarded) = dedup_last(records, key);
    report.rejected = report.rejections.len();
    report.duplicates_discarded = discarded;
    report.cleaned = records.len();

    tracing::info!(
        source = %kind,
        read = report.rows_read,
        cleaned = report.cleaned,
        rejected = report.rejected,
        duplicates = report.duplicates_discarded,
        "normalized source"
    );

    Normalized { records, report }
}

pub fn normalize_places(source: &SourceRows) -> Normalized<Place> {
    normalize_batch(SourceKind::Place, source, place_from_row, |p| {
        p.place_id.clone()
    })
}

pub fn normalize_contacts(source: &SourceRows) -> Normalized<Contact> {
    if !source.rows.is_empty() && !source.has_column("id") {
        tracing::info!("contacts source has no 'id' column, generating content-derived ids");
    }
    normalize_batch(SourceKind::Contact, source, contact_from_row, |c| {
        c.id.clone()
    })
}

pub fn normalize_tech_tags(source: &SourceRows) -> Normalized<TechTag> {
    normalize_batch(SourceKind::TechTag, source, tech_tag_from_row, |t| {
        t.id.clone()
    })
}

/// Mappings are reduced to one per (`customer`, `place_id`), keeping the
/// most recently seen row.
pub fn normalize_mappings(
    customer: Customer,
    id_column: &str,
    source: &SourceRows,
) -> Normalized<CustomerMapping> {
    normalize_batch(
        SourceKind::Mapping(customer),
        source,
        |row| mapping_from_row(customer, id_column, row),
        |m| (m.customer, m.place_id.clone()),
    )
}
