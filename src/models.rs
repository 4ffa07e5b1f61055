//! Core data models used throughout the pipeline.
//!
//! Raw rows come out of the CSV sources as header → cell maps, are
//! normalized into the typed base-relation rows below, and are finally
//! flattened into [`AggregateRecord`]s.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// A single CSV row keyed by lower-cased header name.
#[derive(Debug, Clone, Default)]
pub struct RawRow {
    /// 1-based line number in the source file (header is line 1).
    pub line: u64,
    pub cells: HashMap<String, String>,
}

impl RawRow {
    pub fn new(line: u64, cells: HashMap<String, String>) -> Self {
        Self { line, cells }
    }

    /// Returns the trimmed cell for `column`, or `None` when the column is
    /// absent or blank.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.cells
            .get(column)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Which kind of tabular source a row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Contact,
    Place,
    TechTag,
    Mapping(Customer),
}

impl SourceKind {
    pub fn relation(&self) -> &'static str {
        match self {
            SourceKind::Contact => "contacts",
            SourceKind::Place => "places",
            SourceKind::TechTag => "tech_tags",
            SourceKind::Mapping(_) => "customer_mappings",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Mapping(c) => write!(f, "customer_{}", c.key()),
            other => f.write_str(other.relation()),
        }
    }
}

/// The customer relations an entity can be synced to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Customer {
    A,
    B,
}

impl Customer {
    pub const ALL: [Customer; 2] = [Customer::A, Customer::B];

    /// Short key used in the database and in `crm:` queries.
    pub fn key(&self) -> &'static str {
        match self {
            Customer::A => "a",
            Customer::B => "b",
        }
    }

    pub fn from_key(key: &str) -> Option<Customer> {
        match key {
            "a" => Some(Customer::A),
            "b" => Some(Customer::B),
            _ => None,
        }
    }
}

/// Entity (public-sector place), keyed by `place_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Place {
    pub place_id: String,
    pub display_name: Option<String>,
    pub lat: Option<f64>,
    pub long: Option<f64>,
    pub pop_estimate_2022: Option<i64>,
    pub state_abbr: Option<String>,
    pub county_fips: Option<String>,
    pub geoid: Option<String>,
    pub parent_place_id: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub id: String,
    pub place_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    /// Lower-cased addresses joined with `;`.
    pub emails: Option<String>,
    pub phone: Option<String>,
    pub title: Option<String>,
    pub department: Option<String>,
    pub created_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TechTag {
    pub id: String,
    pub place_id: String,
    pub name: String,
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomerMapping {
    pub customer: Customer,
    pub external_id: String,
    pub place_id: String,
    /// Position within its batch; later rows win when picking the latest
    /// mapping for a place.
    pub seen_seq: i64,
}

/// Denormalized, search-indexed projection of one contact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateRecord {
    pub contact_id: String,
    pub emails: Option<String>,
    pub title: Option<String>,
    pub display_name: Option<String>,
    pub population: Option<i64>,
    pub lat: Option<f64>,
    pub long: Option<f64>,
    pub tech_names: String,
    pub customer_a_id: Option<String>,
    pub customer_b_id: Option<String>,
    /// Lower-cased search tokens; indexed, not part of query output.
    #[serde(skip_serializing)]
    pub document: String,
}
