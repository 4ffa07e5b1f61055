//! # Civic Search
//!
//! A denormalization pipeline and shorthand query language for public-sector
//! contact and entity data.
//!
//! Civic Search cleans heterogeneous CSV sources (contacts, places,
//! technology tags, per-customer CRM mappings), upserts them into a
//! normalized SQLite schema, flattens them into one full-text indexed record
//! per contact, and translates a small query grammar into parameterized SQL.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────────┐
//! │ CSV sources │──▶│ Normalizer  │──▶│ Upsert Loader │
//! └─────────────┘   └─────────────┘   └──────┬───────┘
//!                                            ▼
//!                  ┌──────────────┐   ┌──────────────┐
//!                  │  Translator  │◀──│  Aggregate   │
//!                  │ query/shell  │   │ FTS5 snapshot│
//!                  └──────────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! civic init                          # create database
//! civic pipeline --seed-mappings      # load sources, build snapshot
//! civic query "title: finance"
//! civic shell
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Row types and the aggregate record |
//! | [`error`] | Row, rebuild and query error taxonomy |
//! | [`sources`] | CSV reading and source listing |
//! | [`normalize`] | Record normalizer |
//! | [`loader`] | Chunked upserts into the base relations |
//! | [`aggregate`] | Versioned aggregate snapshot builder |
//! | [`translate`] | Shorthand grammar to parameterized SQL |
//! | [`search`] | Query execution |
//! | [`shell`] | Interactive query loop |
//! | [`pipeline`] | Ingestion cycle orchestration |
//! | [`mappings`] | Customer mapping seeding |
//! | [`get`] | Single record lookup |
//! | [`stats`] | Database overview |
//! | [`progress`] | Load progress reporting |
//! | [`logging`] | Tracing subscriber setup |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod aggregate;
pub mod config;
pub mod db;
pub mod error;
pub mod get;
pub mod loader;
pub mod logging;
pub mod mappings;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod progress;
pub mod search;
pub mod shell;
pub mod sources;
pub mod stats;
pub mod translate;
