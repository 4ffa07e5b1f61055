//! Customer mapping seeding.
//!
//! Fills a missing or empty customer mapping file with a handful of
//! external ids so a fresh checkout has something to join against. Both the
//! chosen places and the ids are derived from SHA-256 digests, so seeding
//! the same places file twice writes the same rows.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::config::Config;
use crate::models::Customer;
use crate::sources;

/// Mappings written per customer.
pub const SEED_COUNT: usize = 5;

const UPPER_ALNUM: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const MIXED_ALNUM: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// What seeding did for one customer.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedOutcome {
    pub customer: Customer,
    pub path: PathBuf,
    /// Rows written; zero when the file already had data.
    pub written: usize,
}

fn digest(customer: Customer, place_id: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(customer.key().as_bytes());
    hasher.update([0x1f]);
    hasher.update(place_id.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn encode(bytes: &[u8], alphabet: &[u8], len: usize) -> String {
    bytes
        .iter()
        .take(len)
        .map(|b| alphabet[*b as usize % alphabet.len()] as char)
        .collect()
}

/// Deterministic external id for `place_id`: `00` plus ten upper-case
/// alphanumerics for customer A, eight mixed-case alphanumerics for B.
pub fn external_id(customer: Customer, place_id: &str) -> String {
    let d = digest(customer, place_id);
    match customer {
        Customer::A => format!("00{}", encode(&d, UPPER_ALNUM, 10)),
        Customer::B => encode(&d, MIXED_ALNUM, 8),
    }
}

/// Pick up to `n` places, ordered by their digest for `customer`.
pub fn select_places(customer: Customer, place_ids: &BTreeSet<String>, n: usize) -> Vec<String> {
    let mut ranked: Vec<([u8; 32], &String)> = place_ids
        .iter()
        .map(|p| (digest(customer, p), p))
        .collect();
    ranked.sort();
    ranked.into_iter().take(n).map(|(_, p)| p.clone()).collect()
}

/// Seed every configured customer file that is missing or has no rows.
pub fn seed_mappings(config: &Config) -> Result<Vec<SeedOutcome>> {
    let places = sources::read_optional(&config.sources.places_path())?;
    let place_ids: BTreeSet<String> = places
        .rows
        .iter()
        .filter_map(|r| r.get("place_id").map(str::to_string))
        .collect();

    let mut outcomes = Vec::new();
    for customer in Customer::ALL {
        let path = config.customer_path(customer);
        let existing = sources::read_optional(&path)?;
        if !existing.rows.is_empty() || place_ids.is_empty() {
            outcomes.push(SeedOutcome {
                customer,
                path,
                written: 0,
            });
            continue;
        }

        let id_column = &config.customers.get(customer).id_column;
        let chosen = select_places(customer, &place_ids, SEED_COUNT);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(&path)
            .with_context(|| format!("Failed to create mapping file: {}", path.display()))?;
        writer.write_record([id_column.as_str(), "place_id"])?;
        for place_id in &chosen {
            writer.write_record([external_id(customer, place_id).as_str(), place_id.as_str()])?;
        }
        writer.flush()?;

        tracing::info!(
            customer = customer.key(),
            path = %path.display(),
            rows = chosen.len(),
            "seeded customer mappings"
        );
        outcomes.push(SeedOutcome {
            customer,
            path,
            written: chosen.len(),
        });
    }

    Ok(outcomes)
}

/// `civic seed-mappings`.
pub fn run_seed(config: &Config) -> Result<()> {
    for outcome in seed_mappings(config)? {
        if outcome.written > 0 {
            println!(
                "Created {} ids in {}.",
                outcome.written,
                outcome.path.display()
            );
        } else {
            println!(
                "customer_{}: {} left unchanged",
                outcome.customer.key(),
                outcome.path.display()
            );
        }
    }
    Ok(())
}
