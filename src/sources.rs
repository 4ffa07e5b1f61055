//! CSV source reading and source health listing.
//!
//! Headers are matched case-insensitively: every header is trimmed and
//! lower-cased before rows are handed to the normalizer. A record the CSV
//! reader cannot decode is reported as a row rejection; only an unreadable
//! file fails the read.

use anyhow::{Context, Result};
use csv::ReaderBuilder;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{RowRejection, ValidationError};
use crate::models::{Customer, RawRow, SourceKind};

/// Rows read from one source file.
#[derive(Debug, Default)]
pub struct SourceRows {
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
    /// Records the CSV reader could not decode.
    pub malformed: Vec<RowRejection>,
}

impl SourceRows {
    pub fn has_column(&self, column: &str) -> bool {
        self.headers.iter().any(|h| h == column)
    }
}

/// Read a required source. A missing or unreadable file is an error.
pub fn read_rows(path: &Path) -> Result<SourceRows> {
    let file =
        File::open(path).with_context(|| format!("Failed to open source: {}", path.display()))?;
    read_from(BufReader::new(file))
        .with_context(|| format!("Failed to read source: {}", path.display()))
}

/// Read an optional source. A file that does not exist yields no rows;
/// a file that exists but cannot be read is still an error.
pub fn read_optional(path: &Path) -> Result<SourceRows> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "optional source not found, treating as empty");
        return Ok(SourceRows::default());
    }
    read_rows(path)
}

pub fn read_from<R: Read>(reader: R) -> Result<SourceRows> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers: Vec<String> = rdr
        .headers()?
        .iter()
        .map(|h| h.trim().trim_start_matches('\u{feff}').to_lowercase())
        .collect();

    let mut out = SourceRows {
        headers: headers.clone(),
        ..Default::default()
    };

    for (idx, result) in rdr.records().enumerate() {
        let line = idx as u64 + 2;
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                out.malformed.push(RowRejection::at_line(
                    line,
                    ValidationError::new("<record>", e.to_string()),
                ));
                continue;
            }
        };

        let cells: HashMap<String, String> = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.clone(), v.to_string()))
            .collect();

        out.rows.push(RawRow::new(line, cells));
    }

    Ok(out)
}

/// Configured location and presence of one source.
#[derive(Debug, Clone)]
pub struct SourceStatus {
    pub kind: SourceKind,
    pub path: PathBuf,
    pub required: bool,
    pub exists: bool,
}

pub fn get_sources(config: &Config) -> Vec<SourceStatus> {
    let mut entries = vec![
        (SourceKind::Place, config.sources.places_path(), true),
        (SourceKind::Contact, config.sources.contacts_path(), true),
        (SourceKind::TechTag, config.sources.techstacks_path(), false),
    ];
    for customer in Customer::ALL {
        entries.push((
            SourceKind::Mapping(customer),
            config.customer_path(customer),
            false,
        ));
    }

    entries
        .into_iter()
        .map(|(kind, path, required)| SourceStatus {
            exists: path.is_file(),
            kind,
            path,
            required,
        })
        .collect()
}

pub fn list_sources(config: &Config) -> Result<()> {
    println!("{:<12} {:<10} {:<8} PATH", "SOURCE", "REQUIRED", "FOUND");
    for s in get_sources(config) {
        println!(
            "{:<12} {:<10} {:<8} {}",
            s.kind.to_string(),
            s.required,
            s.exists,
            s.path.display()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_lowercased_and_cells_trimmed() {
        let data = "Place_ID, Display_Name \n p1 ,  Springfield \n";
        let src = read_from(data.as_bytes()).unwrap();
        assert_eq!(src.headers, vec!["place_id", "display_name"]);
        assert_eq!(src.rows.len(), 1);
        assert_eq!(src.rows[0].get("place_id"), Some("p1"));
        assert_eq!(src.rows[0].get("display_name"), Some("Springfield"));
        assert_eq!(src.rows[0].line, 2);
    }

    #[test]
    fn short_rows_leave_columns_absent() {
        let data = "place_id,name,category\np1,accela\n";
        let src = read_from(data.as_bytes()).unwrap();
        assert_eq!(src.rows[0].get("category"), None);
        assert_eq!(src.rows[0].get("name"), Some("accela"));
    }

    #[test]
    fn missing_optional_file_is_empty() {
        let src = read_optional(Path::new("/definitely/not/here.csv")).unwrap();
        assert!(src.rows.is_empty());
    }

    #[test]
    fn missing_required_file_is_an_error() {
        assert!(read_rows(Path::new("/definitely/not/here.csv")).is_err());
    }
}
