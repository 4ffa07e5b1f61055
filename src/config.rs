//! TOML configuration parsing and validation.
//!
//! Every command reads a single TOML file (default `./config/civic.toml`).
//! Only `[db]` is mandatory; the source layout, loader tuning, query limits
//! and log level all have defaults.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::Customer;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub customers: CustomersConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Locations of the tabular inputs. Relative file names resolve against `dir`.
#[derive(Debug, Deserialize, Clone)]
pub struct SourcesConfig {
    #[serde(default = "default_sources_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_contacts")]
    pub contacts: PathBuf,
    #[serde(default = "default_places")]
    pub places: PathBuf,
    #[serde(default = "default_techstacks")]
    pub techstacks: PathBuf,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            dir: default_sources_dir(),
            contacts: default_contacts(),
            places: default_places(),
            techstacks: default_techstacks(),
        }
    }
}

fn default_sources_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_contacts() -> PathBuf {
    PathBuf::from("contacts.csv")
}
fn default_places() -> PathBuf {
    PathBuf::from("places.csv")
}
fn default_techstacks() -> PathBuf {
    PathBuf::from("techstacks.csv")
}

impl SourcesConfig {
    pub fn resolve(&self, file: &Path) -> PathBuf {
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.dir.join(file)
        }
    }

    pub fn contacts_path(&self) -> PathBuf {
        self.resolve(&self.contacts)
    }

    pub fn places_path(&self) -> PathBuf {
        self.resolve(&self.places)
    }

    pub fn techstacks_path(&self) -> PathBuf {
        self.resolve(&self.techstacks)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CustomersConfig {
    #[serde(default = "default_customer_a")]
    pub a: CustomerSourceConfig,
    #[serde(default = "default_customer_b")]
    pub b: CustomerSourceConfig,
}

impl Default for CustomersConfig {
    fn default() -> Self {
        Self {
            a: default_customer_a(),
            b: default_customer_b(),
        }
    }
}

impl CustomersConfig {
    pub fn get(&self, customer: Customer) -> &CustomerSourceConfig {
        match customer {
            Customer::A => &self.a,
            Customer::B => &self.b,
        }
    }
}

/// One customer-mapping CSV: which file, and which column holds the
/// external system identifier.
#[derive(Debug, Deserialize, Clone)]
pub struct CustomerSourceConfig {
    pub path: PathBuf,
    pub id_column: String,
}

fn default_customer_a() -> CustomerSourceConfig {
    CustomerSourceConfig {
        path: PathBuf::from("customerA_mapping.csv"),
        id_column: "sfdc_id".to_string(),
    }
}

fn default_customer_b() -> CustomerSourceConfig {
    CustomerSourceConfig {
        path: PathBuf::from("customerB_mapping.csv"),
        id_column: "hubspot_id".to_string(),
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoaderConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            parallelism: default_parallelism(),
        }
    }
}

fn default_chunk_size() -> usize {
    5000
}
fn default_parallelism() -> usize {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_row_limit")]
    pub row_limit: i64,
    #[serde(default = "default_display_rows")]
    pub display_rows: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            row_limit: default_row_limit(),
            display_rows: default_display_rows(),
        }
    }
}

fn default_row_limit() -> i64 {
    500
}
fn default_display_rows() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn customer_path(&self, customer: Customer) -> PathBuf {
        self.sources.resolve(&self.customers.get(customer).path)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.loader.chunk_size == 0 {
        anyhow::bail!("loader.chunk_size must be > 0");
    }

    if config.loader.parallelism == 0 {
        anyhow::bail!("loader.parallelism must be >= 1");
    }

    if config.query.row_limit < 1 {
        anyhow::bail!("query.row_limit must be >= 1");
    }

    for customer in Customer::ALL {
        let id_column = &config.customers.get(customer).id_column;
        if id_column.trim().is_empty() {
            anyhow::bail!("customers.{}.id_column must not be empty", customer.key());
        }
        if id_column.trim().eq_ignore_ascii_case("place_id") {
            anyhow::bail!(
                "customers.{}.id_column cannot be 'place_id'",
                customer.key()
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file_gets_defaults() {
        let cfg: Config = toml::from_str("[db]\npath = \"/tmp/x.sqlite\"\n").unwrap();
        assert_eq!(cfg.loader.chunk_size, 5000);
        assert_eq!(cfg.customers.a.id_column, "sfdc_id");
        assert_eq!(cfg.customers.b.id_column, "hubspot_id");
        assert_eq!(
            cfg.sources.contacts_path(),
            PathBuf::from("./data/contacts.csv")
        );
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn absolute_source_paths_are_kept() {
        let cfg: Config = toml::from_str(
            "[db]\npath = \"x.sqlite\"\n[sources]\ndir = \"/in\"\nplaces = \"/elsewhere/p.csv\"\n",
        )
        .unwrap();
        assert_eq!(cfg.sources.places_path(), PathBuf::from("/elsewhere/p.csv"));
        assert_eq!(cfg.sources.contacts_path(), PathBuf::from("/in/contacts.csv"));
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let cfg: Config =
            toml::from_str("[db]\npath = \"x.sqlite\"\n[loader]\nchunk_size = 0\n").unwrap();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn place_id_cannot_be_external_id() {
        let cfg: Config = toml::from_str(
            "[db]\npath = \"x.sqlite\"\n[customers.b]\npath = \"b.csv\"\nid_column = \"PLACE_ID\"\n",
        )
        .unwrap();
        assert!(validate(&cfg).is_err());
    }
}
