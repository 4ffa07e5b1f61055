//! # Civic Search CLI (`civic`)
//!
//! The `civic` binary drives the ingestion pipeline and the shorthand query
//! language: schema setup, loading the CSV sources, rebuilding the
//! aggregate snapshot, and querying it one-shot or interactively.
//!
//! ## Usage
//!
//! ```bash
//! civic --config ./config/civic.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `civic init` | Create the SQLite database and run schema migrations |
//! | `civic sources` | List configured source files and whether they exist |
//! | `civic pipeline` | Load every source and rebuild the aggregate snapshot |
//! | `civic rebuild` | Rebuild the aggregate snapshot from stored relations |
//! | `civic query "<q>"` | Run one shorthand query |
//! | `civic shell` | Interactive query loop |
//! | `civic get <id>` | Show one contact's aggregate record |
//! | `civic stats` | Relation counts and snapshot info |
//! | `civic seed-mappings` | Seed empty customer mapping files |
//!
//! ## Examples
//!
//! ```bash
//! civic pipeline --seed-mappings --interactive
//! civic query "title: finance"
//! civic query "filter: bob accela >10000" --explain
//! civic query "crm: a" --json --limit 20
//! ```

use anyhow::bail;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use civic_search::progress::ProgressMode;
use civic_search::{
    config, get, logging, mappings, migrate, pipeline, search, shell, sources, stats,
};

/// Civic Search CLI: load public-sector contacts and entities into a
/// searchable view and query it with a shorthand language.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/civic.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "civic",
    about = "Civic Search: contact and entity denormalization with a shorthand query language",
    version,
    long_about = "Civic Search cleans contact, entity, technology and customer-mapping CSV \
    sources, upserts them into SQLite, builds a denormalized full-text indexed view, and \
    translates shorthand queries (title:, email:, filter:, crm:, range:) into parameterized SQL."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/civic.toml`.
    #[arg(long, global = true, default_value = "./config/civic.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all base and aggregate tables.
    /// This command is idempotent; running it multiple times is safe.
    Init,

    /// List configured source files and whether they exist.
    Sources,

    /// Run the ingestion pipeline.
    ///
    /// Reads and normalizes every source, upserts the base relations in
    /// chunks, and publishes a new aggregate snapshot.
    Pipeline {
        /// Open the query shell once the pipeline has finished.
        #[arg(long)]
        interactive: bool,

        /// Seed missing or empty customer mapping files before loading.
        #[arg(long)]
        seed_mappings: bool,

        /// Progress output on stderr: `off`, `human` or `json`.
        /// Defaults to `human` when stderr is a terminal.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Rebuild the aggregate snapshot from the stored base relations.
    Rebuild {
        /// Progress output on stderr: `off`, `human` or `json`.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Run one shorthand query against the current snapshot.
    Query {
        /// The query, e.g. `title: finance` or `filter: bob accela >10000`.
        query: String,

        /// Print the compiled SQL and its parameters.
        #[arg(long)]
        explain: bool,

        /// Print records as JSON.
        #[arg(long)]
        json: bool,

        /// Maximum number of records (defaults to `query.row_limit`).
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Interactive query loop. Type `exit` to leave.
    Shell,

    /// Show one contact's aggregate record and base details.
    Get {
        /// Contact id.
        id: String,

        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show relation counts and the published snapshot.
    Stats,

    /// Seed missing or empty customer mapping files with deterministic ids.
    SeedMappings,
}

fn progress_mode(flag: Option<String>) -> anyhow::Result<ProgressMode> {
    match flag {
        None => Ok(ProgressMode::default_for_tty()),
        Some(s) => match ProgressMode::parse(&s) {
            Some(mode) => Ok(mode),
            None => bail!("Unknown progress mode: '{}'. Use off, human, or json.", s),
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.log.level);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Pipeline {
            interactive,
            seed_mappings,
            progress,
        } => {
            let mode = progress_mode(progress)?;
            pipeline::run_pipeline_cmd(&cfg, interactive, seed_mappings, mode).await?;
        }
        Commands::Rebuild { progress } => {
            let mode = progress_mode(progress)?;
            pipeline::run_rebuild(&cfg, mode).await?;
        }
        Commands::Query {
            query,
            explain,
            json,
            limit,
        } => {
            search::run_search(&cfg, &query, explain, json, limit).await?;
        }
        Commands::Shell => {
            shell::run_shell(&cfg).await?;
        }
        Commands::Get { id, json } => {
            get::run_get(&cfg, &id, json).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::SeedMappings => {
            mappings::run_seed(&cfg)?;
        }
    }

    Ok(())
}
