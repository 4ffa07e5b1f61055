//! Pipeline orchestration.
//!
//! Coordinates one ingestion cycle: read sources → normalize → load the
//! base relations (entities first) → rebuild the aggregate snapshot. The
//! stages run sequentially; only the loader's chunks run in parallel.
//! Row-level problems are collected into the report and never stop the
//! run. A missing required source, a database failure, or a failed rebuild
//! does.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::aggregate::{AggregateBuilder, SnapshotInfo};
use crate::config::Config;
use crate::db;
use crate::loader::{LoadSummary, Loader};
use crate::mappings::{self, SeedOutcome};
use crate::migrate;
use crate::models::Customer;
use crate::normalize::{self, BatchReport};
use crate::progress::{ProgressMode, ProgressReporter};
use crate::shell;
use crate::sources;

/// Everything one pipeline run did.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub seeded: Vec<SeedOutcome>,
    pub batches: Vec<BatchReport>,
    pub loads: Vec<LoadSummary>,
    pub snapshot: SnapshotInfo,
}

impl PipelineReport {
    /// Rows rejected by normalization or loading.
    pub fn total_rejected(&self) -> usize {
        self.batches.iter().map(|b| b.rejected).sum::<usize>()
            + self.loads.iter().map(|l| l.rejected).sum::<usize>()
    }
}

/// Run one full cycle against `pool`. The schema must already exist.
pub async fn run_pipeline(
    config: &Config,
    pool: &SqlitePool,
    progress: &dyn ProgressReporter,
    seed_mappings: bool,
) -> Result<PipelineReport> {
    let seeded = if seed_mappings {
        mappings::seed_mappings(config)?
    } else {
        Vec::new()
    };

    let places_src = sources::read_rows(&config.sources.places_path())?;
    let contacts_src = sources::read_rows(&config.sources.contacts_path())?;
    let tags_src = sources::read_optional(&config.sources.techstacks_path())?;

    let places = normalize::normalize_places(&places_src);
    let contacts = normalize::normalize_contacts(&contacts_src);
    let tags = normalize::normalize_tech_tags(&tags_src);

    let mut batches = vec![places.report, contacts.report, tags.report];
    let mut mapping_rows = Vec::new();
    for customer in Customer::ALL {
        let src = sources::read_optional(&config.customer_path(customer))?;
        let id_column = &config.customers.get(customer).id_column;
        if !src.rows.is_empty() && !src.has_column(id_column) {
            tracing::warn!(
                customer = customer.key(),
                id_column = %id_column,
                "mapping source lacks its id column, every row will be rejected"
            );
        }
        let normalized = normalize::normalize_mappings(customer, id_column, &src);
        batches.push(normalized.report);
        mapping_rows.extend(normalized.records);
    }

    let loader = Loader::new(pool.clone(), &config.loader, progress);
    let loads = vec![
        loader.load_places(places.records).await?,
        loader.load(contacts.records).await?,
        loader.load(tags.records).await?,
        loader.load(mapping_rows).await?,
    ];

    let snapshot = AggregateBuilder::new(pool.clone(), config.loader.chunk_size, progress)
        .rebuild()
        .await?;

    Ok(PipelineReport {
        seeded,
        batches,
        loads,
        snapshot,
    })
}

/// Print the run summary in the sync-report style.
pub fn print_report(report: &PipelineReport) {
    for s in &report.seeded {
        if s.written > 0 {
            println!("Created {} ids in {}.", s.written, s.path.display());
        }
    }

    println!("normalize");
    for b in &report.batches {
        println!(
            "  {:<12} read: {}  cleaned: {}  rejected: {}  duplicates: {}",
            b.source.to_string(),
            b.rows_read,
            b.cleaned,
            b.rejected,
            b.duplicates_discarded
        );
    }

    println!("load");
    for l in &report.loads {
        print!(
            "  {:<18} upserted: {}  rejected: {}",
            l.relation, l.accepted, l.rejected
        );
        if l.detached > 0 {
            print!("  detached: {}", l.detached);
        }
        if !l.failed_chunks.is_empty() {
            print!("  failed chunks: {:?}", l.failed_chunks);
        }
        println!();
    }

    println!("rebuild");
    println!("  snapshot: v{}", report.snapshot.version);
    println!("  records: {}", report.snapshot.record_count);

    let rejections: Vec<String> = report
        .batches
        .iter()
        .flat_map(|b| b.rejections.iter().map(move |r| format!("{} {}", b.source, r)))
        .chain(
            report
                .loads
                .iter()
                .flat_map(|l| l.rejections.iter().map(move |r| format!("{} {}", l.relation, r))),
        )
        .collect();
    for line in &rejections {
        eprintln!("rejected: {}", line);
    }

    println!("ok");
}

/// `civic pipeline`: migrate, run one cycle, print the summary, and
/// optionally drop into the shell.
pub async fn run_pipeline_cmd(
    config: &Config,
    interactive: bool,
    seed_mappings: bool,
    progress: ProgressMode,
) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;

    let reporter = progress.reporter();
    let report = run_pipeline(config, &pool, reporter.as_ref(), seed_mappings)
        .await
        .context("pipeline failed")?;
    pool.close().await;

    print_report(&report);

    if interactive {
        shell::run_shell(config).await?;
    }
    Ok(())
}

/// `civic rebuild`: rebuild the aggregate snapshot from the stored base
/// relations.
pub async fn run_rebuild(config: &Config, progress: ProgressMode) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;

    let reporter = progress.reporter();
    let snapshot = AggregateBuilder::new(pool.clone(), config.loader.chunk_size, reporter.as_ref())
        .rebuild()
        .await;
    pool.close().await;
    let snapshot = snapshot?;

    println!("rebuild");
    println!("  snapshot: v{}", snapshot.version);
    println!("  records: {}", snapshot.record_count);
    println!("ok");
    Ok(())
}
