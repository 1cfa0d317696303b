//! fsweep - run and inspect search-field backfill sweeps.
//!
//! ```bash
//! fsweep --db store.db import policies.jsonl
//! fsweep --db store.db candidates --limit 10
//! fsweep --db store.db run --batch-size 500
//! fsweep --db store.db --format json status
//! ```

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use fieldsweep_core::aspect::{AuditStamp, MetadataChangeProposal, SystemMetadata};
use fieldsweep_core::config::Config;
use fieldsweep_core::logging::{LogConfig, init_logging};
use fieldsweep_core::marker::UpgradeResult;
use fieldsweep_core::projection::SearchDocument;
use fieldsweep_core::runner::{StepRun, UpgradeRunner};
use fieldsweep_core::scanner::CandidateScanner;
use fieldsweep_core::sqlite::SqliteBackend;
use fieldsweep_core::step::{FieldSweepStep, UpgradeContext};
use fieldsweep_core::store::EntityStore;
use fieldsweep_core::urn::Urn;
use fieldsweep_core::{POLICY_FIELDS_SWEEP, SweepController};

#[derive(Parser, Debug)]
#[command(name = "fsweep", version)]
#[command(about = "Resumable, idempotent backfill of derived search fields")]
struct Cli {
    /// Config file (defaults to ./fsweep.toml when present)
    #[arg(long, global = true, env = "FSWEEP_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database holding aspects and the search index
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Plain)]
    format: OutputFormat,

    /// Log level (overrides config)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Plain,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the policy-fields sweep as an upgrade step
    Run {
        /// Ignore an existing completion marker
        #[arg(long)]
        reprocess: bool,

        /// Scroll page size
        #[arg(long)]
        batch_size: Option<usize>,

        /// Stop after this many pages (never marks completion)
        #[arg(long)]
        max_pages: Option<u64>,

        /// Run id stamped into restated aspects
        #[arg(long)]
        run_id: Option<String>,

        /// Make each restate conditional on the version that was read
        #[arg(long)]
        guard_concurrent_writes: bool,
    },

    /// Show the completion marker
    Status,

    /// List records the sweep would select, without changing anything
    Candidates {
        /// Maximum number of records to list
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Load aspects from JSON lines (`-` reads stdin)
    Import {
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("failed to load config")?;
    if let Some(db) = &cli.db {
        config.store.db_path.clone_from(db);
    }
    if let Some(level) = &cli.log_level {
        config.general.log_level.clone_from(level);
    }
    init_logging(&LogConfig::from(&config.general)).context("failed to initialize logging")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;
    runtime.block_on(dispatch(cli.command, cli.format, config))
}

async fn dispatch(command: Command, format: OutputFormat, mut config: Config) -> Result<()> {
    let backend = Arc::new(open_backend(&config.store.db_path)?);
    match command {
        Command::Run {
            reprocess,
            batch_size,
            max_pages,
            run_id,
            guard_concurrent_writes,
        } => {
            config.sweep.reprocess |= reprocess;
            config.sweep.guard_concurrent_writes |= guard_concurrent_writes;
            if let Some(n) = batch_size {
                config.sweep.batch_size = n;
            }
            if max_pages.is_some() {
                config.sweep.max_pages = max_pages;
            }
            if let Some(id) = run_id {
                config.sweep.run_id = id;
            }
            config.validate().context("invalid sweep options")?;
            run(&backend, &config, format).await
        }
        Command::Status => status(&backend, format).await,
        Command::Candidates { limit } => candidates(&backend, &config, limit, format).await,
        Command::Import { file } => import(&backend, &file, format).await,
    }
}

fn open_backend(path: &Path) -> Result<SqliteBackend> {
    debug!(db = %path.display(), "opening store");
    SqliteBackend::open(path).with_context(|| format!("failed to open {}", path.display()))
}

// ============================================================================
// run
// ============================================================================

async fn run(backend: &Arc<SqliteBackend>, config: &Config, format: OutputFormat) -> Result<()> {
    let controller = SweepController::new(
        POLICY_FIELDS_SWEEP,
        config.sweep.clone(),
        Arc::clone(backend),
        Arc::clone(backend),
    );
    let step = FieldSweepStep::new(controller)
        .with_retry_count(config.retry.max_attempts.saturating_sub(1));
    let runner = UpgradeRunner::new(config.retry.clone());
    let mut ctx = UpgradeContext::new(config.sweep.run_id.clone());

    let run = runner.run_step(&step, &mut ctx).await;
    print_run(&run, format)?;

    if let Some(result) = run.result.as_ref().filter(|r| !r.is_success()) {
        bail!("{result}");
    }
    Ok(())
}

fn print_run(run: &StepRun, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let value = json!({
                "stepId": run.step_id,
                "skipped": run.skipped,
                "attempts": run.attempts,
                "action": run.action,
                "result": run.result,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        OutputFormat::Plain => {
            let Some(result) = &run.result else {
                println!("{} SKIPPED", run.step_id);
                return Ok(());
            };
            println!("{result}");
            println!("attempts: {}", run.attempts);
            if let Some(report) = &result.report {
                println!("pages:               {}", report.pages_fetched);
                println!("candidates:          {}", report.candidates);
                println!("applied:             {}", report.applied);
                println!("skipped (no aspect): {}", report.skipped_no_aspect);
                println!("skipped (bad urn):   {}", report.skipped_parse_error);
                println!("failed:              {}", report.failed);
                println!(
                    "marker:              {}",
                    if report.marker_written {
                        "written"
                    } else {
                        "not written (scan incomplete)"
                    }
                );
                println!("elapsed:             {} ms", report.elapsed_ms);
            }
        }
    }
    Ok(())
}

// ============================================================================
// status
// ============================================================================

async fn status(backend: &Arc<SqliteBackend>, format: OutputFormat) -> Result<()> {
    let controller = SweepController::new(
        POLICY_FIELDS_SWEEP,
        Default::default(),
        Arc::clone(backend),
        Arc::clone(backend),
    );
    let marker = controller
        .marker()
        .read(POLICY_FIELDS_SWEEP.id)
        .await
        .context("failed to read completion marker")?;

    match format {
        OutputFormat::Json => {
            let value = json!({
                "sweepId": POLICY_FIELDS_SWEEP.id,
                "completed": marker.is_some(),
                "marker": marker,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        OutputFormat::Plain => match marker {
            None => println!("{}: not completed", POLICY_FIELDS_SWEEP.id),
            Some(marker) => print_marker(&marker),
        },
    }
    Ok(())
}

fn print_marker(marker: &UpgradeResult) {
    let when = i64::try_from(marker.timestamp_ms)
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map_or_else(
            || marker.timestamp_ms.to_string(),
            |t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        );
    println!("{}: completed at {when}", POLICY_FIELDS_SWEEP.id);
    for (key, value) in &marker.result {
        println!("  {key}: {value}");
    }
}

// ============================================================================
// candidates
// ============================================================================

async fn candidates(
    backend: &Arc<SqliteBackend>,
    config: &Config,
    limit: usize,
    format: OutputFormat,
) -> Result<()> {
    let scanner = CandidateScanner::new(
        Arc::clone(backend),
        vec![POLICY_FIELDS_SWEEP.entity_type.to_string()],
        POLICY_FIELDS_SWEEP.filter(),
        config.sweep.batch_size.min(limit.max(1)),
    );

    let mut found = Vec::new();
    let mut cursor = None;
    while found.len() < limit {
        let page = scanner
            .next_page(cursor.as_ref())
            .await
            .context("index scan failed")?;
        let terminal = page.is_terminal();
        found.extend(page.candidates.into_iter().map(|c| c.to_string()));
        if terminal {
            break;
        }
        cursor = page.next_cursor;
    }
    found.truncate(limit);

    match format {
        OutputFormat::Json => {
            let value = json!({
                "sweepId": POLICY_FIELDS_SWEEP.id,
                "missingFields": POLICY_FIELDS_SWEEP.missing_fields,
                "candidates": found,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        OutputFormat::Plain => {
            for urn in &found {
                println!("{urn}");
            }
        }
    }
    Ok(())
}

// ============================================================================
// import
// ============================================================================

/// One line of an import file.
#[derive(Debug, Deserialize)]
struct ImportRecord {
    urn: String,
    aspect: String,
    value: serde_json::Value,
    /// Index document to stage in place of the projected one.
    #[serde(default)]
    document: Option<SearchDocument>,
}

async fn import(backend: &Arc<SqliteBackend>, file: &Path, format: OutputFormat) -> Result<()> {
    let reader: Box<dyn BufRead> = if file == Path::new("-") {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        let f = std::fs::File::open(file)
            .with_context(|| format!("failed to open {}", file.display()))?;
        Box::new(BufReader::new(f))
    };

    let now = chrono::Utc::now().timestamp_millis().max(0).unsigned_abs();
    let mut imported = 0u64;
    let mut staged = 0u64;
    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.with_context(|| format!("failed to read line {line_no}"))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: ImportRecord = serde_json::from_str(&line)
            .with_context(|| format!("line {line_no}: invalid record"))?;
        let urn = Urn::parse(&record.urn).with_context(|| format!("line {line_no}: bad urn"))?;

        let proposal = MetadataChangeProposal::upsert(
            &urn,
            record.aspect,
            record.value,
            SystemMetadata::new("fsweep-import", now),
        );
        backend
            .ingest_proposal(&proposal, &AuditStamp::system(now), true)
            .await
            .with_context(|| format!("line {line_no}: ingest failed for {urn}"))?;
        imported += 1;

        if let Some(document) = record.document {
            backend
                .put_raw_document(&urn.to_string(), urn.entity_type(), document)
                .await
                .with_context(|| format!("line {line_no}: failed to stage document"))?;
            staged += 1;
        }
    }
    info!(imported, staged, "import finished");

    match format {
        OutputFormat::Json => {
            println!("{}", json!({"imported": imported, "documentsStaged": staged}));
        }
        OutputFormat::Plain => {
            println!("imported {imported} aspects ({staged} documents staged)");
        }
    }
    Ok(())
}
