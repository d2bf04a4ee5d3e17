use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use lexstore_kernel::config::StoreConfig;
use lexstore_kernel::lock::FileLock;
use lexstore_kernel::merge::{
    list_pending_increments, read_canonical, read_increment, Merger, TracingSink,
};
use lexstore_kernel::RepositoryError;

/// Lexstore maintenance CLI
#[derive(Parser, Debug)]
#[command(name = "lexstore")]
#[command(about = "Inspect and repair a canonical record file and its pending increments", long_about = None)]
struct Cli {
    /// Path to store config JSON
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log debug events to stderr
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record count, watermark and pending increments (does not lock)
    Status { canonical: PathBuf },

    /// Parse the canonical file and every pending increment
    Validate { canonical: PathBuf },

    /// Fold pending increments into the canonical file
    Merge { canonical: PathBuf },
}

#[derive(Debug, Serialize)]
struct StatusOutput {
    canonical: PathBuf,
    records: usize,
    last_modified: Option<DateTime<Utc>>,
    pending: Vec<PathBuf>,
}

#[derive(Debug, Serialize)]
struct FileCheck {
    path: PathBuf,
    ok: bool,
    diagnostic: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // ----------------------------
    // Load config
    // ----------------------------
    let config = match &cli.config {
        Some(path) => {
            let data = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str::<StoreConfig>(&data)?
        }
        None => StoreConfig::default(),
    };

    match cli.command {
        Command::Status { canonical } => status(&canonical),
        Command::Validate { canonical } => validate(&canonical),
        Command::Merge { canonical } => merge(&canonical, &config),
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn status(canonical: &Path) -> Result<()> {
    let document = read_canonical(canonical)?;
    let metadata = fs::metadata(canonical)?;
    let last_modified = if metadata.len() == 0 {
        None
    } else {
        Some(DateTime::<Utc>::from(metadata.modified()?))
    };

    let output = StatusOutput {
        canonical: canonical.to_path_buf(),
        records: document.len(),
        last_modified,
        pending: list_pending_increments(canonical)?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn validate(canonical: &Path) -> Result<()> {
    let mut checks = vec![check(canonical, read_canonical(canonical).map(|_| ()))];
    for increment in list_pending_increments(canonical)? {
        let outcome = read_increment(&increment).map(|_| ());
        checks.push(check(&increment, outcome));
    }

    println!("{}", serde_json::to_string_pretty(&checks)?);

    if !checks[0].ok {
        bail!("canonical file {} is malformed", canonical.display());
    }
    Ok(())
}

fn check(path: &Path, outcome: Result<(), RepositoryError>) -> FileCheck {
    FileCheck {
        path: path.to_path_buf(),
        ok: outcome.is_ok(),
        diagnostic: outcome.err().map(|e| e.to_string()),
    }
}

fn merge(canonical: &Path, config: &StoreConfig) -> Result<()> {
    let mut lock = FileLock::new(canonical);
    lock.acquire()?;

    let report = Merger::new(config, &TracingSink).merge_all(canonical, &mut lock, None)?;
    lock.release();

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
