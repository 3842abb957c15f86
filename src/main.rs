//! # Ingest Harness CLI (`ingest`)
//!
//! Reads documents, splits them into overlapping chunks, embeds the chunks,
//! and keeps a vector index in sync with the sources.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ingest init` | Create the index database and schema |
//! | `ingest run [LOCATORS...]` | Ingest files, directories, globs or `s3://` keys |
//! | `ingest remove [LOCATORS...]` | Delete indexed records for items |
//! | `ingest status` | Show what is indexed |
//!
//! ## Examples
//!
//! ```bash
//! ingest init --config ./config/ingest.toml
//! ingest run docs/ "reports/**/*.pdf" s3://bucket/handbook.docx
//! ingest run docs/ --max-size 800 --overlap 80 --unit tokens --dry-run
//! ingest remove docs/old.md
//! ```
//!
//! Exit status: `0` when every item succeeded or was skipped, `2` when any
//! item failed or was never started, `1` on configuration errors.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ingest_harness::chunk::SizeUnit;
use ingest_harness::config::{self, Config};
use ingest_harness::ingest::{self, RunMode};
use ingest_harness::progress::ProgressMode;
use ingest_harness::{db, migrate, stats};

/// Ingest Harness: a document ingestion pipeline for retrieval indexes.
///
/// All commands accept `--config` pointing to a TOML file. See
/// `config/ingest.example.toml` for every setting.
#[derive(Parser)]
#[command(
    name = "ingest",
    about = "Ingest Harness: read, parse, chunk, embed and index documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ingest.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the index database schema. Safe to run repeatedly.
    Init,

    /// Ingest items into the index.
    ///
    /// Locators are files, directories (walked recursively), glob patterns,
    /// or `s3://bucket/key` URLs. Defaults to the configured filesystem root.
    Run {
        locators: Vec<String>,

        /// Maximum chunk size.
        #[arg(long)]
        max_size: Option<usize>,

        /// Overlap between consecutive chunks.
        #[arg(long)]
        overlap: Option<usize>,

        /// Unit for size, overlap and tolerance.
        #[arg(long, value_enum)]
        unit: Option<SizeUnit>,

        /// How far back from the size limit to look for a natural break.
        #[arg(long)]
        boundary_tolerance: Option<usize>,

        /// Items processed concurrently.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Attach ACL tags to records.
        #[arg(long, overrides_with = "no_acl")]
        acl: bool,

        #[arg(long, overrides_with = "acl")]
        no_acl: bool,

        /// Embed page images alongside text.
        #[arg(long, overrides_with = "no_vision")]
        vision: bool,

        #[arg(long, overrides_with = "vision")]
        no_vision: bool,

        /// Ignore stored fingerprints and reprocess every item.
        #[arg(long)]
        full: bool,

        /// Parse and chunk only. Nothing is embedded or written.
        #[arg(long)]
        dry_run: bool,

        /// Progress output on stderr. Defaults to `human` on a terminal.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Delete indexed records for items.
    Remove {
        /// Item locators, directory prefixes, or glob patterns.
        locators: Vec<String>,

        /// Remove every indexed item.
        #[arg(long, conflicts_with = "locators")]
        all: bool,
    },

    /// Show indexed item and record counts.
    Status,
}

/// Chunking and pipeline overrides from `ingest run`.
struct RunOverrides {
    max_size: Option<usize>,
    overlap: Option<usize>,
    unit: Option<SizeUnit>,
    boundary_tolerance: Option<usize>,
    concurrency: Option<usize>,
    acl: Option<bool>,
    vision: Option<bool>,
}

fn flag_pair(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

fn apply_overrides(cfg: &mut Config, o: RunOverrides) -> Result<()> {
    if let Some(v) = o.max_size {
        cfg.chunking.max_size = v;
    }
    if let Some(v) = o.overlap {
        cfg.chunking.overlap = v;
    }
    if let Some(v) = o.unit {
        cfg.chunking.unit = v;
    }
    if let Some(v) = o.boundary_tolerance {
        cfg.chunking.boundary_tolerance = Some(v);
    }
    if let Some(v) = o.concurrency {
        cfg.pipeline.concurrency = v;
    }
    if let Some(v) = o.acl {
        cfg.pipeline.acl = v;
    }
    if let Some(v) = o.vision {
        cfg.pipeline.vision = v;
    }
    config::validate(cfg).context("Invalid command-line overrides")
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ingest_harness=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Index initialized: {}", cfg.db.path.display());
        }
        Commands::Run {
            locators,
            max_size,
            overlap,
            unit,
            boundary_tolerance,
            concurrency,
            acl,
            no_acl,
            vision,
            no_vision,
            full,
            dry_run,
            progress,
        } => {
            apply_overrides(
                &mut cfg,
                RunOverrides {
                    max_size,
                    overlap,
                    unit,
                    boundary_tolerance,
                    concurrency,
                    acl: flag_pair(acl, no_acl),
                    vision: flag_pair(vision, no_vision),
                },
            )?;

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, finishing in-flight items");
                    on_signal.cancel();
                }
            });

            let mode = RunMode {
                full,
                dry_run,
                progress: progress.unwrap_or_else(ProgressMode::default_for_tty),
            };
            let summary = ingest::run_ingest(&cfg, locators, mode, cancel).await?;
            summary.print();
            if summary.is_partial() {
                return Ok(ExitCode::from(2));
            }
        }
        Commands::Remove { locators, all } => {
            ingest::run_remove(&cfg, locators, all).await?;
        }
        Commands::Status => {
            stats::run_status(&cfg).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn paired_flags_resolve() {
        assert_eq!(flag_pair(true, false), Some(true));
        assert_eq!(flag_pair(false, true), Some(false));
        assert_eq!(flag_pair(false, false), None);
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "ingest",
            "run",
            "docs/",
            "--max-size",
            "100",
            "--unit",
            "tokens",
            "--no-acl",
            "--dry-run",
            "--progress",
            "json",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                locators,
                max_size,
                unit,
                acl,
                no_acl,
                dry_run,
                progress,
                ..
            } => {
                assert_eq!(locators, vec!["docs/".to_string()]);
                assert_eq!(max_size, Some(100));
                assert_eq!(unit, Some(SizeUnit::Tokens));
                assert_eq!(flag_pair(acl, no_acl), Some(false));
                assert!(dry_run);
                assert_eq!(progress, Some(ProgressMode::Json));
            }
            _ => panic!("expected run"),
        }
    }
}
