//! Pipeline orchestration.
//!
//! Every item moves through
//! `Discovered → Parsed → Chunked → Embedded → Indexed → Done`, or ends as
//! `Failed` at whatever stage went wrong. Items run concurrently up to
//! `concurrency`; the stages of one item run in order.
//!
//! Before parsing, an item whose stored fingerprint (content digest plus
//! settings digest) matches is skipped without further work. `--full`
//! turns that shortcut off; reconciliation still guarantees that an
//! unchanged item produces zero index writes.
//!
//! Cancellation is cooperative: items not yet started never start, and
//! in-flight items stop at their next stage boundary.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::chunk::{chunk_pages, ChunkParams};
use crate::config::Config;
use crate::connector_fs::FilesystemReader;
use crate::connector_s3::S3Reader;
use crate::db;
use crate::embedder::{Embedder, EmbedderOptions};
use crate::embedding::create_provider;
use crate::error::IngestError;
use crate::index::{IndexManager, ReconcileReport};
use crate::migrate;
use crate::models::{Acl, ItemState};
use crate::parse::ParserRegistry;
use crate::progress::{NoProgress, ProgressEvent, ProgressMode, ProgressReporter};
use crate::source::{build_globset, has_glob_meta, is_s3_locator, SourceReader, SourceRouter};
use crate::store::{IndexStore, SqliteIndexStore};

/// Lifecycle stages of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Discovered,
    Parsed,
    Chunked,
    Embedded,
    Indexed,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Discovered => "discovered",
            Stage::Parsed => "parsed",
            Stage::Chunked => "chunked",
            Stage::Embedded => "embedded",
            Stage::Indexed => "indexed",
            Stage::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Stored fingerprint matched; nothing was parsed.
    Fingerprint,
    /// Reconciled with zero index writes.
    NoChanges,
}

#[derive(Debug)]
pub enum ItemStatus {
    Done {
        chunks: usize,
        report: ReconcileReport,
    },
    Skipped(SkipReason),
    /// `stage` is the stage the item was moving into when it failed.
    Failed {
        stage: Stage,
        error: IngestError,
    },
    NotStarted,
}

impl ItemStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ItemStatus::Done { .. } => "done",
            ItemStatus::Skipped(_) => "skipped",
            ItemStatus::Failed { .. } => "failed",
            ItemStatus::NotStarted => "not_started",
        }
    }

    fn detail(&self) -> Option<String> {
        match self {
            ItemStatus::Done { chunks, report } => Some(format!(
                "{} chunks, {} upserted, {} repositioned, {} deleted, {} unchanged",
                chunks, report.upserted, report.repositioned, report.deleted, report.unchanged
            )),
            ItemStatus::Skipped(SkipReason::Fingerprint) => Some("unchanged".to_string()),
            ItemStatus::Skipped(SkipReason::NoChanges) => Some("no index changes".to_string()),
            ItemStatus::Failed { stage, error } => {
                Some(format!("[{}] {}: {}", stage.as_str(), error.kind(), error))
            }
            ItemStatus::NotStarted => None,
        }
    }
}

#[derive(Debug)]
pub struct ItemReport {
    pub item_id: String,
    pub status: ItemStatus,
    pub elapsed: Duration,
}

/// Behaviour switches for one pipeline.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub chunk: ChunkParams,
    pub concurrency: usize,
    pub acl: bool,
    pub default_acl: Vec<String>,
    pub vision: bool,
    /// Ignore stored fingerprints.
    pub full: bool,
    /// Parse and chunk only.
    pub dry_run: bool,
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk: config.chunking.params(),
            concurrency: config.pipeline.concurrency,
            acl: config.pipeline.acl,
            default_acl: config.pipeline.default_acl.clone(),
            vision: config.pipeline.vision,
            full: false,
            dry_run: false,
        }
    }
}

/// Live per-run counters, updated as items finish.
#[derive(Debug, Default)]
pub struct RunCounters {
    pub done: AtomicU64,
    pub skipped: AtomicU64,
    pub failed: AtomicU64,
    pub not_started: AtomicU64,
    pub chunks: AtomicU64,
    pub upserted: AtomicU64,
    pub repositioned: AtomicU64,
    pub deleted: AtomicU64,
}

impl RunCounters {
    fn record(&self, status: &ItemStatus) {
        match status {
            ItemStatus::Done { chunks, report } => {
                self.done.fetch_add(1, Ordering::Relaxed);
                self.chunks.fetch_add(*chunks as u64, Ordering::Relaxed);
                self.upserted.fetch_add(report.upserted as u64, Ordering::Relaxed);
                self.repositioned
                    .fetch_add(report.repositioned as u64, Ordering::Relaxed);
                self.deleted.fetch_add(report.deleted as u64, Ordering::Relaxed);
            }
            ItemStatus::Skipped(_) => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
            }
            ItemStatus::Failed { .. } => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            ItemStatus::NotStarted => {
                self.not_started.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Outcome of one ingestion run. Items are sorted by id.
#[derive(Debug)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub dry_run: bool,
    pub items: Vec<ItemReport>,
    pub done: u64,
    pub skipped: u64,
    pub failed: u64,
    pub not_started: u64,
    pub chunks: u64,
    pub upserted: u64,
    pub repositioned: u64,
    pub deleted: u64,
    pub embedding_requests: u64,
    pub embedding_retries: u64,
    pub duration: Duration,
}

impl RunSummary {
    /// True when some item failed or never started.
    pub fn is_partial(&self) -> bool {
        self.failed > 0 || self.not_started > 0
    }

    pub fn failed_items(&self) -> impl Iterator<Item = &ItemReport> {
        self.items
            .iter()
            .filter(|r| matches!(r.status, ItemStatus::Failed { .. }))
    }

    /// Print per-item status and totals to stdout.
    pub fn print(&self) {
        println!(
            "ingest run {}{}",
            self.run_id,
            if self.dry_run { " (dry-run)" } else { "" }
        );
        for report in &self.items {
            match report.status.detail() {
                Some(detail) => println!(
                    "  {:<11} {}  ({})",
                    report.status.label(),
                    report.item_id,
                    detail
                ),
                None => println!("  {:<11} {}", report.status.label(), report.item_id),
            }
        }
        println!(
            "  items: {} (done {}, skipped {}, failed {}, not started {})",
            self.items.len(),
            self.done,
            self.skipped,
            self.failed,
            self.not_started
        );
        println!("  chunks: {}", self.chunks);
        if !self.dry_run {
            println!("  records upserted: {}", self.upserted);
            println!("  records repositioned: {}", self.repositioned);
            println!("  records deleted: {}", self.deleted);
            println!(
                "  embedding requests: {} (retries: {})",
                self.embedding_requests, self.embedding_retries
            );
        }
        println!("  duration: {:.2}s", self.duration.as_secs_f64());

        let failed: Vec<&str> = self.failed_items().map(|r| r.item_id.as_str()).collect();
        if !failed.is_empty() {
            println!("failed items:");
            for id in failed {
                println!("  {}", id);
            }
        }
        println!("{}", if self.is_partial() { "partial" } else { "ok" });
    }
}

/// Digest of every setting that shapes an item's records. A change forces
/// the item through the full pipeline again.
pub fn settings_digest(options: &PipelineOptions, model: &str, acl: &Acl) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "max={};overlap={};unit={};tolerance={};vision={};acl={};model={}",
        options.chunk.max_size,
        options.chunk.overlap,
        options.chunk.unit.as_str(),
        options.chunk.boundary_tolerance,
        options.vision,
        options.acl,
        model
    ));
    for principal in acl {
        hasher.update([0x1f]);
        hasher.update(principal.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn at(stage: Stage) -> impl Fn(IngestError) -> (Stage, IngestError) {
    move |error| (stage, error)
}

pub struct Pipeline {
    reader: Arc<dyn SourceReader>,
    parsers: Arc<ParserRegistry>,
    index: Arc<IndexManager>,
    embedder: Arc<Embedder>,
    options: PipelineOptions,
    reporter: Box<dyn ProgressReporter>,
}

impl Pipeline {
    pub fn new(
        reader: Arc<dyn SourceReader>,
        index: Arc<IndexManager>,
        embedder: Arc<Embedder>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            reader,
            parsers: Arc::new(ParserRegistry::new(options.vision)),
            index,
            embedder,
            options,
            reporter: Box::new(NoProgress),
        }
    }

    pub fn with_reporter(mut self, reporter: Box<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Expand patterns into locators, keeping first-seen order.
    /// A pattern that cannot be expanded fails the whole run.
    pub async fn discover(&self, patterns: &[String]) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut locators = Vec::new();
        for pattern in patterns {
            self.reporter.report(ProgressEvent::Discovering {
                pattern: pattern.clone(),
            });
            let found = self
                .reader
                .discover(pattern)
                .await
                .with_context(|| format!("Failed to discover items for '{}'", pattern))?;
            debug!(pattern = %pattern, found = found.len(), "discovered");
            for locator in found {
                if seen.insert(locator.clone()) {
                    locators.push(locator);
                }
            }
        }
        Ok(locators)
    }

    /// Process every locator. Item failures are recorded, never propagated.
    pub async fn run(&self, locators: Vec<String>, cancel: &CancellationToken) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let counters = RunCounters::default();
        let finished = AtomicU64::new(0);
        let total = locators.len() as u64;
        let requests_before = self.embedder.stats().requests.load(Ordering::Relaxed);
        let retries_before = self.embedder.stats().retries.load(Ordering::Relaxed);

        info!(
            run_id = %run_id,
            items = total,
            concurrency = self.options.concurrency,
            dry_run = self.options.dry_run,
            "ingestion run started"
        );

        let counters_ref = &counters;
        let finished_ref = &finished;
        let mut items: Vec<ItemReport> = stream::iter(locators)
            .map(|locator| async move {
                let report = if cancel.is_cancelled() {
                    ItemReport {
                        item_id: locator,
                        status: ItemStatus::NotStarted,
                        elapsed: Duration::ZERO,
                    }
                } else {
                    let span = info_span!("item", run_id = %run_id, item = %locator);
                    self.process_item(&locator, cancel).instrument(span).await
                };
                counters_ref.record(&report.status);
                let n = finished_ref.fetch_add(1, Ordering::Relaxed) + 1;
                self.reporter.report(ProgressEvent::ItemFinished {
                    n,
                    total,
                    item: report.item_id.clone(),
                    status: report.status.label(),
                    detail: report.status.detail(),
                });
                report
            })
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await;
        items.sort_by(|a, b| a.item_id.cmp(&b.item_id));

        let summary = RunSummary {
            run_id,
            dry_run: self.options.dry_run,
            items,
            done: counters.done.load(Ordering::Relaxed),
            skipped: counters.skipped.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            not_started: counters.not_started.load(Ordering::Relaxed),
            chunks: counters.chunks.load(Ordering::Relaxed),
            upserted: counters.upserted.load(Ordering::Relaxed),
            repositioned: counters.repositioned.load(Ordering::Relaxed),
            deleted: counters.deleted.load(Ordering::Relaxed),
            embedding_requests: self.embedder.stats().requests.load(Ordering::Relaxed)
                - requests_before,
            embedding_retries: self.embedder.stats().retries.load(Ordering::Relaxed)
                - retries_before,
            duration: started.elapsed(),
        };
        info!(
            run_id = %run_id,
            done = summary.done,
            skipped = summary.skipped,
            failed = summary.failed,
            not_started = summary.not_started,
            elapsed_ms = summary.duration.as_millis() as u64,
            "ingestion run finished"
        );
        summary
    }

    /// Run one item through every stage and report how it ended.
    pub async fn process_item(&self, locator: &str, cancel: &CancellationToken) -> ItemReport {
        let started = Instant::now();
        let status = match self.process(locator, cancel).await {
            Ok(status) => status,
            Err((stage, error)) => {
                warn!(stage = stage.as_str(), kind = error.kind(), error = %error, "item failed");
                ItemStatus::Failed { stage, error }
            }
        };
        ItemReport {
            item_id: locator.to_string(),
            status,
            elapsed: started.elapsed(),
        }
    }

    fn checkpoint(&self, cancel: &CancellationToken, next: Stage) -> Result<(), (Stage, IngestError)> {
        if cancel.is_cancelled() {
            return Err((next, IngestError::Cancelled));
        }
        Ok(())
    }

    fn effective_acl(&self, tags: &Acl) -> Acl {
        if !self.options.acl {
            return Acl::new();
        }
        let mut acl = tags.clone();
        acl.extend(self.options.default_acl.iter().cloned());
        acl
    }

    async fn process(
        &self,
        locator: &str,
        cancel: &CancellationToken,
    ) -> Result<ItemStatus, (Stage, IngestError)> {
        let mut item = self.reader.open(locator).await.map_err(at(Stage::Discovered))?;
        item.acl = self.effective_acl(&item.acl);
        let settings = settings_digest(&self.options, self.embedder.provider().model_name(), &item.acl);
        debug!(
            stage = Stage::Discovered.as_str(),
            bytes = item.content.len(),
            content_type = %item.content_type,
            "read item"
        );

        if !self.options.full && !self.options.dry_run {
            let stored = self.index.item_state(&item.id).await.map_err(at(Stage::Discovered))?;
            if let Some(state) = stored {
                if state.content_digest == item.content_digest && state.settings_digest == settings {
                    debug!("fingerprint unchanged");
                    return Ok(ItemStatus::Skipped(SkipReason::Fingerprint));
                }
            }
        }

        self.checkpoint(cancel, Stage::Parsed)?;
        let item = Arc::new(item);
        let pages = {
            let parsers = Arc::clone(&self.parsers);
            let item = Arc::clone(&item);
            tokio::task::spawn_blocking(move || parsers.parse(&item))
                .await
                .map_err(|e| {
                    (
                        Stage::Parsed,
                        IngestError::Parse(format!("{}: parser aborted: {}", locator, e)),
                    )
                })?
                .map_err(at(Stage::Parsed))?
        };
        debug!(stage = Stage::Parsed.as_str(), pages = pages.len(), "parsed");

        self.checkpoint(cancel, Stage::Chunked)?;
        let chunks = chunk_pages(&item, &pages, &self.options.chunk).map_err(at(Stage::Chunked))?;
        debug!(stage = Stage::Chunked.as_str(), chunks = chunks.len(), "chunked");

        if self.options.dry_run {
            return Ok(ItemStatus::Done {
                chunks: chunks.len(),
                report: ReconcileReport::default(),
            });
        }

        self.checkpoint(cancel, Stage::Embedded)?;
        let plan = self
            .index
            .plan(&item.id, &chunks)
            .await
            .map_err(at(Stage::Indexed))?;
        let to_embed: Vec<_> = plan
            .needs_embedding()
            .into_iter()
            .map(|i| chunks[i].clone())
            .collect();
        let vectors = self
            .embedder
            .embed_chunks(&to_embed)
            .await
            .map_err(at(Stage::Embedded))?;
        debug!(stage = Stage::Embedded.as_str(), embedded = vectors.len(), "embedded");

        self.checkpoint(cancel, Stage::Indexed)?;
        let report = self
            .index
            .apply(&chunks, &plan, vectors)
            .await
            .map_err(at(Stage::Indexed))?;
        self.index
            .save_item_state(&ItemState {
                item_id: item.id.clone(),
                content_digest: item.content_digest.clone(),
                settings_digest: settings,
                last_modified: item.last_modified.timestamp(),
                record_count: chunks.len(),
            })
            .await
            .map_err(at(Stage::Indexed))?;
        debug!(
            stage = Stage::Done.as_str(),
            upserted = report.upserted,
            repositioned = report.repositioned,
            deleted = report.deleted,
            unchanged = report.unchanged,
            "indexed"
        );

        if report.mutations() == 0 {
            return Ok(ItemStatus::Skipped(SkipReason::NoChanges));
        }
        Ok(ItemStatus::Done {
            chunks: chunks.len(),
            report,
        })
    }
}

/// Build the locator router. S3 credentials are only loaded when a pattern
/// actually names an S3 location.
pub fn build_reader(config: &Config, patterns: &[String]) -> Result<Arc<dyn SourceReader>> {
    let fs: Arc<dyn SourceReader> = Arc::new(FilesystemReader::new(&config.sources.filesystem)?);
    let s3: Option<Arc<dyn SourceReader>> = if patterns.iter().any(|p| is_s3_locator(p)) {
        let s3_config = config.sources.s3.clone().unwrap_or_default();
        Some(Arc::new(S3Reader::from_env(s3_config)?))
    } else {
        None
    };
    Ok(Arc::new(SourceRouter::new(fs, s3)))
}

/// CLI switches for `ingest run` that are not config overrides.
#[derive(Debug, Clone, Copy)]
pub struct RunMode {
    pub full: bool,
    pub dry_run: bool,
    pub progress: ProgressMode,
}

/// Run ingestion over `patterns` (default: the filesystem root).
pub async fn run_ingest(
    config: &Config,
    patterns: Vec<String>,
    mode: RunMode,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let patterns = if patterns.is_empty() {
        vec![".".to_string()]
    } else {
        patterns
    };

    if !mode.dry_run && !config.embedding.is_enabled() {
        bail!(
            "No embedding provider configured. Set [embedding] provider in the config \
             (e.g. \"openai\", \"ollama\", \"hash\") or use --dry-run."
        );
    }

    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    let store: Arc<dyn IndexStore> = Arc::new(SqliteIndexStore::new(pool.clone()));

    let provider = create_provider(&config.embedding)?;
    let embedder = Arc::new(Embedder::new(
        provider,
        EmbedderOptions::from_config(&config.embedding, config.pipeline.vision && !mode.dry_run),
    )?);
    let index = Arc::new(IndexManager::new(
        store,
        config.embedding.model_name(),
        Duration::from_secs(config.index.write_timeout_secs),
    ));
    let reader = build_reader(config, &patterns)?;

    let mut options = PipelineOptions::from_config(config);
    options.full = mode.full;
    options.dry_run = mode.dry_run;

    let pipeline =
        Pipeline::new(reader, index, embedder, options).with_reporter(mode.progress.reporter());
    let locators = pipeline.discover(&patterns).await?;
    let summary = pipeline.run(locators, &cancel).await;

    pool.close().await;
    Ok(summary)
}

/// Map a CLI argument to the item id it was stored under.
fn normalize_locator(raw: &str) -> String {
    if is_s3_locator(raw) || raw.starts_with("file:") {
        return raw.to_string();
    }
    format!("file:{}", raw.trim_start_matches("./"))
}

/// Delete indexed records for the named items, or for everything with `all`.
pub async fn run_remove(config: &Config, patterns: Vec<String>, all: bool) -> Result<()> {
    if patterns.is_empty() && !all {
        bail!("Nothing to remove: pass item locators or --all");
    }

    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    let store: Arc<dyn IndexStore> = Arc::new(SqliteIndexStore::new(pool.clone()));
    let index = IndexManager::new(
        Arc::clone(&store),
        config.embedding.model_name(),
        Duration::from_secs(config.index.write_timeout_secs),
    );

    let stored: Vec<String> = store
        .list_items()
        .await?
        .into_iter()
        .map(|s| s.item_id)
        .collect();

    let targets: Vec<String> = if all {
        stored
    } else {
        let normalized: Vec<String> = patterns.iter().map(|p| normalize_locator(p)).collect();
        let globs: Vec<String> = normalized
            .iter()
            .filter(|p| has_glob_meta(p))
            .cloned()
            .collect();
        let matcher = build_globset(&globs)?;
        stored
            .into_iter()
            .filter(|id| {
                matcher.is_match(id)
                    || normalized.iter().any(|p| {
                        id == p || id.starts_with(&format!("{}/", p.trim_end_matches('/')))
                    })
            })
            .collect()
    };

    let mut items = 0usize;
    let mut records = 0usize;
    for item_id in &targets {
        let removed = index
            .remove_item(item_id)
            .await
            .with_context(|| format!("Failed to remove {}", item_id))?;
        info!(item = %item_id, records = removed, "removed item");
        items += 1;
        records += removed;
    }

    println!("remove");
    println!("  items removed: {}", items);
    println!("  records deleted: {}", records);
    println!("ok");

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::SizeUnit;

    fn options() -> PipelineOptions {
        PipelineOptions {
            chunk: ChunkParams::new(100, 20, SizeUnit::Chars),
            concurrency: 2,
            acl: true,
            default_acl: vec![],
            vision: false,
            full: false,
            dry_run: false,
        }
    }

    #[test]
    fn settings_digest_tracks_every_input() {
        let acl: Acl = ["eng".to_string()].into_iter().collect();
        let base = settings_digest(&options(), "m", &acl);
        assert_eq!(base, settings_digest(&options(), "m", &acl));

        let mut other = options();
        other.chunk = ChunkParams::new(200, 20, SizeUnit::Chars);
        assert_ne!(base, settings_digest(&other, "m", &acl));
        assert_ne!(base, settings_digest(&options(), "m2", &acl));
        assert_ne!(base, settings_digest(&options(), "m", &Acl::new()));
        let mut no_acl = options();
        no_acl.acl = false;
        assert_ne!(base, settings_digest(&no_acl, "m", &acl));
    }

    #[test]
    fn cli_locators_normalize_to_item_ids() {
        assert_eq!(normalize_locator("docs/a.md"), "file:docs/a.md");
        assert_eq!(normalize_locator("./docs/a.md"), "file:docs/a.md");
        assert_eq!(normalize_locator("file:docs/a.md"), "file:docs/a.md");
        assert_eq!(normalize_locator("s3://b/k.pdf"), "s3://b/k.pdf");
    }

    #[test]
    fn failed_status_detail_names_stage_and_kind() {
        let status = ItemStatus::Failed {
            stage: Stage::Parsed,
            error: IngestError::UnsupportedFormat {
                content_type: "application/zip".to_string(),
            },
        };
        assert_eq!(status.label(), "failed");
        assert_eq!(
            status.detail().as_deref(),
            Some("[parsed] unsupported_format: unsupported format 'application/zip'")
        );
    }
}
