use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use ingest_harness::chunk::{content_hash, ChunkParams, SizeUnit};
use ingest_harness::embedder::{Embedder, EmbedderOptions};
use ingest_harness::embedding::{EmbeddingProvider, HashProvider, ProviderError};
use ingest_harness::error::IngestError;
use ingest_harness::index::IndexManager;
use ingest_harness::ingest::{ItemStatus, Pipeline, PipelineOptions, SkipReason, Stage};
use ingest_harness::models::{record_id, Acl, SourceItem};
use ingest_harness::source::SourceReader;
use ingest_harness::store::{InMemoryIndexStore, IndexStore};

const MODEL: &str = "fnv1a-hash";
const DIMS: usize = 32;

/// Items held in memory under `mem:` locators.
#[derive(Default)]
struct MemoryReader {
    items: RwLock<BTreeMap<String, (String, Vec<u8>, Acl)>>,
}

impl MemoryReader {
    fn put(&self, locator: &str, content_type: &str, content: impl Into<Vec<u8>>) {
        self.put_with_acl(locator, content_type, content, Acl::new());
    }

    fn put_with_acl(&self, locator: &str, content_type: &str, content: impl Into<Vec<u8>>, acl: Acl) {
        self.items.write().unwrap().insert(
            locator.to_string(),
            (content_type.to_string(), content.into(), acl),
        );
    }
}

#[async_trait]
impl SourceReader for MemoryReader {
    async fn discover(&self, pattern: &str) -> Result<Vec<String>> {
        Ok(self
            .items
            .read()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(pattern))
            .cloned()
            .collect())
    }

    async fn open(&self, locator: &str) -> Result<SourceItem, IngestError> {
        let items = self.items.read().unwrap();
        let (content_type, content, acl) = items
            .get(locator)
            .ok_or_else(|| IngestError::NotFound(locator.to_string()))?;
        let modified = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        Ok(
            SourceItem::new(locator, locator, content.clone(), content_type.clone(), modified)
                .with_acl(acl.clone()),
        )
    }
}

/// Hash embeddings that answer the first `failures` calls with a rate limit.
struct RateLimitedProvider {
    inner: HashProvider,
    failures: usize,
    calls: AtomicUsize,
}

impl RateLimitedProvider {
    fn new(failures: usize) -> Self {
        Self {
            inner: HashProvider::new(DIMS, MODEL),
            failures,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for RateLimitedProvider {
    fn model_name(&self) -> &str {
        MODEL
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            return Err(ProviderError::RateLimited {
                retry_after: Some(Duration::from_millis(1)),
            });
        }
        self.inner.embed_texts(texts).await
    }
}

/// Hash embeddings that take `delay` per call.
struct SlowProvider {
    inner: HashProvider,
    delay: Duration,
}

#[async_trait]
impl EmbeddingProvider for SlowProvider {
    fn model_name(&self) -> &str {
        MODEL
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        tokio::time::sleep(self.delay).await;
        self.inner.embed_texts(texts).await
    }
}

struct Harness {
    reader: Arc<MemoryReader>,
    store: Arc<InMemoryIndexStore>,
    embedder: Arc<Embedder>,
    index: Arc<IndexManager>,
}

fn embedder_options() -> EmbedderOptions {
    EmbedderOptions {
        batch_size: 64,
        max_batch_tokens: 8000,
        max_retries: 3,
        timeout: Duration::from_secs(5),
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(5),
        parallelism: 2,
        requests_per_minute: None,
        vision: false,
    }
}

fn harness_with(provider: Arc<dyn EmbeddingProvider>) -> Harness {
    let reader = Arc::new(MemoryReader::default());
    let store = Arc::new(InMemoryIndexStore::new());
    let embedder = Arc::new(Embedder::new(provider, embedder_options()).unwrap());
    let dyn_store: Arc<dyn IndexStore> = store.clone();
    let index = Arc::new(IndexManager::new(dyn_store, MODEL, Duration::from_secs(5)));
    Harness {
        reader,
        store,
        embedder,
        index,
    }
}

fn harness() -> Harness {
    harness_with(Arc::new(HashProvider::new(DIMS, MODEL)))
}

fn options() -> PipelineOptions {
    PipelineOptions {
        chunk: ChunkParams::new(100, 20, SizeUnit::Chars).with_tolerance(0),
        concurrency: 4,
        acl: true,
        default_acl: Vec::new(),
        vision: false,
        full: false,
        dry_run: false,
    }
}

impl Harness {
    fn pipeline(&self, options: PipelineOptions) -> Pipeline {
        let reader: Arc<dyn SourceReader> = self.reader.clone();
        Pipeline::new(reader, self.index.clone(), self.embedder.clone(), options)
    }
}

/// 98 lowercase letters without whitespace, distinct per page.
fn page(n: usize) -> String {
    (0..98)
        .map(|i| (b'a' + ((i * 7 + n * 3) % 26) as u8) as char)
        .collect()
}

/// Three form-feed separated pages. Concatenated with `\n\n` between pages
/// the chunker sees 298 chars: page 2 occupies `[100, 198)`.
fn three_pages(second: &str) -> String {
    format!("{}\x0c{}\x0c{}", page(1), second, page(3))
}

#[tokio::test]
async fn three_page_item_chunks_deterministically() {
    let h = harness();
    h.reader.put("mem:doc.txt", "text/plain", three_pages(&page(2)));
    let pipeline = h.pipeline(options());

    let summary = pipeline
        .run(vec!["mem:doc.txt".to_string()], &CancellationToken::new())
        .await;

    // Windows [0,100) [80,180) [160,260) [240,298).
    assert_eq!(summary.done, 1);
    assert_eq!(summary.chunks, 4);
    assert_eq!(summary.upserted, 4);
    assert!(!summary.is_partial());

    let records = h.store.records_for_item("mem:doc.txt").await.unwrap();
    assert_eq!(records.len(), 4);
    assert_eq!(records[0].page_start, 1);
    assert_eq!(records[3].page_end, 3);
    assert_eq!(records[0].text.chars().count(), 100);
    assert_eq!(records[3].text.chars().count(), 58);
    for pair in records.windows(2) {
        let tail: String = pair[0].text.chars().skip(80).collect();
        let head: String = pair[1].text.chars().take(20).collect();
        assert_eq!(tail, head, "consecutive chunks overlap by exactly 20 chars");
    }
    for record in &records {
        assert_eq!(record.vector.len(), DIMS);
        assert_eq!(record.model, MODEL);
    }
}

#[tokio::test]
async fn unchanged_rerun_writes_nothing() {
    let h = harness();
    h.reader.put("mem:doc.txt", "text/plain", three_pages(&page(2)));
    let locators = vec!["mem:doc.txt".to_string()];
    let cancel = CancellationToken::new();

    h.pipeline(options()).run(locators.clone(), &cancel).await;
    h.store.reset_counters();

    let fast = h.pipeline(options()).run(locators.clone(), &cancel).await;
    assert_eq!(fast.skipped, 1);
    assert!(matches!(
        fast.items[0].status,
        ItemStatus::Skipped(SkipReason::Fingerprint)
    ));

    let mut full = options();
    full.full = true;
    let reconciled = h.pipeline(full).run(locators, &cancel).await;
    assert_eq!(reconciled.skipped, 1);
    assert!(matches!(
        reconciled.items[0].status,
        ItemStatus::Skipped(SkipReason::NoChanges)
    ));
    assert_eq!(reconciled.embedding_requests, 0);

    assert_eq!(h.store.upserts(), 0);
    assert_eq!(h.store.deletes(), 0);
}

#[tokio::test]
async fn single_character_edit_upserts_one_chunk() {
    let h = harness();
    h.reader.put("mem:doc.txt", "text/plain", three_pages(&page(2)));
    let locators = vec!["mem:doc.txt".to_string()];
    let cancel = CancellationToken::new();
    h.pipeline(options()).run(locators.clone(), &cancel).await;
    h.store.reset_counters();

    // Global offset 137 lies only in window [80,180).
    let mut edited: Vec<char> = page(2).chars().collect();
    edited[37] = 'Z';
    let edited: String = edited.into_iter().collect();
    h.reader.put("mem:doc.txt", "text/plain", three_pages(&edited));

    let summary = h.pipeline(options()).run(locators, &cancel).await;
    match &summary.items[0].status {
        ItemStatus::Done { chunks, report } => {
            assert_eq!(*chunks, 4);
            assert_eq!(report.upserted, 1);
            assert_eq!(report.deleted, 0);
            assert_eq!(report.unchanged, 3);
        }
        other => panic!("expected done, got {:?}", other),
    }
    assert_eq!(h.store.upserts(), 1);
    assert_eq!(h.store.deletes(), 0);
    assert_eq!(summary.embedding_requests, 1);
}

#[tokio::test]
async fn page_two_rewrite_touches_only_overlapping_chunks() {
    let h = harness();
    h.reader.put("mem:doc.txt", "text/plain", three_pages(&page(2)));
    let locators = vec!["mem:doc.txt".to_string()];
    let cancel = CancellationToken::new();
    h.pipeline(options()).run(locators.clone(), &cancel).await;
    h.store.reset_counters();

    h.reader.put("mem:doc.txt", "text/plain", three_pages(&page(9)));
    h.pipeline(options()).run(locators, &cancel).await;

    assert_eq!(h.store.upserts(), 2);
    assert_eq!(h.store.deletes(), 0);
    let records = h.store.records_for_item("mem:doc.txt").await.unwrap();
    assert!(records[1].text.contains(&page(9)[..20]));
}

#[tokio::test]
async fn prepended_page_keeps_existing_records() {
    let h = harness();
    h.reader.put("mem:doc.txt", "text/plain", three_pages(&page(2)));
    let locators = vec!["mem:doc.txt".to_string()];
    let cancel = CancellationToken::new();
    h.pipeline(options()).run(locators.clone(), &cancel).await;
    let before = h.store.records_for_item("mem:doc.txt").await.unwrap();
    h.store.reset_counters();

    // 78 chars plus the page break shift every window by exactly one stride.
    let intro = page(7)[..78].to_string();
    h.reader.put(
        "mem:doc.txt",
        "text/plain",
        format!("{}\x0c{}", intro, three_pages(&page(2))),
    );
    let summary = h.pipeline(options()).run(locators, &cancel).await;

    assert_eq!(summary.done, 1);
    assert_eq!(summary.upserted, 1);
    assert_eq!(summary.repositioned, 4);
    assert_eq!(summary.embedding_requests, 1);
    assert_eq!((h.store.upserts(), h.store.deletes()), (1, 0));

    let after = h.store.records_for_item("mem:doc.txt").await.unwrap();
    assert_eq!(after.len(), 5);
    for (old, new) in before.iter().zip(&after[1..]) {
        assert_eq!(new.id, old.id);
        assert_eq!(new.vector, old.vector);
        assert_eq!(new.chunk_index, old.chunk_index + 1);
        assert_eq!(new.page_start, old.page_start + 1);
    }
}

#[tokio::test]
async fn rate_limited_twice_then_succeeds() {
    let provider = Arc::new(RateLimitedProvider::new(2));
    let h = harness_with(provider.clone());
    h.reader.put("mem:doc.txt", "text/plain", three_pages(&page(2)));

    let summary = h
        .pipeline(options())
        .run(vec!["mem:doc.txt".to_string()], &CancellationToken::new())
        .await;

    assert_eq!(summary.done, 1);
    assert_eq!(summary.embedding_retries, 2);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 3);

    let reference = HashProvider::new(DIMS, MODEL);
    let records = h.store.records_for_item("mem:doc.txt").await.unwrap();
    for record in &records {
        assert_eq!(record.vector, reference.embed_one(&record.text));
    }
}

#[tokio::test]
async fn retries_exhausted_fails_only_that_item() {
    let h = harness_with(Arc::new(RateLimitedProvider::new(100)));
    h.reader.put("mem:doc.txt", "text/plain", "some text");

    let summary = h
        .pipeline(options())
        .run(vec!["mem:doc.txt".to_string()], &CancellationToken::new())
        .await;

    assert_eq!(summary.failed, 1);
    match &summary.items[0].status {
        ItemStatus::Failed { stage, error } => {
            assert_eq!(*stage, Stage::Embedded);
            assert!(matches!(error, IngestError::EmbeddingFailed { attempts: 4, .. }));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(h.store.record_count(), 0);
}

#[tokio::test]
async fn one_unsupported_item_among_ten() {
    let h = harness();
    for i in 0..9 {
        h.reader.put(
            &format!("mem:batch/{}.md", i),
            "text/markdown",
            format!("# Note {}\n\nBody of note number {}.", i, i),
        );
    }
    h.reader
        .put("mem:batch/archive.bin", "application/octet-stream", vec![0u8, 1, 2, 3]);

    let pipeline = h.pipeline(options());
    let locators = pipeline.discover(&["mem:batch/".to_string()]).await.unwrap();
    assert_eq!(locators.len(), 10);
    let summary = pipeline.run(locators, &CancellationToken::new()).await;

    assert_eq!(summary.done, 9);
    assert_eq!(summary.failed, 1);
    assert!(summary.is_partial());
    let failed: Vec<_> = summary.failed_items().collect();
    assert_eq!(failed[0].item_id, "mem:batch/archive.bin");
    match &failed[0].status {
        ItemStatus::Failed { stage, error } => {
            assert_eq!(*stage, Stage::Parsed);
            assert!(matches!(error, IngestError::UnsupportedFormat { .. }));
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn missing_item_fails_at_discovery() {
    let h = harness();
    let summary = h
        .pipeline(options())
        .run(vec!["mem:gone.txt".to_string()], &CancellationToken::new())
        .await;
    match &summary.items[0].status {
        ItemStatus::Failed { stage, error } => {
            assert_eq!(*stage, Stage::Discovered);
            assert!(matches!(error, IngestError::NotFound(_)));
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn cancelled_run_starts_nothing() {
    let h = harness();
    for i in 0..3 {
        h.reader.put(&format!("mem:{}.txt", i), "text/plain", "hello world");
    }
    let cancel = CancellationToken::new();
    cancel.cancel();

    let pipeline = h.pipeline(options());
    let locators = pipeline.discover(&["mem:".to_string()]).await.unwrap();
    let summary = pipeline.run(locators, &cancel).await;

    assert_eq!(summary.not_started, 3);
    assert_eq!(summary.done, 0);
    assert!(summary.is_partial());
    assert_eq!(h.store.record_count(), 0);
}

#[tokio::test]
async fn cancellation_mid_run_stops_in_flight_items() {
    let h = harness_with(Arc::new(SlowProvider {
        inner: HashProvider::new(DIMS, MODEL),
        delay: Duration::from_millis(200),
    }));
    for i in 0..6 {
        h.reader
            .put(&format!("mem:{}.txt", i), "text/plain", format!("document number {}", i));
    }
    let mut two_at_a_time = options();
    two_at_a_time.concurrency = 2;
    let pipeline = h.pipeline(two_at_a_time);
    let locators = pipeline.discover(&["mem:".to_string()]).await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let summary = pipeline.run(locators, &cancel).await;

    assert_eq!(summary.items.len(), 6);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.not_started, 4);
    assert_eq!(summary.done, 0);
    assert!(summary.is_partial());
    for report in summary.failed_items() {
        match &report.status {
            ItemStatus::Failed { stage, error } => {
                assert_eq!(*stage, Stage::Indexed, "{}", report.item_id);
                assert!(matches!(error, IngestError::Cancelled), "{:?}", error);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }
    let not_started = summary
        .items
        .iter()
        .filter(|r| matches!(r.status, ItemStatus::NotStarted))
        .count();
    assert_eq!(not_started, 4);
    assert_eq!(h.store.record_count(), 0);
    assert_eq!(h.store.upserts(), 0);
}

#[tokio::test]
async fn dry_run_chunks_without_writing() {
    let h = harness();
    h.reader.put("mem:doc.txt", "text/plain", three_pages(&page(2)));
    let mut dry = options();
    dry.dry_run = true;

    let summary = h
        .pipeline(dry)
        .run(vec!["mem:doc.txt".to_string()], &CancellationToken::new())
        .await;

    assert!(summary.dry_run);
    assert_eq!(summary.done, 1);
    assert_eq!(summary.chunks, 4);
    assert_eq!(summary.embedding_requests, 0);
    assert_eq!(h.store.record_count(), 0);
}

#[tokio::test]
async fn acl_mode_controls_record_acl() {
    let h = harness();
    let tags: Acl = ["group:eng".to_string()].into_iter().collect();
    h.reader
        .put_with_acl("mem:secret.txt", "text/plain", "restricted notes", tags);
    let locators = vec!["mem:secret.txt".to_string()];
    let cancel = CancellationToken::new();

    let mut with_acl = options();
    with_acl.default_acl = vec!["role:admin".to_string()];
    h.pipeline(with_acl).run(locators.clone(), &cancel).await;
    let records = h.store.records_for_item("mem:secret.txt").await.unwrap();
    let acl: Vec<&str> = records[0].acl.iter().map(String::as_str).collect();
    assert_eq!(acl, vec!["group:eng", "role:admin"]);

    // Turning ACLs off changes the settings digest, so the item is reprocessed
    // and its vectors are reused.
    h.store.reset_counters();
    let mut no_acl = options();
    no_acl.acl = false;
    let summary = h.pipeline(no_acl).run(locators, &cancel).await;
    let records = h.store.records_for_item("mem:secret.txt").await.unwrap();
    assert!(records[0].acl.is_empty());
    assert_eq!(h.store.upserts(), 1);
    assert_eq!(summary.embedding_requests, 0);
}

#[tokio::test]
async fn failed_write_is_reported_and_retried_next_run() {
    let h = harness();
    h.reader.put("mem:doc.txt", "text/plain", three_pages(&page(2)));
    // Window [160,260) of the concatenated pages.
    let text = format!("{}\n\n{}\n\n{}", page(1), page(2), page(3));
    let third: String = text.chars().skip(160).take(100).collect();
    h.store
        .fail_record(&record_id("mem:doc.txt", &content_hash(&third, None), 0));
    let locators = vec!["mem:doc.txt".to_string()];
    let cancel = CancellationToken::new();

    let first = h.pipeline(options()).run(locators.clone(), &cancel).await;
    match &first.items[0].status {
        ItemStatus::Failed { stage, error } => {
            assert_eq!(*stage, Stage::Indexed);
            match error {
                IngestError::IndexWrite { failures } => assert_eq!(failures.len(), 1),
                other => panic!("expected index write error, got {:?}", other),
            }
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(h.store.record_count(), 3);

    h.store.heal();
    let second = h.pipeline(options()).run(locators, &cancel).await;
    assert_eq!(second.done, 1);
    assert_eq!(second.upserted, 1);
    assert_eq!(h.store.record_count(), 4);
}
