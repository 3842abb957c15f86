//! Batched, rate-limited, retrying front end over an [`EmbeddingProvider`].
//!
//! [`Embedder::embed_chunks`] turns a slice of chunks into vectors aligned
//! with the input: `vectors[i]` always belongs to `chunks[i]`, however the
//! batches were packed or in which order they completed.
//!
//! # Batching
//!
//! Chunk indices are sorted by text length (longest first, stable) and
//! packed greedily into batches bounded by `batch_size` texts and
//! `max_batch_tokens` approximate tokens.
//!
//! # Concurrency
//!
//! Batches of a single call run up to `parallelism` at a time. One
//! semaphore per embedder caps in-flight provider requests across every
//! item sharing it, and an optional `requests_per_minute` throttle spaces
//! request starts.
//!
//! # Retry
//!
//! Each provider call is retried up to `max_retries` times when the error is
//! retryable (rate limit, transient failure, timeout). The delay before retry
//! `n` is `min(backoff_max, backoff_base * 2^(n-1))`, jittered uniformly into
//! `[delay/2, delay]` and never shorter than a provider's `Retry-After`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use futures::stream::{self, StreamExt};
use rand::Rng;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::chunk::CHARS_PER_TOKEN;
use crate::config::EmbeddingConfig;
use crate::embedding::{l2_normalize, EmbeddingProvider, ProviderError};
use crate::error::IngestError;
use crate::models::{Chunk, ImageRef};

#[derive(Debug, Clone)]
pub struct EmbedderOptions {
    pub batch_size: usize,
    pub max_batch_tokens: usize,
    pub max_retries: u32,
    pub timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub parallelism: usize,
    pub requests_per_minute: Option<u32>,
    /// Combine page-image vectors into the vectors of chunks that carry one.
    pub vision: bool,
}

impl EmbedderOptions {
    pub fn from_config(config: &EmbeddingConfig, vision: bool) -> Self {
        Self {
            batch_size: config.batch_size,
            max_batch_tokens: config.max_batch_tokens,
            max_retries: config.max_retries,
            timeout: Duration::from_secs(config.timeout_secs),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            parallelism: config.parallelism,
            requests_per_minute: config.requests_per_minute,
            vision,
        }
    }
}

/// Spaces request starts at a fixed interval.
struct Throttle {
    interval: Duration,
    next: Mutex<Instant>,
}

impl Throttle {
    fn per_minute(rpm: u32) -> Self {
        Self {
            interval: Duration::from_secs(60) / rpm.max(1),
            next: Mutex::new(Instant::now()),
        }
    }

    async fn wait(&self) {
        let start = {
            let mut next = self.next.lock().await;
            let start = (*next).max(Instant::now());
            *next = start + self.interval;
            start
        };
        tokio::time::sleep_until(start).await;
    }
}

/// Provider call counters, shared across every item of a run.
#[derive(Debug, Default)]
pub struct EmbedderStats {
    pub requests: AtomicU64,
    pub retries: AtomicU64,
}

pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    options: EmbedderOptions,
    permits: Arc<Semaphore>,
    throttle: Option<Throttle>,
    stats: EmbedderStats,
}

impl Embedder {
    /// Fails when vision is requested from a provider without image support.
    pub fn new(provider: Arc<dyn EmbeddingProvider>, options: EmbedderOptions) -> anyhow::Result<Self> {
        if options.vision && !provider.supports_images() {
            bail!(
                "vision mode needs an image-capable embedding provider; '{}' is text only",
                provider.model_name()
            );
        }
        if options.batch_size == 0 || options.parallelism == 0 {
            bail!("embedding batch_size and parallelism must be >= 1");
        }
        Ok(Self {
            permits: Arc::new(Semaphore::new(options.parallelism)),
            throttle: options.requests_per_minute.map(Throttle::per_minute),
            provider,
            options,
            stats: EmbedderStats::default(),
        })
    }

    pub fn provider(&self) -> &dyn EmbeddingProvider {
        self.provider.as_ref()
    }

    pub fn stats(&self) -> &EmbedderStats {
        &self.stats
    }

    /// Embed every chunk, returning vectors in input order.
    pub async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>, IngestError> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let lengths: Vec<usize> = chunks.iter().map(|c| c.text.chars().count()).collect();
        let batches = plan_batches(&lengths, self.options.batch_size, self.options.max_batch_tokens);
        debug!(
            chunks = chunks.len(),
            batches = batches.len(),
            "embedding chunk batches"
        );

        let mut slots: Vec<Option<Vec<f32>>> = vec![None; chunks.len()];
        let mut results = stream::iter(batches)
            .map(|indices| async move {
                let texts: Vec<String> = indices.iter().map(|&i| chunks[i].text.clone()).collect();
                let vectors = self.embed_batch(&texts).await?;
                Ok::<_, IngestError>((indices, vectors))
            })
            .buffer_unordered(self.options.parallelism);

        while let Some(result) = results.next().await {
            let (indices, vectors) = result?;
            for (i, vector) in indices.into_iter().zip(vectors) {
                slots[i] = Some(vector);
            }
        }
        drop(results);

        if self.options.vision {
            self.add_image_vectors(chunks, &mut slots).await?;
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                v.ok_or_else(|| IngestError::EmbeddingFailed {
                    attempts: 0,
                    reason: format!("no vector produced for chunk {}", i),
                })
            })
            .collect()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IngestError> {
        let provider = self.provider.as_ref();
        let this = self;
        self.with_retry(move || async move {
            let vectors = provider.embed_texts(texts).await?;
            if vectors.len() != texts.len() {
                return Err(ProviderError::Fatal(format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    texts.len()
                )));
            }
            for v in &vectors {
                this.check_dims(v)?;
            }
            Ok::<_, ProviderError>(vectors)
        })
        .await
    }

    /// Sum each image-bearing chunk's text vector with its image vector and
    /// re-normalise. Identical images are embedded once.
    async fn add_image_vectors(
        &self,
        chunks: &[Chunk],
        slots: &mut [Option<Vec<f32>>],
    ) -> Result<(), IngestError> {
        let mut unique: HashMap<&str, &ImageRef> = HashMap::new();
        for image in chunks.iter().filter_map(|c| c.image.as_ref()) {
            unique.entry(image.digest.as_str()).or_insert(image);
        }
        if unique.is_empty() {
            return Ok(());
        }

        let provider = self.provider.as_ref();
        let this = self;
        let mut image_vectors: HashMap<&str, Vec<f32>> = HashMap::new();
        let mut results = stream::iter(unique.into_values())
            .map(|image| async move {
                let vector = this
                    .with_retry(move || async move {
                        let v = provider.embed_image(image).await?;
                        this.check_dims(&v)?;
                        Ok::<_, ProviderError>(v)
                    })
                    .await?;
                Ok::<_, IngestError>((image.digest.as_str(), vector))
            })
            .buffer_unordered(self.options.parallelism);
        while let Some(result) = results.next().await {
            let (digest, vector) = result?;
            image_vectors.insert(digest, vector);
        }
        drop(results);

        for (chunk, slot) in chunks.iter().zip(slots.iter_mut()) {
            let (Some(image), Some(text_vec)) = (chunk.image.as_ref(), slot.as_mut()) else {
                continue;
            };
            if let Some(image_vec) = image_vectors.get(image.digest.as_str()) {
                for (t, i) in text_vec.iter_mut().zip(image_vec) {
                    *t += i;
                }
                l2_normalize(text_vec);
            }
        }
        Ok(())
    }

    fn check_dims(&self, vector: &[f32]) -> Result<(), ProviderError> {
        let expected = self.provider.dims();
        if vector.len() != expected {
            return Err(ProviderError::Fatal(format!(
                "dimension mismatch: provider '{}' declares {} dims, got {}",
                self.provider.model_name(),
                expected,
                vector.len()
            )));
        }
        Ok(())
    }

    /// Run `call` under the shared permit, throttle, and per-call timeout,
    /// retrying retryable failures with jittered exponential backoff.
    async fn with_retry<T, F, Fut>(&self, mut call: F) -> Result<T, IngestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let outcome = {
                let _permit = self.permits.acquire().await.map_err(|_| IngestError::EmbeddingFailed {
                    attempts: attempt,
                    reason: "embedder closed".to_string(),
                })?;
                if let Some(throttle) = &self.throttle {
                    throttle.wait().await;
                }
                self.stats.requests.fetch_add(1, Ordering::Relaxed);
                match tokio::time::timeout(self.options.timeout, call()).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout(self.options.timeout)),
                }
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            attempt += 1;
            if !err.is_retryable() || attempt > self.options.max_retries {
                return Err(IngestError::EmbeddingFailed {
                    attempts: attempt,
                    reason: err.to_string(),
                });
            }

            let delay = backoff_delay(
                attempt,
                self.options.backoff_base,
                self.options.backoff_max,
                &err,
            );
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "embedding call failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Delay before retry number `attempt` (1-based).
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration, err: &ProviderError) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(20);
    let capped = base.saturating_mul(factor).min(max);
    let ms = capped.as_millis() as u64;
    let jittered = Duration::from_millis(rand::thread_rng().gen_range(ms / 2..=ms));
    match err {
        ProviderError::RateLimited {
            retry_after: Some(retry_after),
        } => jittered.max(*retry_after),
        _ => jittered,
    }
}

fn approx_tokens(chars: usize) -> usize {
    chars.div_ceil(CHARS_PER_TOKEN).max(1)
}

/// Group chunk indices into batches, longest texts first.
///
/// A batch closes when it holds `batch_size` texts or the next text would
/// push it past `max_batch_tokens`. A single text larger than the token
/// budget still gets a batch of its own.
pub fn plan_batches(lengths: &[usize], batch_size: usize, max_batch_tokens: usize) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..lengths.len()).collect();
    order.sort_by(|&a, &b| lengths[b].cmp(&lengths[a]));

    let mut batches = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut tokens = 0usize;
    for i in order {
        let t = approx_tokens(lengths[i]);
        if !current.is_empty() && (current.len() >= batch_size || tokens + t > max_batch_tokens) {
            batches.push(std::mem::take(&mut current));
            tokens = 0;
        }
        current.push(i);
        tokens += t;
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Acl;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn chunk(index: usize, text: &str) -> Chunk {
        Chunk {
            item_id: "file:t.txt".to_string(),
            index,
            text: text.to_string(),
            page_start: 1,
            page_end: 1,
            heading: None,
            image: None,
            acl: Acl::new(),
            content_hash: crate::chunk::content_hash(text, None),
        }
    }

    fn options() -> EmbedderOptions {
        EmbedderOptions {
            batch_size: 2,
            max_batch_tokens: 1000,
            max_retries: 3,
            timeout: Duration::from_secs(5),
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
            parallelism: 3,
            requests_per_minute: None,
            vision: false,
        }
    }

    /// Encodes each text as `[len, first char]`, failing the first
    /// `failures` calls with `error`.
    struct Scripted {
        failures: usize,
        error: ProviderError,
        calls: AtomicUsize,
        dims: usize,
        images: bool,
    }

    impl Scripted {
        fn ok() -> Self {
            Self::failing(0, ProviderError::Transient("unused".into()))
        }

        fn failing(failures: usize, error: ProviderError) -> Self {
            Self {
                failures,
                error,
                calls: AtomicUsize::new(0),
                dims: 2,
                images: false,
            }
        }

        fn encode(text: &str) -> Vec<f32> {
            vec![
                text.chars().count() as f32,
                text.chars().next().map(|c| c as u32 as f32).unwrap_or(0.0),
            ]
        }
    }

    #[async_trait]
    impl EmbeddingProvider for Scripted {
        fn model_name(&self) -> &str {
            "scripted"
        }
        fn dims(&self) -> usize {
            self.dims
        }
        fn supports_images(&self) -> bool {
            self.images
        }
        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(self.error.clone());
            }
            // Shorter batches finish first so completion order differs from submission order.
            tokio::time::sleep(Duration::from_millis(texts[0].len() as u64 % 7)).await;
            Ok(texts.iter().map(|t| Self::encode(t)).collect())
        }
        async fn embed_image(&self, _image: &ImageRef) -> Result<Vec<f32>, ProviderError> {
            Ok(vec![0.0, 1.0])
        }
    }

    #[test]
    fn batches_respect_count_and_token_limits() {
        let lengths = [40, 400, 8, 400, 40];
        let batches = plan_batches(&lengths, 2, 150);
        // 400 chars = 100 tokens, so the two long texts never share a batch.
        assert_eq!(batches, vec![vec![1], vec![3, 0], vec![4, 2]]);
        let all: usize = batches.iter().map(|b| b.len()).sum();
        assert_eq!(all, lengths.len());
    }

    #[test]
    fn oversized_text_gets_its_own_batch() {
        assert_eq!(plan_batches(&[10_000, 4], 8, 100), vec![vec![0], vec![1]]);
    }

    #[test]
    fn backoff_grows_caps_and_honours_retry_after() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(1000);
        let transient = ProviderError::Transient("x".into());
        for _ in 0..20 {
            let d = backoff_delay(3, base, max, &transient);
            assert!(d >= Duration::from_millis(200) && d <= Duration::from_millis(400));
            let d = backoff_delay(10, base, max, &transient);
            assert!(d >= Duration::from_millis(500) && d <= max);
        }
        let limited = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(5)),
        };
        assert_eq!(backoff_delay(1, base, max, &limited), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn vectors_stay_aligned_under_batching() {
        let texts = [
            "alpha", "b", "charlie delta", "echo", "foxtrot golf hotel", "india", "j", "kilo lima",
        ];
        let chunks: Vec<Chunk> = texts.iter().enumerate().map(|(i, t)| chunk(i, t)).collect();
        let embedder = Embedder::new(Arc::new(Scripted::ok()), options()).unwrap();

        let vectors = embedder.embed_chunks(&chunks).await.unwrap();
        assert_eq!(vectors.len(), chunks.len());
        for (c, v) in chunks.iter().zip(&vectors) {
            assert_eq!(v, &Scripted::encode(&c.text), "misaligned vector for {:?}", c.text);
        }
        assert_eq!(embedder.stats().requests.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn rate_limited_twice_then_succeeds() {
        let provider = Arc::new(Scripted::failing(
            2,
            ProviderError::RateLimited { retry_after: None },
        ));
        let embedder = Embedder::new(provider.clone(), options()).unwrap();

        let vectors = embedder.embed_chunks(&[chunk(0, "hello")]).await.unwrap();
        assert_eq!(vectors, vec![Scripted::encode("hello")]);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(embedder.stats().retries.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_item() {
        let provider = Arc::new(Scripted::failing(100, ProviderError::Transient("503".into())));
        let embedder = Embedder::new(provider.clone(), options()).unwrap();

        match embedder.embed_chunks(&[chunk(0, "x")]).await {
            Err(IngestError::EmbeddingFailed { attempts, .. }) => assert_eq!(attempts, 4),
            other => panic!("expected EmbeddingFailed, got {:?}", other),
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let provider = Arc::new(Scripted::failing(100, ProviderError::Fatal("bad key".into())));
        let embedder = Embedder::new(provider.clone(), options()).unwrap();

        let err = embedder.embed_chunks(&[chunk(0, "x")]).await.unwrap_err();
        assert!(matches!(err, IngestError::EmbeddingFailed { attempts: 1, .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_fatal() {
        let mut provider = Scripted::ok();
        provider.dims = 3;
        let provider = Arc::new(provider);
        let embedder = Embedder::new(provider.clone(), options()).unwrap();

        match embedder.embed_chunks(&[chunk(0, "x")]).await {
            Err(IngestError::EmbeddingFailed { attempts, reason }) => {
                assert_eq!(attempts, 1);
                assert!(reason.contains("dimension mismatch"));
            }
            other => panic!("expected EmbeddingFailed, got {:?}", other),
        }
    }

    struct Slow;

    #[async_trait]
    impl EmbeddingProvider for Slow {
        fn model_name(&self) -> &str {
            "slow"
        }
        fn dims(&self) -> usize {
            1
        }
        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(texts.iter().map(|_| vec![1.0]).collect())
        }
    }

    #[tokio::test]
    async fn slow_calls_time_out_and_count_as_retryable() {
        let mut opts = options();
        opts.timeout = Duration::from_millis(20);
        opts.max_retries = 1;
        let embedder = Embedder::new(Arc::new(Slow), opts).unwrap();

        match embedder.embed_chunks(&[chunk(0, "x")]).await {
            Err(IngestError::EmbeddingFailed { attempts, reason }) => {
                assert_eq!(attempts, 2);
                assert!(reason.contains("timed out"));
            }
            other => panic!("expected timeout failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn vision_sums_text_and_image_vectors() {
        let mut provider = Scripted::ok();
        provider.images = true;
        let mut opts = options();
        opts.vision = true;
        let embedder = Embedder::new(Arc::new(provider), opts).unwrap();

        let mut with_image = chunk(0, "abc");
        with_image.image = Some(ImageRef::new("p1.jpg", "image/jpeg", vec![1, 2, 3]));
        let plain = chunk(1, "abc");

        let vectors = embedder.embed_chunks(&[with_image, plain]).await.unwrap();
        let text = Scripted::encode("abc");
        let mut expected = vec![text[0], text[1] + 1.0];
        l2_normalize(&mut expected);
        assert_eq!(vectors[0], expected);
        assert_eq!(vectors[1], text);
    }

    #[test]
    fn vision_needs_image_support() {
        let mut opts = options();
        opts.vision = true;
        assert!(Embedder::new(Arc::new(Scripted::ok()), opts).is_err());
    }

    #[tokio::test]
    async fn throttle_spaces_request_starts() {
        let throttle = Throttle::per_minute(1200); // 50ms apart
        let start = Instant::now();
        throttle.wait().await;
        throttle.wait().await;
        throttle.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
