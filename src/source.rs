//! Source readers and locator routing.
//!
//! A *locator* names one source item: `file:docs/guide.md` for the local
//! filesystem, `s3://bucket/key` for S3. A *pattern* names a set of items
//! and is expanded to locators by [`SourceReader::discover`].
//!
//! [`SourceRouter`] is itself a [`SourceReader`] that dispatches on the
//! locator scheme, so the orchestrator only ever holds one reader.

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::IngestError;
use crate::models::{Acl, SourceItem};

/// Opens source items and expands patterns into locators.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Expand a pattern (file, directory, glob, or prefix) into sorted,
    /// de-duplicated locators. Failures here are fatal to the run.
    async fn discover(&self, pattern: &str) -> Result<Vec<String>>;

    /// Read one item's bytes and metadata.
    async fn open(&self, locator: &str) -> Result<SourceItem, IngestError>;
}

/// Dispatches `s3://` locators to the S3 reader and everything else to the
/// filesystem reader.
pub struct SourceRouter {
    fs: Arc<dyn SourceReader>,
    s3: Option<Arc<dyn SourceReader>>,
}

impl SourceRouter {
    pub fn new(fs: Arc<dyn SourceReader>, s3: Option<Arc<dyn SourceReader>>) -> Self {
        Self { fs, s3 }
    }

    fn route(&self, locator: &str) -> Option<&Arc<dyn SourceReader>> {
        if is_s3_locator(locator) {
            self.s3.as_ref()
        } else {
            Some(&self.fs)
        }
    }
}

#[async_trait]
impl SourceReader for SourceRouter {
    async fn discover(&self, pattern: &str) -> Result<Vec<String>> {
        let reader = self
            .route(pattern)
            .ok_or_else(|| anyhow!("S3 locator '{}' given but no S3 source is configured", pattern))?;
        reader.discover(pattern).await
    }

    async fn open(&self, locator: &str) -> Result<SourceItem, IngestError> {
        match self.route(locator) {
            Some(reader) => reader.open(locator).await,
            None => Err(IngestError::Source(format!(
                "no S3 source configured for {}",
                locator
            ))),
        }
    }
}

pub fn is_s3_locator(locator: &str) -> bool {
    locator.starts_with("s3://")
}

/// Detect a MIME type from an item name.
///
/// Text formats are mapped explicitly. Everything else falls back to
/// `mime_guess`.
pub fn detect_content_type(name: &str) -> String {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    let mime = match ext.as_deref() {
        Some("md" | "markdown") => "text/markdown",
        Some("txt" | "text") => "text/plain",
        Some("json") => "application/json",
        Some("html" | "htm") => "text/html",
        _ => mime_guess::from_path(name)
            .first_raw()
            .unwrap_or("application/octet-stream"),
    };
    mime.to_string()
}

/// Parse ACL principals: one per line or comma-separated, `#` starts a comment.
pub fn parse_acl_tags(raw: &str) -> Acl {
    raw.lines()
        .map(|line| line.split('#').next().unwrap_or(""))
        .flat_map(|line| line.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn has_glob_meta(s: &str) -> bool {
    s.chars().any(|c| matches!(c, '*' | '?' | '[' | '{'))
}

pub(crate) fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
