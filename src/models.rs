//! Core data models used throughout the ingestion pipeline.
//!
//! These types represent the items, pages, chunks, and index records that
//! flow from the source readers through parsing, chunking, embedding, and
//! reconciliation.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Set of principal identifiers permitted to read an item or chunk.
pub type Acl = BTreeSet<String>;

/// Raw item produced by a source reader. Immutable once read.
#[derive(Debug, Clone)]
pub struct SourceItem {
    /// Locator string, e.g. `file:docs/guide.md` or `s3://bucket/key`.
    pub id: String,
    /// Display name (file name or last key segment).
    pub name: String,
    pub content: Vec<u8>,
    pub content_type: String,
    pub last_modified: DateTime<Utc>,
    /// Empty when ACL mode is off.
    pub acl: Acl,
    /// SHA-256 of `content`, hex encoded.
    pub content_digest: String,
}

impl SourceItem {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        content: Vec<u8>,
        content_type: impl Into<String>,
        last_modified: DateTime<Utc>,
    ) -> Self {
        let content_digest = sha256_hex(&content);
        Self {
            id: id.into(),
            name: name.into(),
            content,
            content_type: content_type.into(),
            last_modified,
            acl: Acl::new(),
            content_digest,
        }
    }

    pub fn with_acl(mut self, acl: Acl) -> Self {
        self.acl = acl;
        self
    }
}

/// An image attached to a page or chunk (vision mode).
#[derive(Debug, Clone)]
pub struct ImageRef {
    pub name: String,
    pub mime: String,
    pub data: Arc<[u8]>,
    /// SHA-256 of `data`, hex encoded.
    pub digest: String,
}

impl ImageRef {
    pub fn new(name: impl Into<String>, mime: impl Into<String>, data: Vec<u8>) -> Self {
        let digest = sha256_hex(&data);
        Self {
            name: name.into(),
            mime: mime.into(),
            data: data.into(),
            digest,
        }
    }
}

/// Ordered unit extracted from a source item by a format parser.
#[derive(Debug, Clone)]
pub struct Page {
    /// 1-based ordinal within the item.
    pub number: u32,
    pub text: String,
    /// Heading-derived section title, for citation display.
    pub heading: Option<String>,
    pub image: Option<ImageRef>,
}

impl Page {
    pub fn new(number: u32, text: impl Into<String>) -> Self {
        Self {
            number,
            text: text.into(),
            heading: None,
            image: None,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// The unit of retrieval: a bounded span of an item's text.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub item_id: String,
    /// 0-based sequence index within the item.
    pub index: usize,
    pub text: String,
    pub page_start: u32,
    pub page_end: u32,
    pub heading: Option<String>,
    pub image: Option<ImageRef>,
    pub acl: Acl,
    /// See [`content_hash`](crate::chunk::content_hash).
    pub content_hash: String,
}

/// Persisted representation of an embedded chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    pub id: String,
    pub item_id: String,
    pub chunk_index: usize,
    pub text: String,
    pub page_start: u32,
    pub page_end: u32,
    pub heading: Option<String>,
    pub image_name: Option<String>,
    pub acl: Acl,
    pub content_hash: String,
    pub vector: Vec<f32>,
    pub model: String,
    pub updated_at: i64,
}

/// Per-item fingerprint stored after a fully successful index apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemState {
    pub item_id: String,
    pub content_digest: String,
    pub settings_digest: String,
    pub last_modified: i64,
    pub record_count: usize,
}

/// Deterministic record id for the `occurrence`-th chunk with
/// `content_hash` in an item. The chunk's position is not part of the id,
/// so a chunk that moves keeps its record.
pub fn record_id(item_id: &str, content_hash: &str, occurrence: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(item_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(content_hash.as_bytes());
    hasher.update([0x1f]);
    hasher.update(occurrence.to_le_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..32].to_string()
}

/// Hex-encoded SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_id_is_stable_and_content_specific() {
        let a = record_id("file:a.md", "h1", 0);
        assert_eq!(a, record_id("file:a.md", "h1", 0));
        assert_ne!(a, record_id("file:a.md", "h1", 1));
        assert_ne!(a, record_id("file:a.md", "h2", 0));
        assert_ne!(a, record_id("file:b.md", "h1", 0));
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn source_item_digest_tracks_content() {
        let ts = Utc::now();
        let a = SourceItem::new("x", "x", b"hello".to_vec(), "text/plain", ts);
        let b = SourceItem::new("x", "x", b"hello".to_vec(), "text/plain", ts);
        let c = SourceItem::new("x", "x", b"hullo".to_vec(), "text/plain", ts);
        assert_eq!(a.content_digest, b.content_digest);
        assert_ne!(a.content_digest, c.content_digest);
    }
}
