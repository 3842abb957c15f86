//! Index storage abstraction.
//!
//! The [`IndexStore`] trait is everything the index manager and the CLI need
//! from a backend: per-item record listing, single-record upsert, reposition
//! and delete, and the per-item fingerprint used for fast skips.
//!
//! | Implementation | Use |
//! |----------------|-----|
//! | [`SqliteIndexStore`] | the `ingest` binary |
//! | [`InMemoryIndexStore`] | tests and embedding the pipeline in other programs |
//!
//! Implementations must be `Send + Sync`; the orchestrator shares one store
//! across concurrently processed items.

mod memory;
mod sqlite;

pub use memory::InMemoryIndexStore;
pub use sqlite::SqliteIndexStore;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{IndexRecord, ItemState};

/// One indexed item as reported by [`IndexStore::list_items`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemSummary {
    pub item_id: String,
    pub record_count: usize,
}

#[async_trait]
pub trait IndexStore: Send + Sync {
    /// All records of an item, ordered by chunk index.
    async fn records_for_item(&self, item_id: &str) -> Result<Vec<IndexRecord>>;

    /// Insert a record or overwrite the record with the same id.
    async fn upsert_record(&self, record: &IndexRecord) -> Result<()>;

    /// Move an existing record to a new chunk index and page provenance
    /// without touching its text, vector or ACL.
    async fn reposition_record(
        &self,
        record_id: &str,
        chunk_index: usize,
        page_start: u32,
        page_end: u32,
        heading: Option<&str>,
    ) -> Result<()>;

    /// Delete a record by id. Deleting a missing record is not an error.
    async fn delete_record(&self, record_id: &str) -> Result<()>;

    async fn item_state(&self, item_id: &str) -> Result<Option<ItemState>>;

    async fn put_item_state(&self, state: &ItemState) -> Result<()>;

    async fn delete_item_state(&self, item_id: &str) -> Result<()>;

    /// Every item that has records or a stored state, ordered by id.
    async fn list_items(&self) -> Result<Vec<ItemSummary>>;
}
