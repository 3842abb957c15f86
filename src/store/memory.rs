//! In-memory [`IndexStore`] for tests and embedding.
//!
//! Records and states live in maps behind `std::sync::RwLock`. Every
//! successful upsert, reposition and delete is counted, and writes to chosen record ids
//! can be made to fail, which is how partial-failure behaviour is tested.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::models::{IndexRecord, ItemState};

use super::{IndexStore, ItemSummary};

#[derive(Default)]
pub struct InMemoryIndexStore {
    records: RwLock<BTreeMap<String, IndexRecord>>,
    states: RwLock<BTreeMap<String, ItemState>>,
    failing: RwLock<HashSet<String>>,
    upserts: AtomicUsize,
    repositions: AtomicUsize,
    deletes: AtomicUsize,
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory index lock poisoned")
}

impl InMemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful record upserts so far.
    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    /// Successful repositions so far.
    pub fn repositions(&self) -> usize {
        self.repositions.load(Ordering::SeqCst)
    }

    /// Successful record deletes so far.
    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.upserts.store(0, Ordering::SeqCst);
        self.repositions.store(0, Ordering::SeqCst);
        self.deletes.store(0, Ordering::SeqCst);
    }

    /// Make every write to `record_id` fail until [`heal`](Self::heal).
    pub fn fail_record(&self, record_id: &str) {
        if let Ok(mut failing) = self.failing.write() {
            failing.insert(record_id.to_string());
        }
    }

    pub fn heal(&self) {
        if let Ok(mut failing) = self.failing.write() {
            failing.clear();
        }
    }

    /// Number of stored records across all items.
    pub fn record_count(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    fn check_writable(&self, record_id: &str) -> Result<()> {
        if self.failing.read().map_err(poisoned)?.contains(record_id) {
            bail!("injected write failure for {}", record_id);
        }
        Ok(())
    }
}

#[async_trait]
impl IndexStore for InMemoryIndexStore {
    async fn records_for_item(&self, item_id: &str) -> Result<Vec<IndexRecord>> {
        let records = self.records.read().map_err(poisoned)?;
        let mut found: Vec<IndexRecord> = records
            .values()
            .filter(|r| r.item_id == item_id)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.chunk_index);
        Ok(found)
    }

    async fn upsert_record(&self, record: &IndexRecord) -> Result<()> {
        self.check_writable(&record.id)?;
        self.records
            .write()
            .map_err(poisoned)?
            .insert(record.id.clone(), record.clone());
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reposition_record(
        &self,
        record_id: &str,
        chunk_index: usize,
        page_start: u32,
        page_end: u32,
        heading: Option<&str>,
    ) -> Result<()> {
        self.check_writable(record_id)?;
        let mut records = self.records.write().map_err(poisoned)?;
        let record = records
            .get_mut(record_id)
            .ok_or_else(|| anyhow!("no record {}", record_id))?;
        record.chunk_index = chunk_index;
        record.page_start = page_start;
        record.page_end = page_end;
        record.heading = heading.map(str::to_string);
        self.repositions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_record(&self, record_id: &str) -> Result<()> {
        self.check_writable(record_id)?;
        if self.records.write().map_err(poisoned)?.remove(record_id).is_some() {
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn item_state(&self, item_id: &str) -> Result<Option<ItemState>> {
        Ok(self.states.read().map_err(poisoned)?.get(item_id).cloned())
    }

    async fn put_item_state(&self, state: &ItemState) -> Result<()> {
        self.states
            .write()
            .map_err(poisoned)?
            .insert(state.item_id.clone(), state.clone());
        Ok(())
    }

    async fn delete_item_state(&self, item_id: &str) -> Result<()> {
        self.states.write().map_err(poisoned)?.remove(item_id);
        Ok(())
    }

    async fn list_items(&self) -> Result<Vec<ItemSummary>> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for record in self.records.read().map_err(poisoned)?.values() {
            *counts.entry(record.item_id.clone()).or_default() += 1;
        }
        for item_id in self.states.read().map_err(poisoned)?.keys() {
            counts.entry(item_id.clone()).or_default();
        }
        Ok(counts
            .into_iter()
            .map(|(item_id, record_count)| ItemSummary {
                item_id,
                record_count,
            })
            .collect())
    }
}
