//! Reconciliation of freshly chunked items against stored index records.
//!
//! New chunks are matched to the item's stored records by content hash,
//! preferring a record already in the same sequence slot. Then:
//!
//! - hash match with the same ACL, model and provenance: untouched
//! - hash match that only moved (index, pages or heading): repositioned in
//!   place, keeping text and vector
//! - hash match with a different ACL: upsert over the matched record,
//!   reusing its vector
//! - no hash match: upsert, overwriting an unmatched record from the same
//!   slot when there is one, otherwise under a fresh
//!   [`record_id`](crate::models::record_id)
//! - stored records left unmatched: delete
//!
//! The diff is computed by [`IndexManager::plan`] *before* embedding, so only
//! changed chunks reach the provider.
//!
//! [`IndexManager::apply`] attempts every write independently and reports all
//! per-record failures together as one [`IngestError::IndexWrite`].

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tracing::{debug, warn};

use crate::embedder::Embedder;
use crate::error::{IngestError, RecordFailure, RecordOp};
use crate::models::{record_id, Chunk, IndexRecord, ItemState};
use crate::store::IndexStore;

/// A chunk that must be (re)written.
#[derive(Debug, Clone)]
pub struct PlannedUpsert {
    /// Position of the chunk in the slice passed to [`IndexManager::plan`].
    pub position: usize,
    pub record_id: String,
    /// Stored vector for an identical chunk, when one exists.
    pub reused_vector: Option<Vec<f32>>,
}

/// A stored record whose chunk moved without changing content.
#[derive(Debug, Clone)]
pub struct PlannedReposition {
    pub position: usize,
    pub record_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    pub item_id: String,
    pub unchanged: usize,
    pub upserts: Vec<PlannedUpsert>,
    pub repositions: Vec<PlannedReposition>,
    /// Record ids to delete.
    pub deletes: Vec<String>,
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        self.upserts.is_empty() && self.repositions.is_empty() && self.deletes.is_empty()
    }

    /// Chunk positions that need a fresh vector, in plan order.
    pub fn needs_embedding(&self) -> Vec<usize> {
        self.upserts
            .iter()
            .filter(|u| u.reused_vector.is_none())
            .map(|u| u.position)
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub upserted: usize,
    pub repositioned: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub reused_vectors: usize,
    pub embedded: usize,
}

impl ReconcileReport {
    /// Every store write, repositions included.
    pub fn mutations(&self) -> usize {
        self.upserted + self.repositioned + self.deleted
    }
}

pub struct IndexManager {
    store: Arc<dyn IndexStore>,
    model: String,
    write_timeout: Duration,
}

impl IndexManager {
    /// `model` is recorded on every written record; stored records from a
    /// different model are never considered current.
    pub fn new(store: Arc<dyn IndexStore>, model: impl Into<String>, write_timeout: Duration) -> Self {
        Self {
            store,
            model: model.into(),
            write_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn IndexStore> {
        &self.store
    }

    async fn timed<T>(&self, op: impl Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
        match tokio::time::timeout(self.write_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("index store call timed out after {:?}", self.write_timeout)),
        }
    }

    fn read_failure(item_id: &str, err: anyhow::Error) -> IngestError {
        IngestError::IndexWrite {
            failures: vec![RecordFailure {
                record_id: item_id.to_string(),
                op: RecordOp::Read,
                reason: format!("{:#}", err),
            }],
        }
    }

    /// Diff `chunks` (all chunks of one item, in order) against the store.
    pub async fn plan(&self, item_id: &str, chunks: &[Chunk]) -> Result<ReconcilePlan, IngestError> {
        let existing = self
            .timed(self.store.records_for_item(item_id))
            .await
            .map_err(|e| Self::read_failure(item_id, e))?;

        // Same-model records by content hash, in chunk order.
        let mut by_hash: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, record) in existing.iter().enumerate() {
            if record.model == self.model {
                by_hash.entry(record.content_hash.as_str()).or_default().push(i);
            }
        }

        let mut claimed = vec![false; existing.len()];
        let mut matched: Vec<Option<usize>> = vec![None; chunks.len()];
        for same_slot in [true, false] {
            for (position, chunk) in chunks.iter().enumerate() {
                if matched[position].is_some() {
                    continue;
                }
                let Some(candidates) = by_hash.get(chunk.content_hash.as_str()) else {
                    continue;
                };
                let found = candidates.iter().copied().find(|&i| {
                    !claimed[i] && (!same_slot || existing[i].chunk_index == chunk.index)
                });
                if let Some(i) = found {
                    claimed[i] = true;
                    matched[position] = Some(i);
                }
            }
        }

        let mut free_slots: HashMap<usize, usize> = HashMap::new();
        for (i, record) in existing.iter().enumerate() {
            if !claimed[i] {
                free_slots.entry(record.chunk_index).or_insert(i);
            }
        }
        let mut taken: HashSet<String> = existing.iter().map(|r| r.id.clone()).collect();

        let mut plan = ReconcilePlan {
            item_id: item_id.to_string(),
            ..Default::default()
        };

        for (position, chunk) in chunks.iter().enumerate() {
            if let Some(i) = matched[position] {
                let record = &existing[i];
                if record.acl != chunk.acl {
                    plan.upserts.push(PlannedUpsert {
                        position,
                        record_id: record.id.clone(),
                        reused_vector: Some(record.vector.clone()),
                    });
                } else if Self::same_position(record, chunk) {
                    plan.unchanged += 1;
                } else {
                    plan.repositions.push(PlannedReposition {
                        position,
                        record_id: record.id.clone(),
                    });
                }
                continue;
            }

            let record_id = match free_slots.remove(&chunk.index) {
                Some(i) => {
                    claimed[i] = true;
                    existing[i].id.clone()
                }
                None => fresh_record_id(item_id, &chunk.content_hash, &mut taken),
            };
            let reused_vector = by_hash
                .get(chunk.content_hash.as_str())
                .and_then(|c| c.first())
                .map(|&i| existing[i].vector.clone());
            plan.upserts.push(PlannedUpsert {
                position,
                record_id,
                reused_vector,
            });
        }

        plan.deletes = existing
            .iter()
            .zip(&claimed)
            .filter(|(_, claimed)| !**claimed)
            .map(|(r, _)| r.id.clone())
            .collect();

        debug!(
            item = item_id,
            unchanged = plan.unchanged,
            upserts = plan.upserts.len(),
            repositions = plan.repositions.len(),
            deletes = plan.deletes.len(),
            "reconcile plan"
        );
        Ok(plan)
    }

    fn same_position(record: &IndexRecord, chunk: &Chunk) -> bool {
        record.chunk_index == chunk.index
            && record.page_start == chunk.page_start
            && record.page_end == chunk.page_end
            && record.heading == chunk.heading
    }

    /// Write the plan. `fresh` holds one vector per entry of
    /// [`ReconcilePlan::needs_embedding`], in the same order.
    pub async fn apply(
        &self,
        chunks: &[Chunk],
        plan: &ReconcilePlan,
        fresh: Vec<Vec<f32>>,
    ) -> Result<ReconcileReport, IngestError> {
        let needed = plan.needs_embedding().len();
        if fresh.len() != needed {
            return Err(IngestError::EmbeddingFailed {
                attempts: 0,
                reason: format!("expected {} vectors, got {}", needed, fresh.len()),
            });
        }

        let now = chrono::Utc::now().timestamp();
        let mut fresh = fresh.into_iter();
        let mut report = ReconcileReport {
            unchanged: plan.unchanged,
            embedded: needed,
            ..Default::default()
        };
        let mut failures = Vec::new();

        for upsert in &plan.upserts {
            let chunk = &chunks[upsert.position];
            let vector = match &upsert.reused_vector {
                Some(v) => {
                    report.reused_vectors += 1;
                    v.clone()
                }
                None => fresh.next().unwrap_or_default(),
            };
            let record = IndexRecord {
                id: upsert.record_id.clone(),
                item_id: chunk.item_id.clone(),
                chunk_index: chunk.index,
                text: chunk.text.clone(),
                page_start: chunk.page_start,
                page_end: chunk.page_end,
                heading: chunk.heading.clone(),
                image_name: chunk.image.as_ref().map(|i| i.name.clone()),
                acl: chunk.acl.clone(),
                content_hash: chunk.content_hash.clone(),
                vector,
                model: self.model.clone(),
                updated_at: now,
            };
            match self.timed(self.store.upsert_record(&record)).await {
                Ok(()) => report.upserted += 1,
                Err(e) => failures.push(RecordFailure {
                    record_id: record.id,
                    op: RecordOp::Upsert,
                    reason: format!("{:#}", e),
                }),
            }
        }

        for moved in &plan.repositions {
            let chunk = &chunks[moved.position];
            let write = self.store.reposition_record(
                &moved.record_id,
                chunk.index,
                chunk.page_start,
                chunk.page_end,
                chunk.heading.as_deref(),
            );
            match self.timed(write).await {
                Ok(()) => report.repositioned += 1,
                Err(e) => failures.push(RecordFailure {
                    record_id: moved.record_id.clone(),
                    op: RecordOp::Reposition,
                    reason: format!("{:#}", e),
                }),
            }
        }

        for id in &plan.deletes {
            match self.timed(self.store.delete_record(id)).await {
                Ok(()) => report.deleted += 1,
                Err(e) => failures.push(RecordFailure {
                    record_id: id.clone(),
                    op: RecordOp::Delete,
                    reason: format!("{:#}", e),
                }),
            }
        }

        if !failures.is_empty() {
            warn!(
                item = %plan.item_id,
                failed = failures.len(),
                upserted = report.upserted,
                repositioned = report.repositioned,
                deleted = report.deleted,
                "index writes failed"
            );
            return Err(IngestError::IndexWrite { failures });
        }
        Ok(report)
    }

    /// Plan, embed whatever changed, and apply.
    pub async fn reconcile(
        &self,
        item_id: &str,
        chunks: &[Chunk],
        embedder: &Embedder,
    ) -> Result<ReconcileReport, IngestError> {
        let plan = self.plan(item_id, chunks).await?;
        let to_embed: Vec<Chunk> = plan
            .needs_embedding()
            .into_iter()
            .map(|i| chunks[i].clone())
            .collect();
        let vectors = embedder.embed_chunks(&to_embed).await?;
        self.apply(chunks, &plan, vectors).await
    }

    /// Delete every record of an item and its stored state.
    /// Returns the number of records removed.
    pub async fn remove_item(&self, item_id: &str) -> Result<usize, IngestError> {
        let existing = self
            .timed(self.store.records_for_item(item_id))
            .await
            .map_err(|e| Self::read_failure(item_id, e))?;
        let plan = ReconcilePlan {
            item_id: item_id.to_string(),
            deletes: existing.into_iter().map(|r| r.id).collect(),
            ..Default::default()
        };
        let report = self.apply(&[], &plan, Vec::new()).await?;
        self.timed(self.store.delete_item_state(item_id))
            .await
            .map_err(|e| IngestError::IndexWrite {
                failures: vec![RecordFailure {
                    record_id: item_id.to_string(),
                    op: RecordOp::Delete,
                    reason: format!("{:#}", e),
                }],
            })?;
        Ok(report.deleted)
    }

    pub async fn item_state(&self, item_id: &str) -> Result<Option<ItemState>, IngestError> {
        self.timed(self.store.item_state(item_id))
            .await
            .map_err(|e| Self::read_failure(item_id, e))
    }

    pub async fn save_item_state(&self, state: &ItemState) -> Result<(), IngestError> {
        self.timed(self.store.put_item_state(state))
            .await
            .map_err(|e| IngestError::IndexWrite {
                failures: vec![RecordFailure {
                    record_id: state.item_id.clone(),
                    op: RecordOp::Upsert,
                    reason: format!("item state: {:#}", e),
                }],
            })
    }
}

/// Smallest-occurrence id for `content_hash` not already used by the item.
fn fresh_record_id(item_id: &str, content_hash: &str, taken: &mut HashSet<String>) -> String {
    let mut occurrence = 0;
    loop {
        let id = record_id(item_id, content_hash, occurrence);
        if taken.insert(id.clone()) {
            return id;
        }
        occurrence += 1;
    }
}
