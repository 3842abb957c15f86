//! SQLite-backed [`IndexStore`].
//!
//! Records live in `index_records` (vectors as little-endian f32 BLOBs, ACLs
//! as a JSON array), fingerprints in `item_states`. See
//! [`run_migrations`](crate::migrate::run_migrations) for the schema.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::models::{Acl, IndexRecord, ItemState};

use super::{IndexStore, ItemSummary};

pub struct SqliteIndexStore {
    pool: SqlitePool,
}

impl SqliteIndexStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn record_from_row(row: &SqliteRow) -> Result<IndexRecord> {
    let acl_json: String = row.get("acl");
    let acl: Acl = serde_json::from_str(&acl_json)
        .with_context(|| format!("Corrupt acl column: {}", acl_json))?;
    let blob: Vec<u8> = row.get("vector");
    Ok(IndexRecord {
        id: row.get("id"),
        item_id: row.get("item_id"),
        chunk_index: row.get::<i64, _>("chunk_index") as usize,
        text: row.get("text"),
        page_start: row.get::<i64, _>("page_start") as u32,
        page_end: row.get::<i64, _>("page_end") as u32,
        heading: row.get("heading"),
        image_name: row.get("image_name"),
        acl,
        content_hash: row.get("content_hash"),
        vector: blob_to_vec(&blob),
        model: row.get("model"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl IndexStore for SqliteIndexStore {
    async fn records_for_item(&self, item_id: &str) -> Result<Vec<IndexRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, item_id, chunk_index, text, page_start, page_end, heading,
                   image_name, acl, content_hash, vector, model, updated_at
            FROM index_records
            WHERE item_id = ?
            ORDER BY chunk_index
            "#,
        )
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn upsert_record(&self, record: &IndexRecord) -> Result<()> {
        let acl = serde_json::to_string(&record.acl)?;
        sqlx::query(
            r#"
            INSERT INTO index_records (id, item_id, chunk_index, text, page_start, page_end,
                                       heading, image_name, acl, content_hash, vector, dims,
                                       model, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                text = excluded.text,
                page_start = excluded.page_start,
                page_end = excluded.page_end,
                heading = excluded.heading,
                image_name = excluded.image_name,
                acl = excluded.acl,
                content_hash = excluded.content_hash,
                vector = excluded.vector,
                dims = excluded.dims,
                model = excluded.model,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.id)
        .bind(&record.item_id)
        .bind(record.chunk_index as i64)
        .bind(&record.text)
        .bind(record.page_start as i64)
        .bind(record.page_end as i64)
        .bind(&record.heading)
        .bind(&record.image_name)
        .bind(acl)
        .bind(&record.content_hash)
        .bind(vec_to_blob(&record.vector))
        .bind(record.vector.len() as i64)
        .bind(&record.model)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
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
        let result = sqlx::query(
            "UPDATE index_records SET chunk_index = ?, page_start = ?, page_end = ?, heading = ? \
             WHERE id = ?",
        )
        .bind(chunk_index as i64)
        .bind(page_start as i64)
        .bind(page_end as i64)
        .bind(heading)
        .bind(record_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("no record {}", record_id);
        }
        Ok(())
    }

    async fn delete_record(&self, record_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM index_records WHERE id = ?")
            .bind(record_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn item_state(&self, item_id: &str) -> Result<Option<ItemState>> {
        let row = sqlx::query(
            "SELECT item_id, content_digest, settings_digest, last_modified, record_count \
             FROM item_states WHERE item_id = ?",
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ItemState {
            item_id: row.get("item_id"),
            content_digest: row.get("content_digest"),
            settings_digest: row.get("settings_digest"),
            last_modified: row.get("last_modified"),
            record_count: row.get::<i64, _>("record_count") as usize,
        }))
    }

    async fn put_item_state(&self, state: &ItemState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO item_states (item_id, content_digest, settings_digest, last_modified, record_count)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(item_id) DO UPDATE SET
                content_digest = excluded.content_digest,
                settings_digest = excluded.settings_digest,
                last_modified = excluded.last_modified,
                record_count = excluded.record_count
            "#,
        )
        .bind(&state.item_id)
        .bind(&state.content_digest)
        .bind(&state.settings_digest)
        .bind(state.last_modified)
        .bind(state.record_count as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_item_state(&self, item_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM item_states WHERE item_id = ?")
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_items(&self) -> Result<Vec<ItemSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT item_id, SUM(n) AS record_count FROM (
                SELECT item_id, COUNT(*) AS n FROM index_records GROUP BY item_id
                UNION ALL
                SELECT item_id, 0 AS n FROM item_states
            )
            GROUP BY item_id
            ORDER BY item_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ItemSummary {
                item_id: row.get("item_id"),
                record_count: row.get::<i64, _>("record_count") as usize,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    async fn store() -> SqliteIndexStore {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        SqliteIndexStore::new(pool)
    }

    fn record(item: &str, index: usize, text: &str) -> IndexRecord {
        IndexRecord {
            id: crate::models::record_id(item, &crate::chunk::content_hash(text, None), 0),
            item_id: item.to_string(),
            chunk_index: index,
            text: text.to_string(),
            page_start: 1,
            page_end: 2,
            heading: Some("Intro".to_string()),
            image_name: None,
            acl: ["team-a".to_string(), "team-b".to_string()].into_iter().collect(),
            content_hash: crate::chunk::content_hash(text, None),
            vector: vec![0.25, -1.5, 3.0],
            model: "fnv1a-hash".to_string(),
            updated_at: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn records_round_trip_and_overwrite_in_place() {
        let store = store().await;
        let a0 = record("file:a.md", 0, "first");
        let a1 = record("file:a.md", 1, "second");
        store.upsert_record(&a1).await.unwrap();
        store.upsert_record(&a0).await.unwrap();

        let stored = store.records_for_item("file:a.md").await.unwrap();
        assert_eq!(stored, vec![a0.clone(), a1.clone()]);

        let mut changed = a1.clone();
        changed.text = "second, edited".to_string();
        changed.acl = Acl::new();
        store.upsert_record(&changed).await.unwrap();
        let stored = store.records_for_item("file:a.md").await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1], changed);

        store.delete_record(&a0.id).await.unwrap();
        store.delete_record("no-such-record").await.unwrap();
        assert_eq!(store.records_for_item("file:a.md").await.unwrap(), vec![changed]);
    }

    #[tokio::test]
    async fn reposition_moves_records_past_each_other() {
        let store = store().await;
        let a0 = record("file:a.md", 0, "alpha");
        let a1 = record("file:a.md", 1, "beta");
        store.upsert_record(&a0).await.unwrap();
        store.upsert_record(&a1).await.unwrap();

        store.reposition_record(&a0.id, 1, 3, 3, None).await.unwrap();
        store.reposition_record(&a1.id, 2, 4, 5, Some("Later")).await.unwrap();
        store.upsert_record(&record("file:a.md", 0, "intro")).await.unwrap();

        let stored = store.records_for_item("file:a.md").await.unwrap();
        let texts: Vec<&str> = stored.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["intro", "alpha", "beta"]);
        assert_eq!(stored[1].vector, a0.vector);
        assert_eq!((stored[1].page_start, stored[1].heading.clone()), (3, None));
        assert_eq!((stored[2].page_end, stored[2].heading.as_deref()), (5, Some("Later")));

        assert!(store.reposition_record("no-such-record", 0, 1, 1, None).await.is_err());
    }

    #[tokio::test]
    async fn item_states_and_listing() {
        let store = store().await;
        store.upsert_record(&record("file:b.md", 0, "x")).await.unwrap();
        store.upsert_record(&record("file:b.md", 1, "y")).await.unwrap();
        let state = ItemState {
            item_id: "file:b.md".to_string(),
            content_digest: "c".to_string(),
            settings_digest: "s".to_string(),
            last_modified: 42,
            record_count: 2,
        };
        store.put_item_state(&state).await.unwrap();
        assert_eq!(store.item_state("file:b.md").await.unwrap(), Some(state));
        assert_eq!(store.item_state("file:zzz").await.unwrap(), None);

        assert_eq!(
            store.list_items().await.unwrap(),
            vec![ItemSummary {
                item_id: "file:b.md".to_string(),
                record_count: 2
            }]
        );

        store.delete_item_state("file:b.md").await.unwrap();
        assert_eq!(store.item_state("file:b.md").await.unwrap(), None);
    }
}
