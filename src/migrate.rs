//! SQLite schema for index records and per-item fingerprints.

use anyhow::Result;
use sqlx::SqlitePool;

/// Create the index schema. Safe to run repeatedly.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_records (
            id TEXT PRIMARY KEY,
            item_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            page_start INTEGER NOT NULL,
            page_end INTEGER NOT NULL,
            heading TEXT,
            image_name TEXT,
            acl TEXT NOT NULL DEFAULT '[]',
            content_hash TEXT NOT NULL,
            vector BLOB NOT NULL,
            dims INTEGER NOT NULL,
            model TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS item_states (
            item_id TEXT PRIMARY KEY,
            content_digest TEXT NOT NULL,
            settings_digest TEXT NOT NULL,
            last_modified INTEGER NOT NULL,
            record_count INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_item_id ON index_records(item_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_content_hash ON index_records(content_hash)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
