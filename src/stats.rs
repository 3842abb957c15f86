//! Index status overview.
//!
//! Summarizes what is indexed: items, records, embedding models, and when
//! items were last ingested. Used by `ingest status` to confirm that runs
//! are landing in the index.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::migrate;

struct ModelStats {
    model: String,
    dims: i64,
    records: i64,
}

/// Query the index database and print a summary.
pub async fn run_status(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    let total_items: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM (SELECT item_id FROM item_states UNION SELECT item_id FROM index_records)",
    )
    .fetch_one(&pool)
    .await?;

    let total_records: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM index_records")
        .fetch_one(&pool)
        .await?;

    let with_images: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM index_records WHERE image_name IS NOT NULL")
            .fetch_one(&pool)
            .await?;

    let last_ingest: Option<i64> = sqlx::query_scalar("SELECT MAX(updated_at) FROM index_records")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Ingest Harness: Index Status");
    println!("============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Items:       {}", total_items);
    println!("  Records:     {}", total_records);
    println!("  With images: {}", with_images);
    println!(
        "  Last write:  {}",
        match last_ingest {
            Some(ts) => format_ts_relative(ts),
            None => "never".to_string(),
        }
    );

    let rows = sqlx::query(
        r#"
        SELECT model, dims, COUNT(*) AS records
        FROM index_records
        GROUP BY model, dims
        ORDER BY records DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let models: Vec<ModelStats> = rows
        .iter()
        .map(|row| ModelStats {
            model: row.get("model"),
            dims: row.get("dims"),
            records: row.get("records"),
        })
        .collect();

    if !models.is_empty() {
        println!();
        println!("  By model:");
        println!("  {:<40} {:>6} {:>9}", "MODEL", "DIMS", "RECORDS");
        println!("  {}", "-".repeat(57));
        for m in &models {
            println!("  {:<40} {:>6} {:>9}", m.model, m.dims, m.records);
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// "3 hours ago" style rendering of a Unix timestamp.
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    match delta {
        0..=59 => "just now".to_string(),
        60..=3599 => plural(delta / 60, "min"),
        3600..=86399 => plural(delta / 3600, "hour"),
        d if d < 86400 * 30 => plural(d / 86400, "day"),
        _ => format_ts_iso(ts),
    }
}

fn plural(n: i64, unit: &str) -> String {
    format!("{} {}{} ago", n, unit, if n == 1 { "" } else { "s" })
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
