use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // One JSON document per loaded record; seq keeps insertion order.
    // source_id mirrors the body's _source_id so scoped reads use the index.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            collection TEXT NOT NULL,
            source_id TEXT,
            body_json TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    add_records_source_column(pool).await?;

    // Current schema document per source.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schemas (
            source_id TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            body_json TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only: every committed version.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_history (
            source_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            body_json TEXT NOT NULL,
            PRIMARY KEY (source_id, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS uploads (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id TEXT NOT NULL,
            uploaded_at TEXT NOT NULL,
            body_json TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queries (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id TEXT NOT NULL,
            executed_at TEXT NOT NULL,
            body_json TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_collection ON records(collection, seq)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_source ON records(collection, source_id, seq)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_uploads_source ON uploads(source_id, seq)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_queries_source ON queries(source_id, seq)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Databases created before records carried a `source_id` column get it
/// added and backfilled from the stored documents.
async fn add_records_source_column(pool: &SqlitePool) -> Result<()> {
    let present: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pragma_table_info('records') WHERE name = 'source_id'",
    )
    .fetch_one(pool)
    .await?;
    if present > 0 {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    sqlx::query("ALTER TABLE records ADD COLUMN source_id TEXT")
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE records SET source_id = json_extract(body_json, '$._source_id')")
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}
