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

/// Creates the catalog schema on `pool`. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Create novels table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS novels (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            author TEXT,
            file_path TEXT NOT NULL UNIQUE,
            format TEXT NOT NULL,
            chapter_count INTEGER NOT NULL DEFAULT 0,
            modified_ms INTEGER NOT NULL,
            file_size INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            indexed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create chapters table; exactly one position shape per row
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chapters (
            id TEXT PRIMARY KEY,
            novel_id TEXT NOT NULL,
            chapter_index INTEGER NOT NULL,
            title TEXT NOT NULL,
            start_line INTEGER,
            end_line INTEGER,
            item_id TEXT,
            UNIQUE(novel_id, chapter_index),
            FOREIGN KEY (novel_id) REFERENCES novels(id) ON DELETE CASCADE,
            CHECK (
                (start_line IS NOT NULL AND end_line IS NOT NULL AND item_id IS NULL
                    AND start_line >= 0 AND start_line <= end_line)
                OR (start_line IS NULL AND end_line IS NULL AND item_id IS NOT NULL)
            )
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chapters_novel_id ON chapters(novel_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_novels_title ON novels(title)")
        .execute(pool)
        .await?;

    Ok(())
}
