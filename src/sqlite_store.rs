//! SQLite-backed [`CatalogStore`] implementation.
//!
//! Novels and chapters live in two tables (see [`migrate`](crate::migrate)).
//! Every multi-statement write runs inside one `BEGIN IMMEDIATE` transaction
//! so a reader never sees a novel whose chapter set is half replaced, and
//! concurrent writers queue on the database lock instead of failing.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};

use crate::models::{
    ChapterLocation, ChapterRecord, ChapterSummary, FileStamp, NovelFilter, NovelId,
    NovelMetadata, NovelSummary, Position, SegmentedNovel, SourceFormat,
};
use crate::store::{path_key, CatalogStore};

/// SQLite implementation of the [`CatalogStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Opens a write transaction that takes SQLite's write lock up front.
    ///
    /// A deferred transaction that reads before it writes cannot wait for
    /// the lock once another writer commits; it fails with `SQLITE_BUSY`.
    /// `BEGIN IMMEDIATE` queues on the busy timeout instead.
    async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .context("Failed to begin write transaction")
    }
}

const NOVEL_COLUMNS: &str =
    "id, title, author, file_path, format, chapter_count, modified_ms, file_size, content_hash";

fn row_to_summary(row: &SqliteRow) -> Result<NovelSummary> {
    let format: String = row.get("format");
    let chapter_count: i64 = row.get("chapter_count");
    let file_size: i64 = row.get("file_size");
    Ok(NovelSummary {
        id: row.get("id"),
        title: row.get("title"),
        author: row.get("author"),
        file_path: row.get("file_path"),
        format: SourceFormat::parse(&format)
            .ok_or_else(|| anyhow!("unknown source format '{format}'"))?,
        chapter_count: chapter_count as usize,
        stamp: FileStamp {
            modified_ms: row.get("modified_ms"),
            size: file_size as u64,
        },
        content_hash: row.get("content_hash"),
    })
}

fn row_to_position(row: &SqliteRow) -> Result<Position> {
    let item_id: Option<String> = row.get("item_id");
    let start: Option<i64> = row.get("start_line");
    let end: Option<i64> = row.get("end_line");
    match (item_id, start, end) {
        (Some(id), None, None) => Ok(Position::Item { id }),
        (None, Some(start), Some(end)) => Ok(Position::Lines {
            start: start as usize,
            end: end as usize,
        }),
        _ => bail!("chapter row has an invalid position"),
    }
}

async fn upsert_in(conn: &mut SqliteConnection, metadata: &NovelMetadata) -> Result<NovelId> {
    let key = path_key(&metadata.file_path);
    let now = chrono::Utc::now().timestamp();

    let existing: Option<String> = sqlx::query_scalar("SELECT id FROM novels WHERE file_path = ?")
        .bind(&key)
        .fetch_optional(&mut *conn)
        .await?;

    if let Some(id) = existing {
        sqlx::query(
            r#"
            UPDATE novels
            SET title = ?, author = ?, format = ?, modified_ms = ?, file_size = ?,
                content_hash = ?, indexed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&metadata.title)
        .bind(&metadata.author)
        .bind(metadata.format.as_str())
        .bind(metadata.stamp.modified_ms)
        .bind(metadata.stamp.size as i64)
        .bind(&metadata.content_hash)
        .bind(now)
        .bind(&id)
        .execute(&mut *conn)
        .await?;
        return Ok(id);
    }

    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO novels (id, title, author, file_path, format, chapter_count,
                            modified_ms, file_size, content_hash, indexed_at)
        VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&metadata.title)
    .bind(&metadata.author)
    .bind(&key)
    .bind(metadata.format.as_str())
    .bind(metadata.stamp.modified_ms)
    .bind(metadata.stamp.size as i64)
    .bind(&metadata.content_hash)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(id)
}

async fn replace_in(
    conn: &mut SqliteConnection,
    novel_id: &str,
    chapters: &[ChapterRecord],
) -> Result<()> {
    let exists: Option<String> = sqlx::query_scalar("SELECT id FROM novels WHERE id = ?")
        .bind(novel_id)
        .fetch_optional(&mut *conn)
        .await?;
    if exists.is_none() {
        bail!("novel {novel_id} does not exist");
    }

    sqlx::query("DELETE FROM chapters WHERE novel_id = ?")
        .bind(novel_id)
        .execute(&mut *conn)
        .await?;

    for chapter in chapters {
        let (start, end, item) = match &chapter.position {
            Position::Lines { start, end } => (Some(*start as i64), Some(*end as i64), None),
            Position::Item { id } => (None, None, Some(id.as_str())),
        };
        sqlx::query(
            r#"
            INSERT INTO chapters (id, novel_id, chapter_index, title, start_line, end_line, item_id)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(novel_id)
        .bind(chapter.index as i64)
        .bind(&chapter.title)
        .bind(start)
        .bind(end)
        .bind(item)
        .execute(&mut *conn)
        .await?;
    }

    sqlx::query("UPDATE novels SET chapter_count = ? WHERE id = ?")
        .bind(chapters.len() as i64)
        .bind(novel_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn delete_in(conn: &mut SqliteConnection, novel_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM chapters WHERE novel_id = ?")
        .bind(novel_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM novels WHERE id = ?")
        .bind(novel_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[async_trait]
impl CatalogStore for SqliteStore {
    async fn find_novel_by_path(&self, path: &Path) -> Result<Option<NovelSummary>> {
        let row = sqlx::query(&format!(
            "SELECT {NOVEL_COLUMNS} FROM novels WHERE file_path = ?"
        ))
        .bind(path_key(path))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_summary).transpose()
    }

    async fn upsert_novel(&self, metadata: &NovelMetadata) -> Result<NovelId> {
        let mut tx = self.begin_write().await?;
        let id = upsert_in(&mut tx, metadata).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn replace_chapters(&self, novel_id: &str, chapters: &[ChapterRecord]) -> Result<()> {
        let mut tx = self.begin_write().await?;
        replace_in(&mut tx, novel_id, chapters).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn save_novel(&self, novel: &SegmentedNovel) -> Result<NovelId> {
        let mut tx = self.begin_write().await?;
        let id = upsert_in(&mut tx, &novel.metadata).await?;
        replace_in(&mut tx, &id, &novel.chapters).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn delete_novel(&self, path: &Path) -> Result<Option<(NovelId, String)>> {
        let mut tx = self.begin_write().await?;
        let row = sqlx::query("SELECT id, title FROM novels WHERE file_path = ?")
            .bind(path_key(path))
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let id: String = row.get("id");
        let title: String = row.get("title");

        delete_in(&mut tx, &id).await?;
        tx.commit().await?;
        Ok(Some((id, title)))
    }

    async fn rewrite_path(&self, old_path: &Path, new_path: &Path) -> Result<bool> {
        let old_key = path_key(old_path);
        let new_key = path_key(new_path);

        let mut tx = self.begin_write().await?;
        let id: Option<String> = sqlx::query_scalar("SELECT id FROM novels WHERE file_path = ?")
            .bind(&old_key)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(id) = id else {
            return Ok(false);
        };
        if old_key == new_key {
            return Ok(true);
        }

        let displaced: Option<String> =
            sqlx::query_scalar("SELECT id FROM novels WHERE file_path = ?")
                .bind(&new_key)
                .fetch_optional(&mut *tx)
                .await?;
        if let Some(displaced) = displaced {
            delete_in(&mut tx, &displaced).await?;
        }

        sqlx::query("UPDATE novels SET file_path = ? WHERE id = ?")
            .bind(&new_key)
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn list_novels(&self, filter: &NovelFilter) -> Result<Vec<NovelSummary>> {
        let rows = sqlx::query(&format!(
            "SELECT {NOVEL_COLUMNS} FROM novels ORDER BY title ASC, file_path ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        // Matching is Unicode case-insensitive, which SQLite's LIKE is not.
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let summary = row_to_summary(row)?;
            if filter.matches(&summary) {
                out.push(summary);
            }
        }
        Ok(out)
    }

    async fn get_novel(&self, novel_id: &str) -> Result<Option<NovelSummary>> {
        let row = sqlx::query(&format!("SELECT {NOVEL_COLUMNS} FROM novels WHERE id = ?"))
            .bind(novel_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_summary).transpose()
    }

    async fn list_chapters(&self, novel_id: &str) -> Result<Option<Vec<ChapterSummary>>> {
        // One statement, so a concurrent delete cannot split existence from listing.
        let rows = sqlx::query(
            "SELECT c.id AS id, c.title AS title, c.chapter_index AS chapter_index FROM novels n \
             LEFT JOIN chapters c ON c.novel_id = n.id \
             WHERE n.id = ? ORDER BY c.chapter_index ASC",
        )
        .bind(novel_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }
        let mut chapters = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(id) = row.get::<Option<String>, _>("id") else {
                continue;
            };
            let index: i64 = row.get("chapter_index");
            chapters.push(ChapterSummary {
                id,
                title: row.get("title"),
                index: index as usize,
            });
        }
        Ok(Some(chapters))
    }

    async fn get_chapter_position(&self, chapter_id: &str) -> Result<Option<ChapterLocation>> {
        let row = sqlx::query(
            r#"
            SELECT c.id, c.novel_id, c.title, c.chapter_index,
                   c.start_line, c.end_line, c.item_id, n.file_path
            FROM chapters c
            JOIN novels n ON n.id = c.novel_id
            WHERE c.id = ?
            "#,
        )
        .bind(chapter_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let index: i64 = row.get("chapter_index");
        let file_path: String = row.get("file_path");
        Ok(Some(ChapterLocation {
            chapter_id: row.get("id"),
            novel_id: row.get("novel_id"),
            title: row.get("title"),
            index: index as usize,
            file_path: PathBuf::from(file_path),
            position: row_to_position(&row)?,
        }))
    }
}
