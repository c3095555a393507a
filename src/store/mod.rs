//! Storage abstraction for the novel catalog.
//!
//! The [`CatalogStore`] trait is the narrow persistence interface used by
//! the reconciler and the read path. It stores novel metadata and chapter
//! *positions*, never chapter text.
//!
//! Implementations must be `Send + Sync` so a single store can be shared
//! between the background watcher and concurrent readers.

pub mod memory;

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    ChapterLocation, ChapterRecord, ChapterSummary, NovelFilter, NovelId, NovelMetadata,
    NovelSummary, SegmentedNovel,
};

/// Abstract catalog backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`find_novel_by_path`](CatalogStore::find_novel_by_path) | Look up a novel by its unique source path |
/// | [`upsert_novel`](CatalogStore::upsert_novel) | Insert or refresh metadata, keyed by path |
/// | [`replace_chapters`](CatalogStore::replace_chapters) | Atomically replace a novel's chapter set |
/// | [`save_novel`](CatalogStore::save_novel) | Upsert plus replace as one atomic unit |
/// | [`delete_novel`](CatalogStore::delete_novel) | Remove a novel and its chapters |
/// | [`rewrite_path`](CatalogStore::rewrite_path) | Change a novel's path, keeping identity |
/// | [`list_novels`](CatalogStore::list_novels) | Filtered summaries ordered by title |
/// | [`list_chapters`](CatalogStore::list_chapters) | Table of contents in index order |
/// | [`get_chapter_position`](CatalogStore::get_chapter_position) | Where a chapter's text lives |
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn find_novel_by_path(&self, path: &Path) -> Result<Option<NovelSummary>>;

    /// Inserts a novel or refreshes the metadata of the one at the same path.
    ///
    /// Returns the existing identity on update. A newly inserted novel has no
    /// chapters until [`replace_chapters`](CatalogStore::replace_chapters) runs;
    /// prefer [`save_novel`](CatalogStore::save_novel) when both are known.
    async fn upsert_novel(&self, metadata: &NovelMetadata) -> Result<NovelId>;

    /// Discards every chapter of `novel_id` and inserts `chapters` in order.
    ///
    /// Readers observe either the old set or the new one.
    async fn replace_chapters(&self, novel_id: &str, chapters: &[ChapterRecord]) -> Result<()>;

    /// Upserts metadata and replaces chapters in one transaction.
    async fn save_novel(&self, novel: &SegmentedNovel) -> Result<NovelId>;

    /// Removes the novel at `path`, returning its identity and title.
    async fn delete_novel(&self, path: &Path) -> Result<Option<(NovelId, String)>>;

    /// Moves a novel from `old_path` to `new_path`.
    ///
    /// Returns `false` when nothing is recorded at `old_path`. Any novel
    /// already recorded at `new_path` is replaced.
    async fn rewrite_path(&self, old_path: &Path, new_path: &Path) -> Result<bool>;

    /// Novels matching `filter`, ordered by title then path.
    async fn list_novels(&self, filter: &NovelFilter) -> Result<Vec<NovelSummary>>;

    async fn get_novel(&self, novel_id: &str) -> Result<Option<NovelSummary>>;

    /// Chapters of a novel in ascending index order, or `None` when the
    /// novel is unknown. Existence and chapters come from one snapshot.
    async fn list_chapters(&self, novel_id: &str) -> Result<Option<Vec<ChapterSummary>>>;

    async fn get_chapter_position(&self, chapter_id: &str) -> Result<Option<ChapterLocation>>;
}

/// Canonical string form of a path used as the catalog key.
pub fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
