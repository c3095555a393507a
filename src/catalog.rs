//! Read path over the catalog.
//!
//! Used by both the CLI (`novels search`, `chapters`, `read`) and the HTTP
//! server. Chapter text is never stored; [`Catalog::fetch_chapter`] looks up
//! the chapter's position and re-derives the text from the live file.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::error::StaleReference;
use crate::models::{ChapterSummary, NovelFilter, NovelSummary, Position};
use crate::resolve::resolve;
use crate::segment_epub::strip_heading;
use crate::store::CatalogStore;

/// A chapter with its resolved text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChapterContent {
    pub id: String,
    pub novel_id: String,
    pub title: String,
    pub index: usize,
    pub content: String,
}

/// Outcome of a chapter content request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChapterFetch {
    Content(ChapterContent),
    /// No chapter with this id is catalogued.
    UnknownChapter,
    /// The chapter is catalogued but its position no longer resolves.
    Stale(StaleReference),
}

/// Query facade shared by the CLI and HTTP server.
#[derive(Clone)]
pub struct Catalog {
    store: Arc<dyn CatalogStore>,
}

impl Catalog {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    /// Novels whose title or author contains `query`, ordered by title.
    /// An empty or absent query returns every novel.
    pub async fn search(&self, query: Option<&str>) -> Result<Vec<NovelSummary>> {
        let filter = NovelFilter {
            query: query.map(str::to_string),
            folder: None,
        };
        self.store.list_novels(&filter).await
    }

    /// Novels stored under a directory named `folder`.
    pub async fn search_folder(&self, folder: &str) -> Result<Vec<NovelSummary>> {
        self.store.list_novels(&NovelFilter::folder(folder)).await
    }

    pub async fn novel(&self, novel_id: &str) -> Result<Option<NovelSummary>> {
        self.store.get_novel(novel_id).await
    }

    /// Table of contents in ascending index order, or `None` for an
    /// unknown novel.
    pub async fn chapters(&self, novel_id: &str) -> Result<Option<Vec<ChapterSummary>>> {
        self.store.list_chapters(novel_id).await
    }

    /// Resolves one chapter's text from its source file.
    pub async fn fetch_chapter(&self, chapter_id: &str) -> Result<ChapterFetch> {
        let Some(location) = self.store.get_chapter_position(chapter_id).await? else {
            return Ok(ChapterFetch::UnknownChapter);
        };

        let file_path = location.file_path.clone();
        let position = location.position.clone();
        let resolved = tokio::task::spawn_blocking(move || resolve(&file_path, &position))
            .await
            .context("chapter resolution task failed")?;

        match resolved {
            Ok(text) => {
                let content = match &location.position {
                    Position::Item { .. } => strip_heading(&text, &location.title),
                    Position::Lines { .. } => text,
                };
                Ok(ChapterFetch::Content(ChapterContent {
                    id: location.chapter_id,
                    novel_id: location.novel_id,
                    title: location.title,
                    index: location.index,
                    content,
                }))
            }
            Err(reason) => {
                tracing::info!(
                    chapter_id,
                    path = %location.file_path.display(),
                    "stale chapter reference: {reason}"
                );
                Ok(ChapterFetch::Stale(reason))
            }
        }
    }
}
