//! Core data models used throughout the catalog.
//!
//! These types describe novels and their chapter tables as they flow from
//! the segmenters into the [`CatalogStore`](crate::store::CatalogStore) and
//! back out to the read path. No chapter text is stored here: a chapter only
//! carries a [`Position`] from which its text can be re-derived.

use std::path::{Path, PathBuf};

use serde::Serialize;

/// Stable identity of a catalogued novel (UUID string).
pub type NovelId = String;

/// Stable identity of a chapter record (UUID string).
pub type ChapterId = String;

/// The on-disk format of a novel's source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    /// Newline-delimited plain text, segmented by heading lines.
    Text,
    /// EPUB container, segmented by spine items.
    Epub,
}

impl SourceFormat {
    /// Detects the format from a file extension.
    ///
    /// `epub` is always the container format; anything listed in
    /// `text_extensions` is plain text; everything else is ignored.
    pub fn detect(path: &Path, text_extensions: &[String]) -> Option<SourceFormat> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        if ext == "epub" {
            return Some(SourceFormat::Epub);
        }
        if text_extensions
            .iter()
            .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(&ext))
        {
            return Some(SourceFormat::Text);
        }
        None
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::Text => "text",
            SourceFormat::Epub => "epub",
        }
    }

    pub fn parse(s: &str) -> Option<SourceFormat> {
        match s {
            "text" => Some(SourceFormat::Text),
            "epub" => Some(SourceFormat::Epub),
            _ => None,
        }
    }
}

/// Where a chapter's text lives inside its source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Position {
    /// Half-open line range `[start, end)` into a plain-text file.
    Lines { start: usize, end: usize },
    /// Manifest id of one spine item inside an EPUB container.
    Item { id: String },
}

impl Position {
    pub fn format(&self) -> SourceFormat {
        match self {
            Position::Lines { .. } => SourceFormat::Text,
            Position::Item { .. } => SourceFormat::Epub,
        }
    }
}

/// One entry in a novel's table of contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterRecord {
    /// Zero-based position in document order.
    pub index: usize,
    pub title: String,
    pub position: Position,
}

/// Cheap change-detection fingerprint of a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FileStamp {
    /// Modification time, unix milliseconds.
    pub modified_ms: i64,
    /// Length in bytes.
    pub size: u64,
}

/// Novel metadata as produced by a segmenter, before it has an identity.
#[derive(Debug, Clone)]
pub struct NovelMetadata {
    pub title: String,
    pub author: Option<String>,
    pub file_path: PathBuf,
    pub format: SourceFormat,
    pub stamp: FileStamp,
    /// Hex SHA-256 of the bytes that were segmented.
    pub content_hash: String,
}

/// Output of segmenting one file: metadata plus the full chapter table.
#[derive(Debug, Clone)]
pub struct SegmentedNovel {
    pub metadata: NovelMetadata,
    pub chapters: Vec<ChapterRecord>,
}

/// A catalogued novel as returned by listing and search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NovelSummary {
    pub id: NovelId,
    pub title: String,
    pub author: Option<String>,
    pub file_path: String,
    pub format: SourceFormat,
    pub chapter_count: usize,
    #[serde(flatten)]
    pub stamp: FileStamp,
    pub content_hash: String,
}

/// A chapter as shown in a table of contents listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChapterSummary {
    pub id: ChapterId,
    pub title: String,
    pub index: usize,
}

/// Everything needed to re-derive one chapter's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterLocation {
    pub chapter_id: ChapterId,
    pub novel_id: NovelId,
    pub title: String,
    pub index: usize,
    pub file_path: PathBuf,
    pub position: Position,
}

/// Filter for [`CatalogStore::list_novels`](crate::store::CatalogStore::list_novels).
#[derive(Debug, Clone, Default)]
pub struct NovelFilter {
    /// Case-insensitive substring over title or author. Blank matches all.
    pub query: Option<String>,
    /// Directory name that must appear as a component of the file path.
    pub folder: Option<String>,
}

impl NovelFilter {
    pub fn query(q: impl Into<String>) -> Self {
        Self {
            query: Some(q.into()),
            folder: None,
        }
    }

    pub fn folder(name: impl Into<String>) -> Self {
        Self {
            query: None,
            folder: Some(name.into()),
        }
    }

    /// Evaluates the filter against one summary. Matching is Unicode
    /// case-insensitive, which SQLite's `LIKE` is not.
    pub fn matches(&self, novel: &NovelSummary) -> bool {
        if let Some(q) = self.query.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            let q = q.to_lowercase();
            let in_title = novel.title.to_lowercase().contains(&q);
            let in_author = novel
                .author
                .as_deref()
                .map(|a| a.to_lowercase().contains(&q))
                .unwrap_or(false);
            if !in_title && !in_author {
                return false;
            }
        }
        if let Some(folder) = self.folder.as_deref().filter(|f| !f.is_empty()) {
            let parent = Path::new(&novel.file_path).parent();
            let in_folder = parent
                .map(|p| p.components().any(|c| c.as_os_str() == folder))
                .unwrap_or(false);
            if !in_folder {
                return false;
            }
        }
        true
    }
}
