//! Typed failures for segmentation and chapter resolution.
//!
//! Orchestration code works in `anyhow::Result`; these enums exist where a
//! caller has to tell one failure from another (skip a file, answer 404).

use std::path::PathBuf;

/// Why a source file produced no novel.
#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed EPUB container: {0}")]
    Container(String),

    #[error("no content in {0}")]
    Empty(PathBuf),
}

impl SegmentError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SegmentError::Io {
            path: path.into(),
            source,
        }
    }
}

/// A chapter's recorded position no longer resolves against its file.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StaleReference {
    #[error("source file is missing: {0}")]
    FileMissing(PathBuf),

    #[error("line range {start}..{end} exceeds the file's {lines} lines")]
    RangeOutOfBounds {
        start: usize,
        end: usize,
        lines: usize,
    },

    #[error("container item '{0}' no longer exists")]
    ItemMissing(String),

    #[error("source is unreadable: {0}")]
    Unreadable(String),
}
