//! Lazy chapter content retrieval.
//!
//! Re-derives a chapter's text from its source file and recorded
//! [`Position`]. Nothing here touches the catalog: a position that no
//! longer fits the file is reported as a [`StaleReference`] and left for
//! the reconciler to repair.

use std::io::ErrorKind;
use std::path::Path;

use crate::epub::EpubContainer;
use crate::error::{SegmentError, StaleReference};
use crate::models::Position;
use crate::segment_epub;
use crate::segment_text::split_lines;

/// Returns the text at `position` inside `file_path`.
///
/// Line ranges are returned whole or not at all; a range that runs past the
/// end of a file truncated since indexing is stale, never partial.
pub fn resolve(file_path: &Path, position: &Position) -> Result<String, StaleReference> {
    match position {
        Position::Lines { start, end } => resolve_lines(file_path, *start, *end),
        Position::Item { id } => resolve_item(file_path, id),
    }
}

fn read_source(file_path: &Path) -> Result<Vec<u8>, StaleReference> {
    std::fs::read(file_path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => StaleReference::FileMissing(file_path.to_path_buf()),
        _ => StaleReference::Unreadable(format!("{}: {e}", file_path.display())),
    })
}

fn resolve_lines(file_path: &Path, start: usize, end: usize) -> Result<String, StaleReference> {
    let bytes = read_source(file_path)?;
    let content = String::from_utf8_lossy(&bytes);
    let lines = split_lines(&content);

    if start > end || end > lines.len() {
        return Err(StaleReference::RangeOutOfBounds {
            start,
            end,
            lines: lines.len(),
        });
    }
    Ok(lines[start..end].join("\n"))
}

fn resolve_item(file_path: &Path, id: &str) -> Result<String, StaleReference> {
    let mut container = EpubContainer::open(file_path).map_err(|e| match e {
        SegmentError::Io { source, .. } if source.kind() == ErrorKind::NotFound => {
            StaleReference::FileMissing(file_path.to_path_buf())
        }
        other => StaleReference::Unreadable(other.to_string()),
    })?;
    segment_epub::resolve_item(&mut container, id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epub::tests::build_epub;
    use crate::segment_text::TextSegmenter;
    use tempfile::TempDir;

    #[test]
    fn returns_exact_line_range() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("n.txt");
        std::fs::write(&path, "第一章\nalpha\r\nbeta\n第二章\ngamma").unwrap();

        let text = resolve(&path, &Position::Lines { start: 1, end: 3 }).unwrap();
        assert_eq!(text, "alpha\nbeta");
    }

    #[test]
    fn matches_segmenter_line_numbering() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("n.txt");
        let body = "序章\r\n开场\r\n第一章 起\r\n一行\r\n二行\r\n";
        std::fs::write(&path, body).unwrap();

        let chapters = TextSegmenter::default().segment(body);
        let last = chapters.last().unwrap();
        assert_eq!(resolve(&path, &last.position).unwrap(), "一行\n二行\n");
    }

    #[test]
    fn empty_range_resolves_to_empty_string() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("n.txt");
        std::fs::write(&path, "a\nb").unwrap();
        assert_eq!(resolve(&path, &Position::Lines { start: 1, end: 1 }).unwrap(), "");
    }

    #[test]
    fn missing_file_is_stale() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gone.txt");
        assert_eq!(
            resolve(&path, &Position::Lines { start: 0, end: 1 }),
            Err(StaleReference::FileMissing(path.clone()))
        );
        let epub = tmp.path().join("gone.epub");
        assert_eq!(
            resolve(&epub, &Position::Item { id: "c1".into() }),
            Err(StaleReference::FileMissing(epub.clone()))
        );
    }

    #[test]
    fn truncated_file_is_stale_not_partial() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("n.txt");
        std::fs::write(&path, "one\ntwo").unwrap();
        assert_eq!(
            resolve(&path, &Position::Lines { start: 1, end: 5 }),
            Err(StaleReference::RangeOutOfBounds {
                start: 1,
                end: 5,
                lines: 2
            })
        );
    }

    #[test]
    fn epub_item_is_cleaned() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("b.epub");
        std::fs::write(
            &path,
            build_epub(
                Some("B"),
                None,
                &[(
                    "c1",
                    "one.xhtml",
                    b"<html><body><h1>One</h1><p>First.</p><p>Second.</p></body></html>",
                )],
            ),
        )
        .unwrap();

        assert_eq!(
            resolve(&path, &Position::Item { id: "c1".into() }).unwrap(),
            "One\nFirst.\nSecond."
        );
        assert_eq!(
            resolve(&path, &Position::Item { id: "c9".into() }),
            Err(StaleReference::ItemMissing("c9".into()))
        );
    }

    #[test]
    fn corrupt_container_is_unreadable() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("b.epub");
        std::fs::write(&path, b"garbage").unwrap();
        assert!(matches!(
            resolve(&path, &Position::Item { id: "c1".into() }),
            Err(StaleReference::Unreadable(_))
        ));
    }
}
