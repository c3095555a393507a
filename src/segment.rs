//! Per-file segmentation entry point.
//!
//! Picks the segmenter for a path's [`SourceFormat`], derives title and
//! author, and stamps the result with the file's size, modification time
//! and content hash.

use std::path::Path;
use std::sync::OnceLock;
use std::time::SystemTime;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::epub::EpubContainer;
use crate::error::SegmentError;
use crate::models::{ChapterRecord, FileStamp, NovelMetadata, SegmentedNovel, SourceFormat};
use crate::segment_epub;
use crate::segment_text::TextSegmenter;

/// Splits a file stem of the form `Title 作者：Author` into its parts.
///
/// Stems without the marker are returned whole as the title.
pub fn split_title_author(stem: &str) -> (String, Option<String>) {
    static AUTHOR_MARKER: OnceLock<Option<Regex>> = OnceLock::new();
    let re = AUTHOR_MARKER
        .get_or_init(|| Regex::new(r"^(.+)\s作者[：:](.+)$").ok())
        .as_ref();

    if let Some(caps) = re.and_then(|re| re.captures(stem)) {
        let title = caps[1].trim();
        let author = caps[2].trim();
        if !title.is_empty() && !author.is_empty() {
            return (title.to_string(), Some(author.to_string()));
        }
    }
    (stem.to_string(), None)
}

/// Size and millisecond mtime of `path`.
pub fn file_stamp(path: &Path) -> std::io::Result<FileStamp> {
    let meta = std::fs::metadata(path)?;
    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    Ok(FileStamp {
        modified_ms: modified
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64,
        size: meta.len(),
    })
}

/// Hex SHA-256 of a source file's bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Segments one file of a known format.
///
/// The stamp is taken before the bytes are read, so a write racing the read
/// leaves an older stamp behind and the next scan picks the file up again.
pub fn segment_file(path: &Path, format: SourceFormat) -> Result<SegmentedNovel, SegmentError> {
    let stamp = file_stamp(path).map_err(|e| SegmentError::io(path, e))?;
    let bytes = std::fs::read(path).map_err(|e| SegmentError::io(path, e))?;
    if bytes.is_empty() {
        return Err(SegmentError::Empty(path.to_path_buf()));
    }
    let content_hash = content_hash(&bytes);

    let (title, author, chapters) = match format {
        SourceFormat::Text => segment_text_bytes(path, &bytes),
        SourceFormat::Epub => segment_epub_bytes(path, bytes)?,
    };

    Ok(SegmentedNovel {
        metadata: NovelMetadata {
            title,
            author,
            file_path: path.to_path_buf(),
            format,
            stamp,
            content_hash,
        },
        chapters,
    })
}

type Segmented = (String, Option<String>, Vec<ChapterRecord>);

fn segment_text_bytes(path: &Path, bytes: &[u8]) -> Segmented {
    let content = String::from_utf8_lossy(bytes);
    let chapters = TextSegmenter::default().segment(&content);
    let (title, author) = split_title_author(&file_stem(path));
    (title, author, chapters)
}

fn segment_epub_bytes(path: &Path, bytes: Vec<u8>) -> Result<Segmented, SegmentError> {
    let mut container = EpubContainer::from_bytes(bytes)?;
    let chapters = segment_epub::segment(&mut container);
    if chapters.is_empty() {
        return Err(SegmentError::Empty(path.to_path_buf()));
    }

    let stem = file_stem(path);
    let declared_title = container.title().map(str::to_string);
    let (title, author) = match container.creator() {
        Some(creator) => (declared_title.unwrap_or(stem), Some(creator.to_string())),
        None => match split_title_author(&stem) {
            (title, Some(author)) => (title, Some(author)),
            (_, None) => (declared_title.unwrap_or(stem), None),
        },
    };
    Ok((title, author, chapters))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epub::tests::build_epub;
    use crate::models::Position;
    use crate::segment_text::FULL_TEXT_TITLE;
    use tempfile::TempDir;

    #[test]
    fn splits_author_marker_from_stem() {
        assert_eq!(
            split_title_author("雪国 作者：川端康成"),
            ("雪国".to_string(), Some("川端康成".to_string()))
        );
        assert_eq!(split_title_author("Plain Title"), ("Plain Title".to_string(), None));
        assert_eq!(split_title_author("作者：nobody"), ("作者：nobody".to_string(), None));
    }

    #[test]
    fn text_file_gets_filename_metadata_and_line_ranges() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("长夜 作者：某人.txt");
        std::fs::write(&path, "第一章 开始\n一\n二\n").unwrap();

        let novel = segment_file(&path, SourceFormat::Text).unwrap();
        assert_eq!(novel.metadata.title, "长夜");
        assert_eq!(novel.metadata.author.as_deref(), Some("某人"));
        assert!(novel.metadata.stamp.modified_ms > 0);
        assert_eq!(novel.metadata.stamp.size, "第一章 开始\n一\n二\n".len() as u64);
        assert_eq!(novel.metadata.content_hash.len(), 64);
        assert_eq!(novel.chapters.len(), 1);
        assert_eq!(novel.chapters[0].position, Position::Lines { start: 1, end: 4 });
    }

    #[test]
    fn stamp_has_millisecond_resolution() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.txt");
        std::fs::write(&path, "x").unwrap();
        let base = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        let file = std::fs::File::options().write(true).open(&path).unwrap();

        file.set_modified(base + std::time::Duration::from_millis(100)).unwrap();
        let first = file_stamp(&path).unwrap();
        file.set_modified(base + std::time::Duration::from_millis(700)).unwrap();
        let second = file_stamp(&path).unwrap();

        assert_eq!(first.modified_ms, 1_700_000_000_100);
        assert_ne!(first, second);
    }

    #[test]
    fn content_hash_tracks_bytes() {
        assert_eq!(content_hash(b"abc"), content_hash(b"abc"));
        assert_ne!(content_hash(b"abc"), content_hash(b"abd"));
    }

    #[test]
    fn invalid_utf8_is_tolerated_in_text() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bytes.txt");
        std::fs::write(&path, b"ok line\n\xff\xfe broken\n").unwrap();
        let novel = segment_file(&path, SourceFormat::Text).unwrap();
        assert_eq!(novel.chapters[0].title, FULL_TEXT_TITLE);
    }

    #[test]
    fn empty_text_file_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("empty.txt");
        std::fs::write(&path, "").unwrap();
        assert!(matches!(
            segment_file(&path, SourceFormat::Text),
            Err(SegmentError::Empty(_))
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gone.txt");
        assert!(matches!(
            segment_file(&path, SourceFormat::Text),
            Err(SegmentError::Io { .. })
        ));
    }

    #[test]
    fn epub_prefers_declared_metadata() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("file 作者：FromName.epub");
        std::fs::write(
            &path,
            build_epub(
                Some("Declared"),
                Some("Creator"),
                &[("c1", "a.xhtml", b"<html><body><h1>One</h1></body></html>")],
            ),
        )
        .unwrap();
        let novel = segment_file(&path, SourceFormat::Epub).unwrap();
        assert_eq!(novel.metadata.title, "Declared");
        assert_eq!(novel.metadata.author.as_deref(), Some("Creator"));
    }

    #[test]
    fn epub_without_creator_uses_filename_convention() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("Real Title 作者：Someone.epub");
        std::fs::write(
            &path,
            build_epub(
                Some("Declared"),
                None,
                &[("c1", "a.xhtml", b"<html><body><p>x</p></body></html>")],
            ),
        )
        .unwrap();
        let novel = segment_file(&path, SourceFormat::Epub).unwrap();
        assert_eq!(novel.metadata.title, "Real Title");
        assert_eq!(novel.metadata.author.as_deref(), Some("Someone"));
        assert_eq!(novel.chapters[0].title, "Chapter 1");
    }

    #[test]
    fn malformed_epub_is_a_container_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.epub");
        std::fs::write(&path, b"PK not really").unwrap();
        assert!(matches!(
            segment_file(&path, SourceFormat::Epub),
            Err(SegmentError::Container(_))
        ));
    }
}
