//! Heading-driven chapter segmentation for plain-text novels.
//!
//! The segmenter never copies chapter text. It records, for every detected
//! heading, the half-open line range of the body that follows it. Ranges are
//! contiguous: heading lines themselves sit between consecutive ranges and
//! the last range ends at the document's line count.

use crate::models::{ChapterRecord, Position};
use crate::patterns::PatternSet;

/// Title used when a document has no detectable headings.
pub const FULL_TEXT_TITLE: &str = "Full Text";

/// Title of the synthetic chapter covering text before the first heading.
pub const PREFACE_TITLE: &str = "Preface";

/// Splits `content` into lines exactly as the resolver does.
///
/// Lines are `\n`-delimited with one trailing `\r` removed, so CRLF files
/// number their lines the same way as LF files. A trailing newline yields a
/// final empty line.
pub fn split_lines(content: &str) -> Vec<&str> {
    content
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .collect()
}

/// Line-range segmenter over a [`PatternSet`].
pub struct TextSegmenter<'p> {
    patterns: &'p PatternSet,
}

impl Default for TextSegmenter<'static> {
    fn default() -> Self {
        Self::new(PatternSet::standard())
    }
}

impl<'p> TextSegmenter<'p> {
    pub fn new(patterns: &'p PatternSet) -> Self {
        Self { patterns }
    }

    /// Segments `content` into an ordered chapter table.
    ///
    /// Always returns at least one chapter.
    pub fn segment(&self, content: &str) -> Vec<ChapterRecord> {
        let lines = split_lines(content);
        let total = lines.len();

        let markers: Vec<(usize, &str)> = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| self.patterns.is_heading(line))
            .map(|(i, line)| (i, line.trim()))
            .collect();

        let Some(&(first_line, _)) = markers.first() else {
            return vec![ChapterRecord {
                index: 0,
                title: FULL_TEXT_TITLE.to_string(),
                position: Position::Lines {
                    start: 0,
                    end: total,
                },
            }];
        };

        let mut spans: Vec<(String, usize, usize)> = Vec::with_capacity(markers.len() + 1);

        if first_line > 0 && lines[..first_line].iter().any(|l| !l.trim().is_empty()) {
            spans.push((PREFACE_TITLE.to_string(), 0, first_line));
        }

        for (i, &(line_no, title)) in markers.iter().enumerate() {
            let end = markers.get(i + 1).map(|&(next, _)| next).unwrap_or(total);
            spans.push((title.to_string(), line_no + 1, end));
        }

        spans
            .into_iter()
            .enumerate()
            .map(|(index, (title, start, end))| ChapterRecord {
                index,
                title,
                position: Position::Lines { start, end },
            })
            .collect()
    }
}
