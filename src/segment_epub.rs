//! Spine-driven chapter segmentation for EPUB containers.
//!
//! Each document item in the spine becomes one chapter whose durable
//! position is the item's manifest id. Titles come from the item's most
//! prominent heading element, or a synthetic `Chapter {n}` label.

use std::sync::OnceLock;

use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};

use crate::epub::{decode_item, EpubContainer};
use crate::error::StaleReference;
use crate::models::{ChapterRecord, Position};

/// Elements whose text is never delivered.
const HIDDEN_ELEMENTS: &[&str] = &["script", "style", "head", "title", "noscript"];

/// Elements that end a line of visible text.
const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "br", "h1", "h2", "h3", "h4", "h5", "h6", "li", "tr", "td", "th", "section",
    "article", "blockquote", "pre", "hr", "dt", "dd", "figcaption", "header", "footer",
];

fn heading_selectors() -> &'static [Selector] {
    static SELECTORS: OnceLock<Vec<Selector>> = OnceLock::new();
    SELECTORS.get_or_init(|| {
        ["h1", "h2", "h3", "h4", "h5", "h6"]
            .iter()
            .filter_map(|tag| Selector::parse(tag).ok())
            .collect()
    })
}

fn body_selector() -> Option<&'static Selector> {
    static BODY: OnceLock<Option<Selector>> = OnceLock::new();
    BODY.get_or_init(|| Selector::parse("body").ok()).as_ref()
}

/// Produces the chapter table for an opened container.
///
/// Items that cannot be read or decoded are skipped with a warning; the
/// remaining chapters keep contiguous indices.
pub fn segment(container: &mut EpubContainer) -> Vec<ChapterRecord> {
    let mut chapters = Vec::new();

    let spine = container.spine_documents().to_vec();
    for item in spine {
        let Some(bytes) = container.read_document(&item.id) else {
            tracing::warn!(item = %item.id, "spine item missing from archive");
            continue;
        };
        let Some(markup) = decode_item(&bytes) else {
            tracing::warn!(item = %item.id, "skipping spine item with unknown encoding");
            continue;
        };

        let index = chapters.len();
        let title = extract_heading(&Html::parse_document(&markup))
            .unwrap_or_else(|| format!("Chapter {}", index + 1));

        chapters.push(ChapterRecord {
            index,
            title,
            position: Position::Item { id: item.id },
        });
    }

    chapters
}

/// Text of the most prominent non-empty heading, whitespace-collapsed.
pub fn extract_heading(html: &Html) -> Option<String> {
    heading_selectors().iter().find_map(|sel| {
        html.select(sel)
            .map(|el| collapse_whitespace(&el.text().collect::<String>()))
            .find(|text| !text.is_empty())
    })
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Converts XHTML to plain paragraphs.
///
/// Script and style content is removed, every visible line is trimmed,
/// empty lines are dropped, and the rest is joined with single newlines.
pub fn clean_html(markup: &str) -> String {
    let html = Html::parse_document(markup);
    let root = body_selector()
        .and_then(|sel| html.select(sel).next())
        .unwrap_or_else(|| html.root_element());

    let mut raw = String::new();
    collect_text(root, &mut raw);

    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(el) => {
                let name = el.name();
                if HIDDEN_ELEMENTS.contains(&name) {
                    continue;
                }
                let is_block = BLOCK_ELEMENTS.contains(&name);
                if is_block {
                    out.push('\n');
                }
                if let Some(child_el) = ElementRef::wrap(child) {
                    collect_text(child_el, out);
                }
                if is_block {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
}

/// Drops the leading lines of `text` that spell out the chapter title.
///
/// A heading with internal line breaks is cleaned into several lines, so
/// lines are compared whitespace-collapsed and joined until they either
/// equal the title or stop being a prefix of it.
pub fn strip_heading(text: &str, title: &str) -> String {
    let title = collapse_whitespace(title);
    if title.is_empty() {
        return text.to_string();
    }

    let lines: Vec<&str> = text.split('\n').collect();
    let mut seen = String::new();
    for (i, line) in lines.iter().enumerate() {
        let line = collapse_whitespace(line);
        if line.is_empty() {
            continue;
        }
        if !seen.is_empty() {
            seen.push(' ');
        }
        seen.push_str(&line);
        if seen == title {
            return lines[i + 1..].join("\n");
        }
        if !title.starts_with(&seen) {
            break;
        }
    }
    text.to_string()
}

/// Reads one item from an opened container and returns its cleaned text.
pub fn resolve_item(container: &mut EpubContainer, item_id: &str) -> Result<String, StaleReference> {
    let bytes = container
        .read_document(item_id)
        .ok_or_else(|| StaleReference::ItemMissing(item_id.to_string()))?;
    let markup = decode_item(&bytes)
        .ok_or_else(|| StaleReference::Unreadable(format!("item '{item_id}' has an unknown encoding")))?;
    Ok(clean_html(&markup))
}
