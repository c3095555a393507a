//! EPUB container access.
//!
//! Wraps [`epub::doc::EpubDoc`]: package metadata, the reading-order spine
//! restricted to document items, and raw item bytes by manifest id.

use std::io::Cursor;
use std::path::Path;

use ::epub::doc::EpubDoc;

use crate::error::SegmentError;

/// Media types that carry readable chapter content.
const DOCUMENT_MEDIA_TYPES: &[&str] = &["application/xhtml+xml", "text/html"];

fn is_document(mime: &str) -> bool {
    DOCUMENT_MEDIA_TYPES
        .iter()
        .any(|t| mime.eq_ignore_ascii_case(t))
}

/// One document item of the spine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpineDocument {
    /// Manifest id, the durable chapter reference.
    pub id: String,
    pub mime: String,
}

/// An opened EPUB file.
pub struct EpubContainer {
    doc: EpubDoc<Cursor<Vec<u8>>>,
    spine: Vec<SpineDocument>,
    title: Option<String>,
    creator: Option<String>,
}

impl EpubContainer {
    pub fn open(path: &Path) -> Result<Self, SegmentError> {
        let bytes = std::fs::read(path).map_err(|e| SegmentError::io(path, e))?;
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, SegmentError> {
        let mut doc = EpubDoc::from_reader(Cursor::new(bytes))
            .map_err(|e| SegmentError::Container(e.to_string()))?;

        let chapters = doc.get_num_chapters();
        if chapters == 0 {
            return Err(SegmentError::Container("package has an empty spine".to_string()));
        }

        let mut spine = Vec::with_capacity(chapters);
        for index in 0..chapters {
            doc.set_current_chapter(index);
            let Some(id) = doc.get_current_id() else {
                continue;
            };
            // Spine references to ids missing from the manifest have no mime.
            match doc.get_resource_mime(&id) {
                Some(mime) if is_document(&mime) => spine.push(SpineDocument { id, mime }),
                _ => {}
            }
        }

        let title = metadata(&doc, "title");
        let creator = metadata(&doc, "creator");
        Ok(Self {
            doc,
            spine,
            title,
            creator,
        })
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn creator(&self) -> Option<&str> {
        self.creator.as_deref()
    }

    /// Spine entries in reading order, restricted to document content.
    pub fn spine_documents(&self) -> &[SpineDocument] {
        &self.spine
    }

    /// Raw bytes of a spine document by manifest id.
    ///
    /// `None` when the id is not a spine document or its archive entry is
    /// absent.
    pub fn read_document(&mut self, id: &str) -> Option<Vec<u8>> {
        if !self.spine.iter().any(|item| item.id == id) {
            return None;
        }
        self.doc.get_resource(id).map(|(bytes, _mime)| bytes)
    }
}

fn metadata(doc: &EpubDoc<Cursor<Vec<u8>>>, name: &str) -> Option<String> {
    doc.mdata(name)
        .map(|item| item.value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Decodes item bytes as UTF-8, falling back to GB18030.
///
/// Returns `None` when neither encoding accepts the bytes.
pub fn decode_item(bytes: &[u8]) -> Option<String> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    if let Ok(s) = std::str::from_utf8(bytes) {
        return Some(s.to_string());
    }
    encoding_rs::GB18030
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(|s| s.into_owned())
}
