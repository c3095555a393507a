//! In-memory [`CatalogStore`] implementation for tests and ephemeral runs.
//!
//! All state lives behind one `RwLock`, so every write (including a full
//! chapter replacement) is atomic with respect to readers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::{
    ChapterId, ChapterLocation, ChapterRecord, ChapterSummary, NovelFilter, NovelId,
    NovelMetadata, NovelSummary, SegmentedNovel,
};

use super::{path_key, CatalogStore};

struct StoredNovel {
    summary: NovelSummary,
    chapters: Vec<(ChapterId, ChapterRecord)>,
}

#[derive(Default)]
struct State {
    novels: HashMap<NovelId, StoredNovel>,
    by_path: HashMap<String, NovelId>,
    chapter_owner: HashMap<ChapterId, NovelId>,
}

impl State {
    fn upsert(&mut self, metadata: &NovelMetadata) -> NovelId {
        let key = path_key(&metadata.file_path);
        if let Some(id) = self.by_path.get(&key) {
            if let Some(stored) = self.novels.get_mut(id) {
                stored.summary.title = metadata.title.clone();
                stored.summary.author = metadata.author.clone();
                stored.summary.format = metadata.format;
                stored.summary.stamp = metadata.stamp;
                stored.summary.content_hash = metadata.content_hash.clone();
                return id.clone();
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.by_path.insert(key.clone(), id.clone());
        self.novels.insert(
            id.clone(),
            StoredNovel {
                summary: NovelSummary {
                    id: id.clone(),
                    title: metadata.title.clone(),
                    author: metadata.author.clone(),
                    file_path: key,
                    format: metadata.format,
                    chapter_count: 0,
                    stamp: metadata.stamp,
                    content_hash: metadata.content_hash.clone(),
                },
                chapters: Vec::new(),
            },
        );
        id
    }

    fn replace(&mut self, novel_id: &str, chapters: &[ChapterRecord]) -> Result<()> {
        let stored = self
            .novels
            .get_mut(novel_id)
            .ok_or_else(|| anyhow!("novel {novel_id} does not exist"))?;

        for (chapter_id, _) in stored.chapters.drain(..) {
            self.chapter_owner.remove(&chapter_id);
        }
        for record in chapters {
            let chapter_id = uuid::Uuid::new_v4().to_string();
            self.chapter_owner
                .insert(chapter_id.clone(), novel_id.to_string());
            stored.chapters.push((chapter_id, record.clone()));
        }
        stored.chapters.sort_by_key(|(_, c)| c.index);
        stored.summary.chapter_count = stored.chapters.len();
        Ok(())
    }

    fn remove(&mut self, novel_id: &str) -> Option<StoredNovel> {
        let stored = self.novels.remove(novel_id)?;
        self.by_path.remove(&stored.summary.file_path);
        for (chapter_id, _) in &stored.chapters {
            self.chapter_owner.remove(chapter_id);
        }
        Some(stored)
    }
}

/// In-memory catalog.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| anyhow!("catalog lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| anyhow!("catalog lock poisoned"))
    }
}

#[async_trait]
impl CatalogStore for InMemoryStore {
    async fn find_novel_by_path(&self, path: &Path) -> Result<Option<NovelSummary>> {
        let state = self.read()?;
        Ok(state
            .by_path
            .get(&path_key(path))
            .and_then(|id| state.novels.get(id))
            .map(|s| s.summary.clone()))
    }

    async fn upsert_novel(&self, metadata: &NovelMetadata) -> Result<NovelId> {
        Ok(self.write()?.upsert(metadata))
    }

    async fn replace_chapters(&self, novel_id: &str, chapters: &[ChapterRecord]) -> Result<()> {
        self.write()?.replace(novel_id, chapters)
    }

    async fn save_novel(&self, novel: &SegmentedNovel) -> Result<NovelId> {
        let mut state = self.write()?;
        let id = state.upsert(&novel.metadata);
        state.replace(&id, &novel.chapters)?;
        Ok(id)
    }

    async fn delete_novel(&self, path: &Path) -> Result<Option<(NovelId, String)>> {
        let mut state = self.write()?;
        let Some(id) = state.by_path.get(&path_key(path)).cloned() else {
            return Ok(None);
        };
        Ok(state.remove(&id).map(|s| (id, s.summary.title)))
    }

    async fn rewrite_path(&self, old_path: &Path, new_path: &Path) -> Result<bool> {
        let mut state = self.write()?;
        let old_key = path_key(old_path);
        let new_key = path_key(new_path);
        let Some(id) = state.by_path.get(&old_key).cloned() else {
            return Ok(false);
        };
        if old_key == new_key {
            return Ok(true);
        }

        if let Some(displaced) = state.by_path.get(&new_key).cloned() {
            state.remove(&displaced);
        }
        state.by_path.remove(&old_key);
        state.by_path.insert(new_key.clone(), id.clone());
        if let Some(stored) = state.novels.get_mut(&id) {
            stored.summary.file_path = new_key;
        }
        Ok(true)
    }

    async fn list_novels(&self, filter: &NovelFilter) -> Result<Vec<NovelSummary>> {
        let state = self.read()?;
        let mut out: Vec<NovelSummary> = state
            .novels
            .values()
            .map(|s| &s.summary)
            .filter(|summary| filter.matches(summary))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.title.cmp(&b.title).then_with(|| a.file_path.cmp(&b.file_path)));
        Ok(out)
    }

    async fn get_novel(&self, novel_id: &str) -> Result<Option<NovelSummary>> {
        Ok(self.read()?.novels.get(novel_id).map(|s| s.summary.clone()))
    }

    async fn list_chapters(&self, novel_id: &str) -> Result<Option<Vec<ChapterSummary>>> {
        let state = self.read()?;
        Ok(state.novels.get(novel_id).map(|stored| {
            stored
                .chapters
                .iter()
                .map(|(id, record)| ChapterSummary {
                    id: id.clone(),
                    title: record.title.clone(),
                    index: record.index,
                })
                .collect()
        }))
    }

    async fn get_chapter_position(&self, chapter_id: &str) -> Result<Option<ChapterLocation>> {
        let state = self.read()?;
        let Some(stored) = state
            .chapter_owner
            .get(chapter_id)
            .and_then(|novel_id| state.novels.get(novel_id))
        else {
            return Ok(None);
        };
        Ok(stored
            .chapters
            .iter()
            .find(|(id, _)| id == chapter_id)
            .map(|(id, record)| ChapterLocation {
                chapter_id: id.clone(),
                novel_id: stored.summary.id.clone(),
                title: record.title.clone(),
                index: record.index,
                file_path: PathBuf::from(&stored.summary.file_path),
                position: record.position.clone(),
            }))
    }
}
