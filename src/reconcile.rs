//! Filesystem-to-catalog reconciliation.
//!
//! The [`Reconciler`] keeps the catalog consistent with the watched library
//! roots. It is driven in two ways:
//!
//! - [`Reconciler::startup`]: orphan sweep, full walk, and removal of
//!   catalogued paths the walk no longer finds.
//! - [`Reconciler::sync_path`], [`Reconciler::remove_path`] and
//!   [`Reconciler::move_path`]: single-path actions issued by the
//!   [`watcher`](crate::watcher).
//!
//! Per-file failures are logged and skipped; they never abort a scan.
//! Callers are responsible for serializing actions on the same path.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use walkdir::WalkDir;

use crate::config::LibraryConfig;
use crate::models::{NovelFilter, SourceFormat};
use crate::segment::{file_stamp, segment_file};
use crate::store::{path_key, CatalogStore};

/// Patterns excluded from every library root.
const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/.*/**"];

/// Which files under the library roots are catalogued.
#[derive(Debug, Clone)]
pub struct LibraryFilter {
    roots: Vec<PathBuf>,
    text_extensions: Vec<String>,
    exclude_set: GlobSet,
    follow_symlinks: bool,
}

impl LibraryFilter {
    /// Builds the filter, resolving roots to absolute paths so walk results
    /// and watcher events produce identical catalog keys.
    pub fn from_config(config: &LibraryConfig) -> Result<Self> {
        let mut roots = Vec::with_capacity(config.roots.len());
        for root in &config.roots {
            let resolved = match root.canonicalize() {
                Ok(path) => path,
                Err(_) => std::path::absolute(root)
                    .with_context(|| format!("Invalid library root: {}", root.display()))?,
            };
            roots.push(resolved);
        }

        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(config.exclude_globs.clone());

        Ok(Self {
            roots,
            text_extensions: config.text_extensions.clone(),
            exclude_set: build_globset(&excludes)?,
            follow_symlinks: config.follow_symlinks,
        })
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn root_of(&self, path: &Path) -> Option<&Path> {
        self.roots
            .iter()
            .map(PathBuf::as_path)
            .find(|root| path.starts_with(root))
    }

    /// Format of `path` when it belongs to the library, `None` otherwise.
    ///
    /// Only the path is inspected; the file need not exist.
    pub fn format_of(&self, path: &Path) -> Option<SourceFormat> {
        let root = self.root_of(path)?;
        let relative = path.strip_prefix(root).unwrap_or(path);
        if self.exclude_set.is_match(relative) {
            return None;
        }
        SourceFormat::detect(path, &self.text_extensions)
    }

    /// Every catalogued file currently under the roots, sorted by path.
    ///
    /// Unreadable directory entries are logged and skipped.
    pub fn walk(&self) -> Vec<(PathBuf, SourceFormat)> {
        let mut found = Vec::new();
        for root in &self.roots {
            if !root.is_dir() {
                tracing::warn!(root = %root.display(), "library root is not a directory");
                continue;
            }
            self.collect(root, &mut found);
        }

        // Sort for deterministic ordering
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found.dedup_by(|a, b| a.0 == b.0);
        found
    }

    /// Catalogued files below one directory inside the library.
    pub fn walk_dir(&self, dir: &Path) -> Vec<(PathBuf, SourceFormat)> {
        let mut found = Vec::new();
        if self.root_of(dir).is_some() && dir.is_dir() {
            self.collect(dir, &mut found);
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    /// Whether `path` lies under one of the roots.
    pub fn contains(&self, path: &Path) -> bool {
        self.root_of(path).is_some()
    }

    fn collect(&self, dir: &Path, found: &mut Vec<(PathBuf, SourceFormat)>) {
        let walker = WalkDir::new(dir).follow_links(self.follow_symlinks);
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("skipping unreadable entry: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(format) = self.format_of(entry.path()) {
                found.push((entry.into_path(), format));
            }
        }
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {pattern}"))?);
    }
    Ok(builder.build()?)
}

/// What a single-path action did to the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOutcome {
    /// A new novel was inserted.
    Created,
    /// A tracked novel was re-segmented in place.
    Updated,
    /// The file's stamp or content matched the catalog; chapters were kept.
    Unchanged,
    /// The path's novel was deleted.
    Removed,
    /// A same-directory rename rewrote the novel's path.
    Moved,
    /// The path is not part of the library, or nothing was tracked there.
    Ignored,
    /// Segmentation failed; the catalog was left as it was.
    Skipped,
}

/// Counts from one startup reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub orphans_removed: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub skipped: usize,
}

impl ScanReport {
    fn record(&mut self, outcome: SyncOutcome) {
        match outcome {
            SyncOutcome::Created => self.created += 1,
            SyncOutcome::Updated => self.updated += 1,
            SyncOutcome::Unchanged => self.unchanged += 1,
            SyncOutcome::Removed => self.removed += 1,
            SyncOutcome::Skipped => self.skipped += 1,
            SyncOutcome::Moved | SyncOutcome::Ignored => {}
        }
    }
}

/// How [`Reconciler::sync_file`] decides a tracked file is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeCheck {
    /// An equal size and millisecond mtime is enough. Used by full walks.
    Stamp,
    /// Always re-read the file and compare content hashes. Used for
    /// watcher events, which are themselves evidence of a write.
    Content,
}

/// Drives segmentation and deletion so the catalog tracks the library.
pub struct Reconciler {
    store: Arc<dyn CatalogStore>,
    library: LibraryFilter,
}

impl Reconciler {
    pub fn new(store: Arc<dyn CatalogStore>, library: LibraryFilter) -> Self {
        Self { store, library }
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    pub fn library(&self) -> &LibraryFilter {
        &self.library
    }

    /// Deletes every catalogued novel whose source file no longer exists.
    pub async fn sweep_orphans(&self) -> Result<usize> {
        let novels = self.store.list_novels(&NovelFilter::default()).await?;
        let mut removed = 0;
        for novel in novels {
            let path = PathBuf::from(&novel.file_path);
            if path.is_file() {
                continue;
            }
            if self.store.delete_novel(&path).await?.is_some() {
                tracing::info!(path = %path.display(), title = %novel.title, "removed orphaned novel");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Full startup reconciliation.
    ///
    /// Sweeps orphans, segments new and changed files, then removes novels
    /// whose paths the walk did not yield (excluded or no longer supported).
    pub async fn startup(&self) -> Result<ScanReport> {
        let mut report = ScanReport {
            orphans_removed: self.sweep_orphans().await?,
            ..ScanReport::default()
        };

        let files = self.library.walk();
        let mut seen: HashSet<String> = HashSet::with_capacity(files.len());
        for (path, format) in files {
            seen.insert(path_key(&path));
            let outcome = self.sync_file(&path, format, ChangeCheck::Stamp).await?;
            report.record(outcome);
        }

        for novel in self.store.list_novels(&NovelFilter::default()).await? {
            if seen.contains(&novel.file_path) {
                continue;
            }
            let path = PathBuf::from(&novel.file_path);
            report.record(self.remove_path(&path).await?);
        }

        tracing::info!(
            orphans = report.orphans_removed,
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            removed = report.removed,
            skipped = report.skipped,
            "library reconciled"
        );
        Ok(report)
    }

    /// Brings the catalog entry for `path` in line with the file on disk.
    ///
    /// A missing file is treated as a deletion, so a create and delete of
    /// the same path collapse to nothing.
    pub async fn sync_path(&self, path: &Path) -> Result<SyncOutcome> {
        let Some(format) = self.library.format_of(path) else {
            return Ok(SyncOutcome::Ignored);
        };
        if !path.is_file() {
            return self.remove_path(path).await;
        }
        self.sync_file(path, format, ChangeCheck::Content).await
    }

    async fn sync_file(
        &self,
        path: &Path,
        format: SourceFormat,
        check: ChangeCheck,
    ) -> Result<SyncOutcome> {
        let existing = self.store.find_novel_by_path(path).await?;

        let stamp = match file_stamp(path) {
            Ok(stamp) => stamp,
            Err(e) => {
                tracing::warn!(path = %path.display(), "cannot stat file: {e}");
                return Ok(SyncOutcome::Skipped);
            }
        };
        if let Some(novel) = &existing {
            if check == ChangeCheck::Stamp && novel.stamp == stamp && novel.format == format {
                tracing::debug!(path = %path.display(), "unchanged");
                return Ok(SyncOutcome::Unchanged);
            }
        }

        let owned = path.to_path_buf();
        let segmented = tokio::task::spawn_blocking(move || segment_file(&owned, format))
            .await
            .context("segmentation task failed")?;
        let novel = match segmented {
            Ok(novel) => novel,
            Err(e) => {
                tracing::warn!(path = %path.display(), "skipping file: {e}");
                return Ok(SyncOutcome::Skipped);
            }
        };

        // Same bytes under a new stamp: refresh the stamp, keep chapter ids.
        if let Some(tracked) = &existing {
            if tracked.format == format && tracked.content_hash == novel.metadata.content_hash {
                if tracked.stamp != novel.metadata.stamp {
                    self.store.upsert_novel(&novel.metadata).await?;
                }
                tracing::debug!(path = %path.display(), "content unchanged");
                return Ok(SyncOutcome::Unchanged);
            }
        }

        let id = self.store.save_novel(&novel).await?;
        let outcome = if existing.is_some() {
            SyncOutcome::Updated
        } else {
            SyncOutcome::Created
        };
        tracing::info!(
            path = %path.display(),
            novel_id = %id,
            title = %novel.metadata.title,
            chapters = novel.chapters.len(),
            ?outcome,
            "segmented"
        );
        Ok(outcome)
    }

    /// Deletes the novel recorded at `path`, if any.
    pub async fn remove_path(&self, path: &Path) -> Result<SyncOutcome> {
        match self.store.delete_novel(path).await? {
            Some((id, title)) => {
                tracing::info!(path = %path.display(), novel_id = %id, %title, "removed");
                Ok(SyncOutcome::Removed)
            }
            None => Ok(SyncOutcome::Ignored),
        }
    }

    /// Reconciles everything at or below `dir` after the directory itself
    /// was created, removed or renamed.
    pub async fn sync_dir(&self, dir: &Path) -> Result<ScanReport> {
        let mut report = ScanReport::default();

        for novel in self.store.list_novels(&NovelFilter::default()).await? {
            let path = PathBuf::from(&novel.file_path);
            if path.starts_with(dir) && !path.is_file() {
                report.record(self.remove_path(&path).await?);
            }
        }
        for (path, format) in self.library.walk_dir(dir) {
            report.record(self.sync_file(&path, format, ChangeCheck::Stamp).await?);
        }
        Ok(report)
    }

    /// Applies a rename from `from` to `to`.
    ///
    /// A rename within one directory keeps the novel's identity and chapters.
    /// A move across directories deletes the source entry and segments the
    /// destination afresh.
    pub async fn move_path(&self, from: &Path, to: &Path) -> Result<SyncOutcome> {
        let same_parent = from.parent().is_some() && from.parent() == to.parent();
        let tracked = self.store.find_novel_by_path(from).await?;
        let to_format = self.library.format_of(to);

        if let Some(novel) = tracked {
            if same_parent && to_format == Some(novel.format) && to.is_file() {
                self.store.rewrite_path(from, to).await?;
                tracing::info!(
                    from = %from.display(),
                    to = %to.display(),
                    novel_id = %novel.id,
                    "renamed in place"
                );
                return Ok(SyncOutcome::Moved);
            }
            self.remove_path(from).await?;
        }

        self.sync_path(to).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epub::tests::build_epub;
    use crate::resolve::resolve;
    use crate::store::memory::InMemoryStore;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn library(root: &Path) -> LibraryFilter {
        LibraryFilter::from_config(&LibraryConfig {
            roots: vec![root.to_path_buf()],
            exclude_globs: vec!["**/drafts/**".to_string()],
            ..LibraryConfig::default()
        })
        .unwrap()
    }

    fn setup() -> (TempDir, PathBuf, Reconciler) {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let reconciler = Reconciler::new(Arc::new(InMemoryStore::new()), library(&root));
        (tmp, root, reconciler)
    }

    fn touch_later(path: &Path, secs: u64) {
        set_mtime(path, SystemTime::now() + Duration::from_secs(secs));
    }

    fn set_mtime(path: &Path, at: SystemTime) {
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(at)
            .unwrap();
    }

    /// A whole second, so offsets below 1000 ms share it.
    fn second() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    async fn all(reconciler: &Reconciler) -> Vec<crate::models::NovelSummary> {
        reconciler
            .store()
            .list_novels(&NovelFilter::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn startup_catalogues_supported_files_only() {
        let (_tmp, root, reconciler) = setup();
        std::fs::write(root.join("a.txt"), "第一章\n甲\n第二章\n乙").unwrap();
        std::fs::write(root.join("notes.pdf"), "ignored").unwrap();
        std::fs::create_dir_all(root.join("drafts")).unwrap();
        std::fs::write(root.join("drafts/b.txt"), "draft").unwrap();
        std::fs::create_dir_all(root.join(".hidden")).unwrap();
        std::fs::write(root.join(".hidden/c.txt"), "hidden").unwrap();
        std::fs::write(
            root.join("d.epub"),
            build_epub(Some("D"), None, &[("c1", "1.xhtml", b"<h1>One</h1>")]),
        )
        .unwrap();

        let report = reconciler.startup().await.unwrap();
        assert_eq!(report.created, 2);

        let novels = all(&reconciler).await;
        assert_eq!(
            novels.iter().map(|n| n.title.as_str()).collect::<Vec<_>>(),
            vec!["D", "a"]
        );
        assert_eq!(novels[1].chapter_count, 2);
    }

    #[tokio::test]
    async fn rescan_skips_unchanged_and_resegments_modified() {
        let (_tmp, root, reconciler) = setup();
        let path = root.join("a.txt");
        std::fs::write(&path, "第一章\n甲").unwrap();
        reconciler.startup().await.unwrap();
        let id = all(&reconciler).await[0].id.clone();

        let report = reconciler.startup().await.unwrap();
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.created + report.updated, 0);

        std::fs::write(&path, "第一章\n甲\n第二章\n乙\n第三章\n丙").unwrap();
        touch_later(&path, 10);
        let report = reconciler.startup().await.unwrap();
        assert_eq!(report.updated, 1);

        let novels = all(&reconciler).await;
        assert_eq!(novels[0].id, id);
        assert_eq!(novels[0].chapter_count, 3);
    }

    #[tokio::test]
    async fn rescan_sees_same_size_rewrite_within_one_second() {
        let (_tmp, root, reconciler) = setup();
        let path = root.join("a.txt");
        std::fs::write(&path, "第一章\n甲").unwrap();
        set_mtime(&path, second() + Duration::from_millis(100));
        reconciler.startup().await.unwrap();

        std::fs::write(&path, "第二章\n乙").unwrap();
        set_mtime(&path, second() + Duration::from_millis(700));
        let report = reconciler.startup().await.unwrap();
        assert_eq!(report.updated, 1);

        let chapters = reconciler
            .store()
            .list_chapters(&all(&reconciler).await[0].id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chapters[0].title, "第二章");
    }

    #[tokio::test]
    async fn sync_path_resegments_even_when_stamp_is_identical() {
        let (_tmp, root, reconciler) = setup();
        let path = root.join("a.txt");
        std::fs::write(&path, "第一章\n甲甲甲甲甲甲甲甲甲甲x").unwrap();
        set_mtime(&path, second() + Duration::from_millis(250));
        assert_eq!(
            reconciler.sync_path(&path).await.unwrap(),
            SyncOutcome::Created
        );
        assert_eq!(all(&reconciler).await[0].chapter_count, 1);

        // Same byte length and the same pinned mtime.
        std::fs::write(&path, "第一章\n甲\n第二章\n乙\n第三章\n丙").unwrap();
        set_mtime(&path, second() + Duration::from_millis(250));
        assert_eq!(
            reconciler.sync_path(&path).await.unwrap(),
            SyncOutcome::Updated
        );
        assert_eq!(all(&reconciler).await[0].chapter_count, 3);
    }

    #[tokio::test]
    async fn touch_without_content_change_keeps_chapter_ids() {
        let (_tmp, root, reconciler) = setup();
        let path = root.join("a.txt");
        std::fs::write(&path, "第一章\n甲\n第二章\n乙").unwrap();
        reconciler.sync_path(&path).await.unwrap();
        let novel = all(&reconciler).await.remove(0);
        let before = reconciler.store().list_chapters(&novel.id).await.unwrap();

        touch_later(&path, 10);
        assert_eq!(
            reconciler.sync_path(&path).await.unwrap(),
            SyncOutcome::Unchanged
        );

        let refreshed = all(&reconciler).await.remove(0);
        assert_ne!(refreshed.stamp, novel.stamp);
        assert_eq!(refreshed.content_hash, novel.content_hash);
        let after = reconciler.store().list_chapters(&novel.id).await.unwrap();
        assert_eq!(after, before);

        // The refreshed stamp lets the next walk skip the file.
        let report = reconciler.startup().await.unwrap();
        assert_eq!(report.unchanged, 1);
    }

    #[tokio::test]
    async fn startup_sweeps_orphans_and_excluded_entries() {
        let (_tmp, root, reconciler) = setup();
        std::fs::write(root.join("a.txt"), "x").unwrap();
        std::fs::write(root.join("b.txt"), "y").unwrap();
        reconciler.startup().await.unwrap();

        std::fs::remove_file(root.join("a.txt")).unwrap();
        let report = reconciler.startup().await.unwrap();
        assert_eq!(report.orphans_removed, 1);
        assert_eq!(all(&reconciler).await.len(), 1);

        // Same store, narrower library: the surviving entry is no longer walked.
        let narrowed = Reconciler::new(
            reconciler.store().clone(),
            LibraryFilter::from_config(&LibraryConfig {
                roots: vec![root.clone()],
                text_extensions: vec!["md".to_string()],
                ..LibraryConfig::default()
            })
            .unwrap(),
        );
        let report = narrowed.startup().await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(all(&narrowed).await.is_empty());
    }

    #[tokio::test]
    async fn bad_file_is_skipped_without_aborting() {
        let (_tmp, root, reconciler) = setup();
        std::fs::write(root.join("broken.epub"), b"not a zip").unwrap();
        std::fs::write(root.join("fine.txt"), "text").unwrap();

        let report = reconciler.startup().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.created, 1);
    }

    #[tokio::test]
    async fn sync_of_missing_path_removes_or_ignores() {
        let (_tmp, root, reconciler) = setup();
        let path = root.join("a.txt");
        assert_eq!(
            reconciler.sync_path(&path).await.unwrap(),
            SyncOutcome::Ignored
        );

        std::fs::write(&path, "x").unwrap();
        assert_eq!(
            reconciler.sync_path(&path).await.unwrap(),
            SyncOutcome::Created
        );
        std::fs::remove_file(&path).unwrap();
        assert_eq!(
            reconciler.sync_path(&path).await.unwrap(),
            SyncOutcome::Removed
        );
        assert_eq!(
            reconciler.sync_path(&root.join("x.pdf")).await.unwrap(),
            SyncOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn rename_in_same_directory_keeps_identity_and_chapters() {
        let (_tmp, root, reconciler) = setup();
        let from = root.join("old.txt");
        std::fs::write(&from, "第一章\n内容").unwrap();
        reconciler.sync_path(&from).await.unwrap();
        let novel = all(&reconciler).await.remove(0);
        let chapters = reconciler
            .store()
            .list_chapters(&novel.id)
            .await
            .unwrap()
            .unwrap();

        let to = root.join("new.txt");
        std::fs::rename(&from, &to).unwrap();
        assert_eq!(
            reconciler.move_path(&from, &to).await.unwrap(),
            SyncOutcome::Moved
        );

        let loc = reconciler
            .store()
            .get_chapter_position(&chapters[0].id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loc.novel_id, novel.id);
        assert_eq!(loc.file_path, to);
        assert_eq!(resolve(&loc.file_path, &loc.position).unwrap(), "内容");
    }

    #[tokio::test]
    async fn move_across_directories_creates_new_identity() {
        let (_tmp, root, reconciler) = setup();
        let from = root.join("a.txt");
        std::fs::write(&from, "body").unwrap();
        reconciler.sync_path(&from).await.unwrap();
        let old_id = all(&reconciler).await[0].id.clone();

        std::fs::create_dir_all(root.join("sub")).unwrap();
        let to = root.join("sub/a.txt");
        std::fs::rename(&from, &to).unwrap();
        assert_eq!(
            reconciler.move_path(&from, &to).await.unwrap(),
            SyncOutcome::Created
        );

        let novels = all(&reconciler).await;
        assert_eq!(novels.len(), 1);
        assert_ne!(novels[0].id, old_id);
        assert_eq!(novels[0].file_path, path_key(&to));
    }

    #[tokio::test]
    async fn directory_rename_moves_contents() {
        let (_tmp, root, reconciler) = setup();
        std::fs::create_dir_all(root.join("old")).unwrap();
        std::fs::write(root.join("old/a.txt"), "a").unwrap();
        std::fs::write(root.join("old/b.txt"), "b").unwrap();
        reconciler.startup().await.unwrap();

        std::fs::rename(root.join("old"), root.join("new")).unwrap();
        let removed = reconciler.sync_dir(&root.join("old")).await.unwrap();
        assert_eq!(removed.removed, 2);
        let added = reconciler.sync_dir(&root.join("new")).await.unwrap();
        assert_eq!(added.created, 2);

        let novels = reconciler
            .store()
            .list_novels(&NovelFilter::folder("new"))
            .await
            .unwrap();
        assert_eq!(novels.len(), 2);
    }

    #[tokio::test]
    async fn rename_to_unsupported_extension_removes() {
        let (_tmp, root, reconciler) = setup();
        let from = root.join("a.txt");
        std::fs::write(&from, "body").unwrap();
        reconciler.sync_path(&from).await.unwrap();

        let to = root.join("a.bak");
        std::fs::rename(&from, &to).unwrap();
        assert_eq!(
            reconciler.move_path(&from, &to).await.unwrap(),
            SyncOutcome::Ignored
        );
        assert!(all(&reconciler).await.is_empty());
    }
}
