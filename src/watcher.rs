//! Live library watching.
//!
//! A [`LibraryWatcher`] owns a `notify` watcher over every library root and
//! a dispatcher task that turns filesystem events into reconciler actions.
//!
//! # Ordering
//!
//! - Events for one path are debounced: an action runs only after the path
//!   has been quiet for the configured period.
//! - At most one action per path is in flight. Events that arrive meanwhile
//!   are held and flushed once it finishes, so successive writes to a file
//!   are segmented in order.
//! - Actions are level-triggered: a flush re-reads the filesystem instead of
//!   replaying individual events, so a create followed by a delete of an
//!   untracked path leaves the catalog untouched.
//! - The notify watcher is registered before the startup reconciliation
//!   runs. Events raised during the scan are buffered and only processed
//!   once the scan has completed.
//!
//! # Shutdown
//!
//! [`LibraryWatcher::shutdown`] stops event intake, lets any in-flight
//! segmentation finish, then returns. Debounced actions that have not
//! started are dropped; the next startup reconciliation picks them up.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::reconcile::{Reconciler, ScanReport};

/// A reconciler action derived from one filesystem event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchAction {
    /// Re-check one path against the catalog.
    Sync(PathBuf),
    /// A rename whose source and destination are both known.
    Move { from: PathBuf, to: PathBuf },
    /// The event stream lost events; reconcile everything.
    Rescan,
}

/// Maps a `notify` event to the actions it implies.
pub fn classify_event(event: &Event) -> Vec<WatchAction> {
    if event.need_rescan() {
        return vec![WatchAction::Rescan];
    }
    match &event.kind {
        EventKind::Access(_) => Vec::new(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            vec![WatchAction::Move {
                from: event.paths[0].clone(),
                to: event.paths[1].clone(),
            }]
        }
        _ => event
            .paths
            .iter()
            .cloned()
            .map(WatchAction::Sync)
            .collect(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingKind {
    Sync,
    Move { from: PathBuf },
}

#[derive(Debug)]
struct Pending {
    kind: PendingKind,
    deadline: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RescanState {
    Idle,
    Pending,
    Running,
}

/// Debounce and per-path serialization state of the dispatcher.
#[derive(Debug)]
struct Schedule {
    debounce: Duration,
    pending: HashMap<PathBuf, Pending>,
    in_flight: HashSet<PathBuf>,
    rescan: RescanState,
}

impl Schedule {
    fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            pending: HashMap::new(),
            in_flight: HashSet::new(),
            rescan: RescanState::Idle,
        }
    }

    fn push(&mut self, action: WatchAction, now: Instant) {
        let deadline = now + self.debounce;
        match action {
            WatchAction::Rescan => {
                if self.rescan == RescanState::Idle {
                    self.rescan = RescanState::Pending;
                }
            }
            WatchAction::Sync(path) => {
                self.pending
                    .entry(path)
                    .and_modify(|p| p.deadline = deadline)
                    .or_insert(Pending {
                        kind: PendingKind::Sync,
                        deadline,
                    });
            }
            WatchAction::Move { from, to } => {
                // A rename supersedes whatever was queued for its source; a
                // chain a -> b -> c collapses to a -> c.
                let origin = match self.pending.remove(&from) {
                    Some(Pending {
                        kind: PendingKind::Move { from: earlier },
                        ..
                    }) => earlier,
                    _ => from,
                };
                self.pending.insert(
                    to,
                    Pending {
                        kind: PendingKind::Move { from: origin },
                        deadline,
                    },
                );
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        if self.rescan != RescanState::Idle {
            return None;
        }
        self.pending.values().map(|p| p.deadline).min()
    }

    fn is_busy(&self, path: &Path, kind: &PendingKind) -> bool {
        self.in_flight.contains(path)
            || matches!(kind, PendingKind::Move { from } if self.in_flight.contains(from))
    }

    /// Removes and returns the actions whose quiet period has elapsed and
    /// whose paths are not already being processed.
    fn take_ready(&mut self, now: Instant) -> Vec<WatchAction> {
        match self.rescan {
            RescanState::Running => return Vec::new(),
            RescanState::Pending if self.in_flight.is_empty() => {
                self.rescan = RescanState::Running;
                self.pending.clear();
                return vec![WatchAction::Rescan];
            }
            RescanState::Pending => return Vec::new(),
            RescanState::Idle => {}
        }

        let mut due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        due.sort();

        let mut actions = Vec::with_capacity(due.len());
        for path in due {
            let busy = match self.pending.get(&path) {
                Some(p) => self.is_busy(&path, &p.kind),
                None => continue,
            };
            if busy {
                continue;
            }
            let Some(pending) = self.pending.remove(&path) else {
                continue;
            };
            let action = match pending.kind {
                PendingKind::Sync => WatchAction::Sync(path),
                PendingKind::Move { from } => WatchAction::Move { from, to: path },
            };
            for p in action_paths(&action) {
                self.in_flight.insert(p.clone());
            }
            actions.push(action);
        }
        actions
    }

    fn finish(&mut self, action: &WatchAction) {
        match action {
            WatchAction::Rescan => self.rescan = RescanState::Idle,
            other => {
                for p in action_paths(other) {
                    self.in_flight.remove(p);
                }
            }
        }
    }
}

fn action_paths(action: &WatchAction) -> Vec<&PathBuf> {
    match action {
        WatchAction::Sync(path) => vec![path],
        WatchAction::Move { from, to } => vec![to, from],
        WatchAction::Rescan => Vec::new(),
    }
}

/// Handle to a running watcher. Dropping it without calling
/// [`shutdown`](LibraryWatcher::shutdown) stops event delivery but does not
/// wait for in-flight work.
pub struct LibraryWatcher {
    cancel: CancellationToken,
    tracker: TaskTracker,
    _watcher: RecommendedWatcher,
}

impl LibraryWatcher {
    /// Registers watches on every library root, runs the startup
    /// reconciliation, then starts dispatching live events.
    pub async fn start(
        reconciler: Arc<Reconciler>,
        debounce: Duration,
    ) -> Result<(Self, ScanReport)> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = event_tx.send(res);
        })
        .context("Failed to create filesystem watcher")?;

        for root in reconciler.library().roots() {
            if !root.is_dir() {
                tracing::warn!(root = %root.display(), "not watching missing library root");
                continue;
            }
            watcher
                .watch(root, RecursiveMode::Recursive)
                .with_context(|| format!("Failed to watch {}", root.display()))?;
            tracing::info!(root = %root.display(), "watching");
        }

        // Startup barrier: live events wait in the channel until this returns.
        let report = reconciler.startup().await?;

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let dispatcher = Dispatcher {
            reconciler,
            schedule: Schedule::new(debounce),
            cancel: cancel.clone(),
            tracker: tracker.clone(),
        };
        tracker.spawn(dispatcher.run(event_rx));

        Ok((
            Self {
                cancel,
                tracker,
                _watcher: watcher,
            },
            report,
        ))
    }

    /// Stops accepting events and waits for in-flight actions to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("watcher stopped");
    }
}

struct Dispatcher {
    reconciler: Arc<Reconciler>,
    schedule: Schedule,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Dispatcher {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<notify::Result<Event>>) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<WatchAction>();

        loop {
            let next = self.schedule.next_deadline();
            let sleep_until = next
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = events.recv() => match received {
                    Some(Ok(event)) => {
                        let now = Instant::now();
                        for action in classify_event(&event) {
                            if self.is_relevant(&action) {
                                self.schedule.push(action, now);
                            }
                        }
                    }
                    Some(Err(e)) => tracing::warn!("watch error: {e}"),
                    None => break,
                },
                Some(done) = done_rx.recv() => self.schedule.finish(&done),
                _ = tokio::time::sleep_until(sleep_until), if next.is_some() => {}
            }

            for action in self.schedule.take_ready(Instant::now()) {
                self.dispatch(action, done_tx.clone());
            }
        }
    }

    /// Drops events for files the library would never catalogue.
    fn is_relevant(&self, action: &WatchAction) -> bool {
        let library = self.reconciler.library();
        let relevant = |path: &Path| {
            library.contains(path)
                && (library.format_of(path).is_some()
                    || path.is_dir()
                    || (!path.exists() && path.extension().is_none()))
        };
        match action {
            WatchAction::Sync(path) => relevant(path),
            WatchAction::Move { from, to } => relevant(from) || relevant(to),
            WatchAction::Rescan => true,
        }
    }

    fn dispatch(&self, action: WatchAction, done: mpsc::UnboundedSender<WatchAction>) {
        let reconciler = self.reconciler.clone();
        self.tracker.spawn(async move {
            if let Err(e) = apply(&reconciler, &action).await {
                tracing::error!(?action, "watch action failed: {e:#}");
            }
            let _ = done.send(action);
        });
    }
}

async fn apply(reconciler: &Reconciler, action: &WatchAction) -> Result<()> {
    match action {
        WatchAction::Sync(path) => {
            if path.is_dir() || (!path.exists() && reconciler.library().format_of(path).is_none())
            {
                reconciler.sync_dir(path).await?;
            } else {
                let outcome = reconciler.sync_path(path).await?;
                tracing::debug!(path = %path.display(), ?outcome, "synced");
            }
        }
        WatchAction::Move { from, to } => {
            if to.is_dir() {
                reconciler.sync_dir(from).await?;
                reconciler.sync_dir(to).await?;
            } else {
                let outcome = reconciler.move_path(from, to).await?;
                tracing::debug!(from = %from.display(), to = %to.display(), ?outcome, "moved");
            }
        }
        WatchAction::Rescan => {
            tracing::warn!("watch queue overflowed, rescanning library");
            reconciler.startup().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LibraryConfig;
    use crate::models::{NovelFilter, NovelSummary};
    use crate::reconcile::LibraryFilter;
    use crate::sqlite_store::SqliteStore;
    use crate::store::memory::InMemoryStore;
    use crate::store::CatalogStore;
    use notify::event::{CreateKind, Flag, RemoveKind};
    use tempfile::TempDir;

    const DEBOUNCE: Duration = Duration::from_millis(100);

    fn p(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    #[test]
    fn classifies_events() {
        let create = Event::new(EventKind::Create(CreateKind::File)).add_path(p("/l/a.txt"));
        assert_eq!(classify_event(&create), vec![WatchAction::Sync(p("/l/a.txt"))]);

        let rename = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(p("/l/a.txt"))
            .add_path(p("/l/b.txt"));
        assert_eq!(
            classify_event(&rename),
            vec![WatchAction::Move {
                from: p("/l/a.txt"),
                to: p("/l/b.txt")
            }]
        );

        let half = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
            .add_path(p("/l/a.txt"));
        assert_eq!(classify_event(&half), vec![WatchAction::Sync(p("/l/a.txt"))]);

        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(p("/l/a.txt"));
        assert!(classify_event(&access).is_empty());

        let overflow = Event::new(EventKind::Other).set_flag(Flag::Rescan);
        assert_eq!(classify_event(&overflow), vec![WatchAction::Rescan]);

        let remove = Event::new(EventKind::Remove(RemoveKind::File)).add_path(p("/l/a.txt"));
        assert_eq!(classify_event(&remove), vec![WatchAction::Sync(p("/l/a.txt"))]);
    }

    #[test]
    fn debounce_waits_for_quiet_period() {
        let mut schedule = Schedule::new(DEBOUNCE);
        let t0 = Instant::now();
        schedule.push(WatchAction::Sync(p("/a")), t0);
        schedule.push(WatchAction::Sync(p("/a")), t0 + Duration::from_millis(80));

        assert!(schedule.take_ready(t0 + Duration::from_millis(120)).is_empty());
        assert_eq!(
            schedule.next_deadline(),
            Some(t0 + Duration::from_millis(180))
        );
        assert_eq!(
            schedule.take_ready(t0 + Duration::from_millis(180)),
            vec![WatchAction::Sync(p("/a"))]
        );
    }

    #[test]
    fn same_path_is_never_run_concurrently() {
        let mut schedule = Schedule::new(Duration::ZERO);
        let t0 = Instant::now();
        schedule.push(WatchAction::Sync(p("/a")), t0);
        let first = schedule.take_ready(t0);
        assert_eq!(first.len(), 1);

        schedule.push(WatchAction::Sync(p("/a")), t0);
        schedule.push(WatchAction::Sync(p("/b")), t0);
        assert_eq!(schedule.take_ready(t0), vec![WatchAction::Sync(p("/b"))]);

        schedule.finish(&first[0]);
        assert_eq!(schedule.take_ready(t0), vec![WatchAction::Sync(p("/a"))]);
    }

    #[test]
    fn move_supersedes_pending_source_and_chains() {
        let mut schedule = Schedule::new(Duration::ZERO);
        let t0 = Instant::now();
        schedule.push(WatchAction::Sync(p("/a")), t0);
        schedule.push(
            WatchAction::Move {
                from: p("/a"),
                to: p("/b"),
            },
            t0,
        );
        schedule.push(
            WatchAction::Move {
                from: p("/b"),
                to: p("/c"),
            },
            t0,
        );
        assert_eq!(
            schedule.take_ready(t0),
            vec![WatchAction::Move {
                from: p("/a"),
                to: p("/c")
            }]
        );
    }

    #[test]
    fn move_waits_for_source_in_flight() {
        let mut schedule = Schedule::new(Duration::ZERO);
        let t0 = Instant::now();
        schedule.push(WatchAction::Sync(p("/a")), t0);
        let running = schedule.take_ready(t0);

        schedule.push(
            WatchAction::Move {
                from: p("/a"),
                to: p("/b"),
            },
            t0,
        );
        assert!(schedule.take_ready(t0).is_empty());
        schedule.finish(&running[0]);
        assert_eq!(schedule.take_ready(t0).len(), 1);
    }

    #[test]
    fn rescan_waits_for_in_flight_and_clears_pending() {
        let mut schedule = Schedule::new(Duration::ZERO);
        let t0 = Instant::now();
        schedule.push(WatchAction::Sync(p("/a")), t0);
        let running = schedule.take_ready(t0);

        schedule.push(WatchAction::Rescan, t0);
        schedule.push(WatchAction::Sync(p("/b")), t0);
        assert!(schedule.take_ready(t0).is_empty());

        schedule.finish(&running[0]);
        assert_eq!(schedule.take_ready(t0), vec![WatchAction::Rescan]);
        schedule.push(WatchAction::Sync(p("/c")), t0);
        assert!(schedule.take_ready(t0).is_empty());

        schedule.finish(&WatchAction::Rescan);
        assert_eq!(schedule.take_ready(t0), vec![WatchAction::Sync(p("/c"))]);
    }

    async fn wait_for<F>(store: &Arc<dyn CatalogStore>, mut done: F) -> Vec<NovelSummary>
    where
        F: FnMut(&[NovelSummary]) -> bool,
    {
        for _ in 0..100 {
            let novels = store.list_novels(&NovelFilter::default()).await.unwrap();
            if done(&novels) {
                return novels;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("catalog never reached the expected state");
    }

    async fn watch(root: &Path, store: &Arc<dyn CatalogStore>) -> (LibraryWatcher, ScanReport) {
        let library = LibraryFilter::from_config(&LibraryConfig {
            roots: vec![root.to_path_buf()],
            ..LibraryConfig::default()
        })
        .unwrap();
        let reconciler = Arc::new(Reconciler::new(store.clone(), library));
        LibraryWatcher::start(reconciler, Duration::from_millis(50))
            .await
            .unwrap()
    }

    fn temp_root() -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        (tmp, root)
    }

    #[tokio::test]
    async fn watches_create_and_delete_then_shuts_down() {
        let (_tmp, root) = temp_root();
        std::fs::write(root.join("existing.txt"), "第一章\n甲").unwrap();

        let store: Arc<dyn CatalogStore> = Arc::new(InMemoryStore::new());
        let (watcher, report) = watch(&root, &store).await;
        assert_eq!(report.created, 1);

        std::fs::write(root.join("new.txt"), "第一章\n乙").unwrap();
        wait_for(&store, |novels| novels.len() == 2).await;

        std::fs::remove_file(root.join("existing.txt")).unwrap();
        wait_for(&store, |novels| novels.len() == 1).await;

        watcher.shutdown().await;
    }

    #[tokio::test]
    async fn rewriting_a_tracked_file_resegments_it() {
        let (_tmp, root) = temp_root();
        let path = root.join("book.txt");
        std::fs::write(&path, "第一章\n甲").unwrap();

        let store: Arc<dyn CatalogStore> = Arc::new(InMemoryStore::new());
        let (watcher, _) = watch(&root, &store).await;
        let id = wait_for(&store, |novels| novels.len() == 1).await[0].id.clone();

        // Immediately, so the rewrite usually shares the first write's second.
        std::fs::write(&path, "第一章\n甲\n第二章\n乙\n第三章\n丙").unwrap();
        let novels = wait_for(&store, |novels| {
            novels.len() == 1 && novels[0].chapter_count == 3
        })
        .await;
        assert_eq!(novels[0].id, id);

        watcher.shutdown().await;
    }

    #[tokio::test]
    async fn rename_in_place_keeps_identity_and_chapter_ids() {
        let (_tmp, root) = temp_root();
        let from = root.join("old name.txt");
        std::fs::write(&from, "第一章\n甲\n第二章\n乙").unwrap();

        let store: Arc<dyn CatalogStore> = Arc::new(InMemoryStore::new());
        let (watcher, _) = watch(&root, &store).await;
        let novel = wait_for(&store, |novels| novels.len() == 1).await.remove(0);
        let chapters = store.list_chapters(&novel.id).await.unwrap().unwrap();

        let to = root.join("new name.txt");
        std::fs::rename(&from, &to).unwrap();
        let target = to.to_string_lossy().to_string();
        let novels = wait_for(&store, |novels| {
            novels.len() == 1 && novels[0].file_path == target
        })
        .await;
        assert_eq!(novels[0].id, novel.id);

        // The move must have settled, not just been observed mid-flight.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let after = store.list_chapters(&novel.id).await.unwrap().unwrap();
        assert_eq!(after, chapters);

        watcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_files_dropped_at_once_are_all_catalogued() {
        let (_tmp, root) = temp_root();
        let db = TempDir::new().unwrap();
        let pool = crate::db::connect_path(&db.path().join("catalog.db"))
            .await
            .unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        let store: Arc<dyn CatalogStore> = Arc::new(SqliteStore::new(pool));

        let (watcher, report) = watch(&root, &store).await;
        assert_eq!(report.created, 0);

        std::fs::create_dir_all(root.join("batch")).unwrap();
        for i in 0..40 {
            std::fs::write(
                root.join(format!("batch/book{i:02}.txt")),
                format!("第一章\n{i}\n第二章\n{i}"),
            )
            .unwrap();
        }
        let novels = wait_for(&store, |novels| novels.len() == 40).await;
        assert!(novels.iter().all(|n| n.chapter_count == 2));

        watcher.shutdown().await;
    }
}
