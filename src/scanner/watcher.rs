//! Subtree Watcher (§4.E): a recursive filesystem watch rooted at one
//! directory, mapping `notify` events onto catalog mutations.
//!
//! `notify`'s own recursive mode is deliberately not used — each watched
//! directory is registered individually (`RecursiveMode::NonRecursive`)
//! and this module walks into newly-created subdirectories itself, so the
//! directory-vs-file and create-vs-close distinctions in the event table
//! below are preserved exactly rather than flattened by the backend.
//! `notify`'s Rust events already carry full paths, so unlike the
//! original's raw inotify wrapper there is no watch-descriptor↔path map
//! to maintain here.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::fsutil;
use crate::index;
use crate::invalidate::Invalidator;
use crate::metadata::MetadataExtractor;
use crate::store::Store;

/// A running watch over one directory subtree. Dropping this handle tears
/// the watch down: the backing task is aborted, which drops the
/// `RecommendedWatcher` and unregisters every watch it held.
pub struct SubtreeWatcher {
    task: JoinHandle<()>,
}

impl SubtreeWatcher {
    /// Register a watch over `root` and every subdirectory found under
    /// it, indexing whatever files are already there, then hand control
    /// to a background task that applies further events as they arrive.
    pub async fn spawn(
        root: PathBuf,
        store: Arc<Store>,
        extractor_idle: Duration,
        invalidator: Arc<Invalidator>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;

        let mut watched = HashSet::new();
        let mut extractor = MetadataExtractor::new(extractor_idle);
        let mut initial_files = Vec::new();
        add_dir(&mut watcher, &mut watched, &root, &mut initial_files);
        for file in &initial_files {
            index_file(&store, &mut extractor, file).await;
        }
        invalidator.invalidate().await;

        let task = tokio::spawn(run_event_loop(
            watcher,
            watched,
            store,
            extractor,
            invalidator,
            rx,
        ));

        Ok(Self { task })
    }
}

impl Drop for SubtreeWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// `addDir(path)` (§4.E): reject non-absolute, rootlike, opt-out-marked
/// or already-watched paths; otherwise register the watch and recurse
/// into children, collecting regular files for the caller to index.
fn add_dir(
    watcher: &mut RecommendedWatcher,
    watched: &mut HashSet<PathBuf>,
    path: &Path,
    out_files: &mut Vec<PathBuf>,
) {
    if !path.is_absolute()
        || fsutil::is_rootlike(path)
        || fsutil::has_scanblock(path)
        || watched.contains(path)
    {
        return;
    }

    if let Err(e) = watcher.watch(path, RecursiveMode::NonRecursive) {
        tracing::error!(?path, error = %e, "failed to register watch");
        return;
    }
    watched.insert(path.to_path_buf());
    tracing::debug!(?path, "watching directory");

    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!(?path, error = %e, "failed to enumerate watched directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let child = entry.path();
        match entry.file_type() {
            Ok(ft) if ft.is_dir() => add_dir(watcher, watched, &child, out_files),
            Ok(ft) if ft.is_file() => out_files.push(child),
            _ => {}
        }
    }
}

/// Unwatch `path` and every descendant directory already watched under
/// it (`dirRemoved`'s "recursive unwatch" half).
fn remove_subtree(watcher: &mut RecommendedWatcher, watched: &mut HashSet<PathBuf>, path: &Path) {
    let doomed: Vec<PathBuf> = watched.iter().filter(|w| w.starts_with(path)).cloned().collect();
    for w in doomed {
        let _ = watcher.unwatch(&w);
        watched.remove(&w);
    }
}

async fn index_file(store: &Store, extractor: &mut MetadataExtractor, path: &Path) -> bool {
    match index::index_into_store(store, extractor, path).await {
        Ok(changed) => changed,
        Err(e) => {
            tracing::warn!(?path, error = %e, "failed to index file");
            false
        }
    }
}

/// The background task a [`SubtreeWatcher`] hands off to: drain events as
/// they arrive, batching a run of them behind one `changed` flag and one
/// invalidation per batch, and stop once the watched set empties.
async fn run_event_loop(
    mut watcher: RecommendedWatcher,
    mut watched: HashSet<PathBuf>,
    store: Arc<Store>,
    mut extractor: MetadataExtractor,
    invalidator: Arc<Invalidator>,
    mut events: mpsc::UnboundedReceiver<notify::Result<Event>>,
) {
    while let Some(first) = events.recv().await {
        let mut changed = false;
        handle_event(first, &mut watcher, &mut watched, &store, &mut extractor, &mut changed).await;
        while let Ok(next) = events.try_recv() {
            handle_event(next, &mut watcher, &mut watched, &store, &mut extractor, &mut changed).await;
        }

        if changed {
            invalidator.invalidate().await;
        }
        if watched.is_empty() {
            tracing::info!("watched set emptied, stopping subtree watcher");
            break;
        }
    }
}

/// Map one `notify::Event` onto the actions in §4.E's event table.
async fn handle_event(
    res: notify::Result<Event>,
    watcher: &mut RecommendedWatcher,
    watched: &mut HashSet<PathBuf>,
    store: &Store,
    extractor: &mut MetadataExtractor,
    changed: &mut bool,
) {
    let event = match res {
        Ok(event) => event,
        Err(e) => {
            // Stands in for IGNORED/UNMOUNT/DELETE_SELF: the watch root
            // itself may already be gone, which also surfaces as Remove
            // events for the paths below it.
            tracing::error!(error = %e, "watch backend error");
            return;
        }
    };

    match event.kind {
        EventKind::Create(CreateKind::Folder) => {
            for path in &event.paths {
                dir_added(path, watcher, watched, store, extractor, changed).await;
            }
        }
        // A bare file CREATE is ignored: the file may still be open for
        // write, so indexing is deferred to CLOSE_WRITE / MOVED_TO.
        EventKind::Create(CreateKind::File) => {}
        EventKind::Create(CreateKind::Any) => {
            for path in &event.paths {
                path_added(path, watcher, watched, store, extractor, changed).await;
            }
        }
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
            for path in &event.paths {
                if index_file(store, extractor, path).await {
                    *changed = true;
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for path in &event.paths {
                path_added(path, watcher, watched, store, extractor, changed).await;
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if let [from, to] = event.paths.as_slice() {
                path_removed(from, watcher, watched, store, changed).await;
                path_added(to, watcher, watched, store, extractor, changed).await;
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => {
            for path in &event.paths {
                path_removed(path, watcher, watched, store, changed).await;
            }
        }
        _ => {}
    }
}

/// `CLOSE_WRITE`/`MOVED_TO`/ambiguous-`CREATE` on a path whose current
/// kind on disk must be stat'd to tell `dirAdded` from `fileAdded` apart.
async fn path_added(
    path: &Path,
    watcher: &mut RecommendedWatcher,
    watched: &mut HashSet<PathBuf>,
    store: &Store,
    extractor: &mut MetadataExtractor,
    changed: &mut bool,
) {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => dir_added(path, watcher, watched, store, extractor, changed).await,
        Ok(meta) if meta.is_file() => {
            if index_file(store, extractor, path).await {
                *changed = true;
            }
        }
        _ => {}
    }
}

async fn dir_added(
    path: &Path,
    watcher: &mut RecommendedWatcher,
    watched: &mut HashSet<PathBuf>,
    store: &Store,
    extractor: &mut MetadataExtractor,
    changed: &mut bool,
) {
    let mut files = Vec::new();
    add_dir(watcher, watched, path, &mut files);
    for file in &files {
        if index_file(store, extractor, file).await {
            *changed = true;
        }
    }
}

/// `DELETE`/`MOVED_FROM`: a watched directory means `dirRemoved`
/// (recursive unwatch + `removeSubtree`); anything else is `fileDeleted`.
async fn path_removed(
    path: &Path,
    watcher: &mut RecommendedWatcher,
    watched: &mut HashSet<PathBuf>,
    store: &Store,
    changed: &mut bool,
) {
    if watched.contains(path) {
        remove_subtree(watcher, watched, path);
        let directory = path.to_string_lossy().into_owned();
        match store.remove_subtree(&directory).await {
            Ok(()) => *changed = true,
            Err(e) => tracing::error!(?path, error = %e, "removeSubtree failed"),
        }
    } else {
        let filename = path.to_string_lossy().into_owned();
        match store.remove(&filename).await {
            Ok(()) => *changed = true,
            Err(e) => tracing::error!(?path, error = %e, "remove failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;
    use tempfile::tempdir;
    use tokio::time::timeout;

    async fn open_store(dir: &Path) -> Arc<Store> {
        Arc::new(
            Store::open(&dir.join("store.db"), crate::store::OpenMode::ReadWrite)
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn indexes_preexisting_files_on_spawn() {
        let root = tempdir().unwrap();
        std::fs::write(root.path().join("song.mp3"), b"fake").unwrap();
        let store_dir = tempdir().unwrap();
        let store = open_store(store_dir.path()).await;
        let (invalidator, mut rx) = Invalidator::new(StdDuration::ZERO);

        let watcher = SubtreeWatcher::spawn(
            root.path().to_path_buf(),
            Arc::clone(&store),
            StdDuration::from_secs(30),
            invalidator,
        )
        .await
        .unwrap();

        timeout(StdDuration::from_secs(1), rx.recv()).await.unwrap();
        let filename = root.path().join("song.mp3").to_string_lossy().into_owned();
        assert!(store.lookup(&filename).await.is_ok());
        drop(watcher);
    }

    #[tokio::test]
    async fn picks_up_a_file_created_after_spawn() {
        let root = tempdir().unwrap();
        let store_dir = tempdir().unwrap();
        let store = open_store(store_dir.path()).await;
        let (invalidator, mut rx) = Invalidator::new(StdDuration::ZERO);

        let watcher = SubtreeWatcher::spawn(
            root.path().to_path_buf(),
            Arc::clone(&store),
            StdDuration::from_secs(30),
            invalidator,
        )
        .await
        .unwrap();
        timeout(StdDuration::from_secs(1), rx.recv()).await.unwrap();

        let new_file = root.path().join("added.mp3");
        std::fs::write(&new_file, b"fake").unwrap();
        // Some platforms fire CREATE then CLOSE_WRITE; waiting for one
        // invalidation after the write is enough either way.
        let _ = timeout(StdDuration::from_secs(2), rx.recv()).await;

        let filename = new_file.to_string_lossy().into_owned();
        let mut tries = 0;
        while store.lookup(&filename).await.is_err() && tries < 20 {
            tokio::time::sleep(StdDuration::from_millis(50)).await;
            tries += 1;
        }
        assert!(store.lookup(&filename).await.is_ok());
        drop(watcher);
    }

    #[tokio::test]
    async fn rejects_rootlike_root() {
        let root = tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("usr")).unwrap();
        std::fs::create_dir_all(root.path().join("var")).unwrap();
        std::fs::create_dir_all(root.path().join("bin")).unwrap();
        let store_dir = tempdir().unwrap();
        let store = open_store(store_dir.path()).await;
        let (invalidator, _rx) = Invalidator::new(StdDuration::ZERO);

        // Construction should succeed without registering any watch; no
        // file gets indexed and there is nothing to drop a panic on.
        let watcher = SubtreeWatcher::spawn(
            root.path().to_path_buf(),
            store,
            StdDuration::from_secs(30),
            invalidator,
        )
        .await
        .unwrap();
        drop(watcher);
    }
}
