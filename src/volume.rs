//! Volume Manager (§4.F): serializes add/remove of watched volumes, runs
//! the initial restore→prune→scan→attach sequence for a newly added
//! volume, and archives on removal.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tokio::sync::Mutex;

use crate::config::TimingConfig;
use crate::error::Result;
use crate::fsutil;
use crate::index;
use crate::invalidate::Invalidator;
use crate::metadata::MetadataExtractor;
use crate::model::MediaType;
use crate::scanner::watcher::SubtreeWatcher;
use crate::scanner::Scanner;
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
enum VolumeEvent {
    Added(PathBuf),
    Removed(PathBuf),
}

impl VolumeEvent {
    fn path(&self) -> &PathBuf {
        match self {
            VolumeEvent::Added(p) | VolumeEvent::Removed(p) => p,
        }
    }
}

struct ManagerState {
    queue: VecDeque<VolumeEvent>,
    attached: HashMap<PathBuf, SubtreeWatcher>,
    scheduled: bool,
}

/// Owns the lifecycle of every watched volume. `queueAddVolume` /
/// `queueRemoveVolume` enqueue and return immediately; the actual work
/// (which may take a long time for an initial bulk scan) runs on a
/// background task that drains the queue to completion, one event at a
/// time, per §4.F's ordering guarantees.
pub struct VolumeManager {
    store: Arc<Store>,
    invalidator: Arc<Invalidator>,
    timing: TimingConfig,
    state: Mutex<ManagerState>,
}

impl VolumeManager {
    pub fn new(store: Arc<Store>, invalidator: Arc<Invalidator>, timing: TimingConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            invalidator,
            timing,
            state: Mutex::new(ManagerState {
                queue: VecDeque::new(),
                attached: HashMap::new(),
                scheduled: false,
            }),
        })
    }

    pub async fn queue_add_volume(self: &Arc<Self>, path: PathBuf) {
        self.enqueue(VolumeEvent::Added(path)).await;
    }

    pub async fn queue_remove_volume(self: &Arc<Self>, path: PathBuf) {
        self.enqueue(VolumeEvent::Removed(path)).await;
    }

    /// True iff no drain callback is pending and the queue is empty.
    pub async fn idle(self: &Arc<Self>) -> bool {
        let state = self.state.lock().await;
        !state.scheduled && state.queue.is_empty()
    }

    async fn enqueue(self: &Arc<Self>, event: VolumeEvent) {
        let mut state = self.state.lock().await;
        let path = event.path().clone();
        state.queue.retain(|e| *e.path() != path);
        state.queue.push_back(event);

        if !state.scheduled {
            state.scheduled = true;
            let this = Arc::clone(self);
            tokio::spawn(async move { this.drain().await });
        }
    }

    /// The scheduled idle callback: drain the queue in order, then emit
    /// one final invalidation. Each event runs to completion before the
    /// next is considered, so a long initial scan does not get
    /// interleaved with other volumes' events — it only yields between
    /// files within its own scan (see `bulk_scan`).
    async fn drain(self: &Arc<Self>) {
        loop {
            let next = {
                let mut state = self.state.lock().await;
                match state.queue.pop_front() {
                    Some(event) => event,
                    None => {
                        state.scheduled = false;
                        break;
                    }
                }
            };
            match next {
                VolumeEvent::Added(path) => self.handle_added(path).await,
                VolumeEvent::Removed(path) => self.handle_removed(path).await,
            }
        }
        self.invalidator.invalidate().await;
    }

    async fn handle_added(self: &Arc<Self>, path: PathBuf) {
        {
            let state = self.state.lock().await;
            if state.attached.contains_key(&path) {
                return;
            }
        }
        if fsutil::is_rootlike(&path) || fsutil::is_optical_disc(&path) || fsutil::has_scanblock(&path) {
            tracing::info!(?path, "skipping volume: rootlike, optical disc, or opt-out marked");
            return;
        }

        let prefix = path.to_string_lossy().into_owned();
        if let Err(e) = self.store.restore_items(&prefix).await {
            tracing::error!(?path, error = %e, "restoreItems failed");
        }
        if let Err(e) = self.store.prune_deleted().await {
            tracing::error!(?path, error = %e, "pruneDeleted failed");
        }
        if let Err(e) = self.bulk_scan(&path).await {
            tracing::error!(?path, error = %e, "bulk scan failed");
        }

        match SubtreeWatcher::spawn(
            path.clone(),
            Arc::clone(&self.store),
            self.timing.extractor_worker_idle(),
            Arc::clone(&self.invalidator),
        )
        .await
        {
            Ok(watcher) => {
                let mut state = self.state.lock().await;
                state.attached.insert(path, watcher);
            }
            Err(e) => tracing::error!(?path, error = %e, "failed to attach subtree watcher"),
        }
    }

    async fn handle_removed(self: &Arc<Self>, path: PathBuf) {
        let watcher = {
            let mut state = self.state.lock().await;
            state.attached.remove(&path)
        };
        if watcher.is_none() {
            return;
        }
        let prefix = path.to_string_lossy().into_owned();
        if let Err(e) = self.store.archive_items(&prefix).await {
            tracing::error!(?path, error = %e, "archiveItems failed");
        }
        // `watcher` drops here, tearing down its task and watches.
    }

    /// Depth-first scan of `root`, indexing through the shared
    /// broken/unchanged/extract/fallback protocol (§4.E/§4.F share it),
    /// committing and pulsing an invalidation roughly every
    /// `scan_commit_interval`, and yielding to the runtime after every
    /// file so the watcher and volume queue stay responsive mid-scan.
    async fn bulk_scan(&self, root: &std::path::Path) -> Result<()> {
        let mut scanner = Scanner::new(root.to_path_buf(), MediaType::AllMedia);
        let mut extractor = MetadataExtractor::new(self.timing.extractor_worker_idle());
        let mut txn = self.store.begin_transaction().await?;
        let commit_interval = self.timing.scan_commit_interval();
        let mut last_commit = Instant::now();

        while let Some(detected) = scanner.next().await {
            index::index_into_transaction(&mut txn, &mut extractor, std::path::Path::new(&detected.filename)).await?;
            tokio::task::yield_now().await;

            if last_commit.elapsed() >= commit_interval {
                txn.commit().await?;
                self.invalidator.invalidate().await;
                last_commit = Instant::now();
            }
        }
        txn.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::OpenMode;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::timeout;

    async fn new_manager(cache_dir: &std::path::Path) -> (Arc<VolumeManager>, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let store = Arc::new(Store::open(&cache_dir.join("store.db"), OpenMode::ReadWrite).await.unwrap());
        let (invalidator, rx) = Invalidator::new(Duration::ZERO);
        (VolumeManager::new(store, invalidator, TimingConfig::default()), rx)
    }

    #[tokio::test]
    async fn add_then_query_indexes_volume() {
        let root = tempdir().unwrap();
        std::fs::write(root.path().join("song.mp3"), b"fake").unwrap();
        let cache_dir = tempdir().unwrap();
        let (manager, mut rx) = new_manager(cache_dir.path()).await;

        manager.queue_add_volume(root.path().to_path_buf()).await;
        timeout(Duration::from_secs(2), rx.recv()).await.unwrap();

        let mut tries = 0;
        while !manager.idle().await && tries < 20 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tries += 1;
        }
        assert!(manager.idle().await);
    }

    #[tokio::test]
    async fn coalesces_rapid_add_remove_to_latest() {
        let root = tempdir().unwrap();
        let cache_dir = tempdir().unwrap();
        let (manager, _rx) = new_manager(cache_dir.path()).await;

        manager.queue_add_volume(root.path().to_path_buf()).await;
        manager.queue_remove_volume(root.path().to_path_buf()).await;

        let mut tries = 0;
        while !manager.idle().await && tries < 50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tries += 1;
        }
        assert!(manager.idle().await);
    }

    #[tokio::test]
    async fn skips_optical_disc_volume() {
        let root = tempdir().unwrap();
        std::fs::create_dir(root.path().join("AUDIO_TS")).unwrap();
        std::fs::create_dir(root.path().join("VIDEO_TS")).unwrap();
        let cache_dir = tempdir().unwrap();
        let (manager, _rx) = new_manager(cache_dir.path()).await;

        manager.queue_add_volume(root.path().to_path_buf()).await;
        let mut tries = 0;
        while !manager.idle().await && tries < 50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tries += 1;
        }
        assert!(manager.idle().await);
    }
}
