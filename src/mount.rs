//! Mount-event adapter (ambient, §6): since no external mount daemon is
//! assumed to exist on every Linux box a faithful reimplementation might
//! run on, this watches `/media` non-recursively and synthesizes the
//! `{device, uuid, mount_point, is_mounted}` tuples the Volume Manager
//! expects straight from top-level directory create/remove events — one
//! subdirectory of `/media` corresponds to one mounted removable volume.
//!
//! Static paths from configuration remain the primary input; this adapter
//! only covers volumes mounted under `/media` while the daemon is running.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::volume::VolumeManager;

/// Watch `media_root` (typically `/media`) and queue add/remove events on
/// `manager` for each top-level directory that appears or disappears
/// under it. Returns immediately; the watch runs on a background task
/// for as long as the returned `JoinHandle` (or its owning process) lives.
pub fn spawn(media_root: PathBuf, manager: Arc<VolumeManager>) -> tokio::task::JoinHandle<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

    let watcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    });

    tokio::spawn(async move {
        let mut watcher = match watcher {
            Ok(w) => w,
            Err(e) => {
                tracing::error!(error = %e, "failed to create mount adapter watcher");
                return;
            }
        };
        if let Err(e) = watcher.watch(&media_root, RecursiveMode::NonRecursive) {
            tracing::error!(?media_root, error = %e, "failed to watch media root");
            return;
        }

        // Existing mounts at startup: treat every top-level directory as
        // already mounted.
        if let Ok(entries) = std::fs::read_dir(&media_root) {
            for entry in entries.flatten() {
                if entry.file_type().is_ok_and(|ft| ft.is_dir()) {
                    manager.queue_add_volume(entry.path()).await;
                }
            }
        }

        while let Some(res) = rx.recv().await {
            let Ok(event) = res else { continue };
            match event.kind {
                EventKind::Create(CreateKind::Folder)
                | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                    for path in &event.paths {
                        if is_top_level_dir(&media_root, path) {
                            manager.queue_add_volume(path.clone()).await;
                        }
                    }
                }
                EventKind::Remove(RemoveKind::Folder)
                | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                    for path in &event.paths {
                        if is_top_level(&media_root, path) {
                            manager.queue_remove_volume(path.clone()).await;
                        }
                    }
                }
                _ => {}
            }
        }
    })
}

fn is_top_level(media_root: &Path, path: &Path) -> bool {
    path.parent() == Some(media_root)
}

fn is_top_level_dir(media_root: &Path, path: &Path) -> bool {
    is_top_level(media_root, path) && path.is_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_level_check_rejects_nested_paths() {
        let root = Path::new("/media");
        assert!(is_top_level(root, Path::new("/media/usbdrive")));
        assert!(!is_top_level(root, Path::new("/media/usbdrive/folder")));
    }
}
