//! Folder-Art Resolver (§4.B): given a directory, find the best candidate
//! cover-art image file inside it, with a bounded, mtime-invalidated cache.
//!
//! Grounded in `mediascanner/internal/FolderArtCache.hh`/`.cc`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const BASE_NAMES: [&str; 5] = ["cover", "album", "albumart", ".folder", "folder"];
const EXTENSIONS: [&str; 3] = ["jpeg", "jpg", "png"];
const CACHE_SIZE: usize = 50;

#[derive(Debug, Clone)]
struct CacheEntry {
    art_path: Option<String>,
    mtime: SystemTime,
}

/// Two-generation, mtime-invalidated cache mapping a directory to its
/// resolved art file. Not a global singleton (per SPEC_FULL.md §9's
/// "Global singletons" note) — owned by whichever component composes art
/// URIs (the store, in this crate).
#[derive(Debug, Default)]
pub struct FolderArtResolver {
    active: HashMap<PathBuf, CacheEntry>,
    previous: HashMap<PathBuf, CacheEntry>,
}

impl FolderArtResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the best art file under `dir`, or `None` if the directory
    /// doesn't exist, isn't a directory, or has no matching image.
    pub fn resolve(&mut self, dir: &Path) -> Option<String> {
        let metadata = std::fs::metadata(dir).ok()?;
        if !metadata.is_dir() {
            return None;
        }
        let mtime = metadata.modified().ok()?;

        if let Some(entry) = self.active.get(dir) {
            if entry.mtime == mtime {
                return entry.art_path.clone();
            }
        }
        if let Some(entry) = self.previous.remove(dir) {
            if entry.mtime == mtime {
                let art_path = entry.art_path.clone();
                self.insert_active(dir.to_path_buf(), entry);
                return art_path;
            }
        }

        let art_path = Self::scan_dir(dir);
        self.insert_active(
            dir.to_path_buf(),
            CacheEntry {
                art_path: art_path.clone(),
                mtime,
            },
        );
        art_path
    }

    fn insert_active(&mut self, dir: PathBuf, entry: CacheEntry) {
        if self.active.len() >= CACHE_SIZE && !self.active.contains_key(&dir) {
            self.previous = std::mem::take(&mut self.active);
        }
        self.active.insert(dir, entry);
    }

    fn scan_dir(dir: &Path) -> Option<String> {
        let entries = std::fs::read_dir(dir).ok()?;
        let mut best: Option<(usize, String)> = None;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(score) = Self::score(&path) else {
                continue;
            };
            if best.as_ref().is_none_or(|(best_score, _)| score < *best_score) {
                best = Some((score, path.to_string_lossy().into_owned()));
            }
        }
        best.map(|(_, path)| path)
    }

    fn score(path: &Path) -> Option<usize> {
        let stem = path.file_stem()?.to_str()?.to_ascii_lowercase();
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        let base_index = BASE_NAMES.iter().position(|b| *b == stem)?;
        let ext_index = EXTENSIONS.iter().position(|e| *e == ext)?;
        Some(base_index * BASE_NAMES.len() + ext_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn picks_highest_priority_basename() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("folder.png"), b"").unwrap();
        std::fs::write(dir.path().join("cover.jpg"), b"").unwrap();
        let mut resolver = FolderArtResolver::new();
        let result = resolver.resolve(dir.path()).unwrap();
        assert!(result.ends_with("cover.jpg"));
    }

    #[test]
    fn picks_highest_priority_extension_within_same_basename() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("cover.png"), b"").unwrap();
        std::fs::write(dir.path().join("cover.jpeg"), b"").unwrap();
        let mut resolver = FolderArtResolver::new();
        let result = resolver.resolve(dir.path()).unwrap();
        assert!(result.ends_with("cover.jpeg"));
    }

    #[test]
    fn no_match_returns_none() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("readme.txt"), b"").unwrap();
        let mut resolver = FolderArtResolver::new();
        assert_eq!(resolver.resolve(dir.path()), None);
    }

    #[test]
    fn nonexistent_directory_returns_none_uncached() {
        let mut resolver = FolderArtResolver::new();
        assert_eq!(resolver.resolve(Path::new("/does/not/exist")), None);
        assert!(resolver.active.is_empty());
    }

    #[test]
    fn cache_hit_survives_unrelated_rescan() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("cover.jpg"), b"").unwrap();
        let mut resolver = FolderArtResolver::new();
        let first = resolver.resolve(dir.path());
        let second = resolver.resolve(dir.path());
        assert_eq!(first, second);
    }

    #[test]
    fn case_insensitive_matching() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("COVER.JPG"), b"").unwrap();
        let mut resolver = FolderArtResolver::new();
        assert!(resolver.resolve(dir.path()).unwrap().ends_with("COVER.JPG"));
    }
}
