//! Filesystem heuristics shared by the scanner, watcher and volume manager:
//! rootlike-directory detection, optical-disc detection, the `.nomedia`
//! opt-out marker, and etag derivation.
//!
//! Grounded in `mediascanner/utils.cc`.

use std::path::Path;
use std::time::UNIX_EPOCH;

fn dir_exists(path: &Path) -> bool {
    path.is_dir()
}

fn file_exists(path: &Path) -> bool {
    path.is_file()
}

/// A directory that looks like an OS root (`usr/`, `var/` and `bin/` all
/// present, or a `Program Files/` child) is never indexed.
pub fn is_rootlike(path: &Path) -> bool {
    (dir_exists(&path.join("usr")) && dir_exists(&path.join("var")) && dir_exists(&path.join("bin")))
        || dir_exists(&path.join("Program Files"))
}

/// A directory holding both `AUDIO_TS/` and `VIDEO_TS/`, or a `BDMV/`
/// child, is an optical disc layout and is skipped by the volume manager.
pub fn is_optical_disc(path: &Path) -> bool {
    (dir_exists(&path.join("AUDIO_TS")) && dir_exists(&path.join("VIDEO_TS")))
        || dir_exists(&path.join("BDMV"))
}

/// A `.nomedia` regular file in a directory opts that directory (and
/// everything the scanner/watcher would otherwise find under it) out of
/// indexing.
pub fn has_scanblock(path: &Path) -> bool {
    file_exists(&path.join(".nomedia"))
}

/// True if `path` or any of its ancestors carries a `.nomedia` marker.
/// Used by `pruneDeleted` (§4.A); callers that check many paths under the
/// same tree should prefer memoizing per-directory results themselves,
/// since this walks all the way to `/` on every call.
pub fn has_scanblock_in_ancestry(path: &Path) -> bool {
    let mut current = path.parent();
    while let Some(dir) = current {
        if has_scanblock(dir) {
            return true;
        }
        current = dir.parent();
    }
    false
}

/// Opaque change token for a file: a hex encoding of
/// `(mtime-as-nanos-since-epoch, length)`. Stable while content and mtime
/// are stable, changes whenever either changes — exactly the contract
/// §3.1 requires, without depending on a GVFS-specific attribute.
pub fn compute_etag(metadata: &std::fs::Metadata) -> String {
    let nanos = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{:x}-{:x}", nanos, metadata.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn rootlike_requires_all_three_dirs() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("usr")).unwrap();
        std::fs::create_dir(dir.path().join("var")).unwrap();
        assert!(!is_rootlike(dir.path()));
        std::fs::create_dir(dir.path().join("bin")).unwrap();
        assert!(is_rootlike(dir.path()));
    }

    #[test]
    fn rootlike_via_program_files() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("Program Files")).unwrap();
        assert!(is_rootlike(dir.path()));
    }

    #[test]
    fn optical_disc_dvd_layout() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("AUDIO_TS")).unwrap();
        assert!(!is_optical_disc(dir.path()));
        std::fs::create_dir(dir.path().join("VIDEO_TS")).unwrap();
        assert!(is_optical_disc(dir.path()));
    }

    #[test]
    fn optical_disc_bluray_layout() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("BDMV")).unwrap();
        assert!(is_optical_disc(dir.path()));
    }

    #[test]
    fn scanblock_requires_regular_file() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".nomedia")).unwrap();
        assert!(!has_scanblock(dir.path()));
        std::fs::remove_dir(dir.path().join(".nomedia")).unwrap();
        std::fs::write(dir.path().join(".nomedia"), b"").unwrap();
        assert!(has_scanblock(dir.path()));
    }

    #[test]
    fn scanblock_in_ancestry_walks_up() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("a").join(".nomedia"), b"").unwrap();
        assert!(has_scanblock_in_ancestry(&nested.join("file.mp3")));
    }

    #[test]
    fn etag_changes_with_content() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, b"hello").unwrap();
        let etag1 = compute_etag(&std::fs::metadata(&file).unwrap());
        std::thread::sleep(std::time::Duration::from_millis(10));
        std::fs::write(&file, b"hello world").unwrap();
        let etag2 = compute_etag(&std::fs::metadata(&file).unwrap());
        assert_ne!(etag1, etag2);
    }
}
