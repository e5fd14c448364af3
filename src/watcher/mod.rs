//! Change notification bridge - answers "might the index have changed?"
//! without reading the index.
//!
//! The filesystem watcher's callback only bumps a generation counter. A
//! cursor pairs that counter with a stat fingerprint of the index file, so a
//! late or dropped notification still shows up as a change on the next
//! comparison.

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::info;

use crate::error::{IndexHelperError, Result};
use crate::index::{ObjectId, HASH_LEN};
use crate::shm::{self, SegmentName};

/// Opaque position in the change stream, as handed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct WatchCursor {
    pub generation: u64,
    pub fingerprint: IndexFingerprint,
}

/// Cheap stat summary of the durable index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct IndexFingerprint {
    pub len: u64,
    pub mtime_secs: u64,
    pub mtime_nsecs: u32,
    pub ino: u64,
}

impl IndexFingerprint {
    /// Fingerprint of `path`; all zeros when it does not exist.
    pub fn of(path: &Path) -> Self {
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(_) => return Self::default(),
        };
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .unwrap_or_default();
        #[cfg(unix)]
        let ino = std::os::unix::fs::MetadataExt::ino(&meta);
        #[cfg(not(unix))]
        let ino = 0;
        Self {
            len: meta.len(),
            mtime_secs: mtime.as_secs(),
            mtime_nsecs: mtime.subsec_nanos(),
            ino,
        }
    }
}

const CURSOR_LEN: usize = 8 + 8 + 8 + 4 + 8;

impl WatchCursor {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CURSOR_LEN);
        out.extend_from_slice(&self.generation.to_le_bytes());
        out.extend_from_slice(&self.fingerprint.len.to_le_bytes());
        out.extend_from_slice(&self.fingerprint.mtime_secs.to_le_bytes());
        out.extend_from_slice(&self.fingerprint.mtime_nsecs.to_le_bytes());
        out.extend_from_slice(&self.fingerprint.ino.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != CURSOR_LEN {
            return Err(IndexHelperError::format(format!(
                "watch cursor is {} bytes, expected {}",
                bytes.len(),
                CURSOR_LEN
            )));
        }
        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        let mut nsecs = [0u8; 4];
        nsecs.copy_from_slice(&bytes[24..28]);
        Ok(Self {
            generation: u64_at(0),
            fingerprint: IndexFingerprint {
                len: u64_at(8),
                mtime_secs: u64_at(16),
                mtime_nsecs: u32::from_le_bytes(nsecs),
                ino: u64_at(28),
            },
        })
    }

    /// Content hash used to name and seal the sidecar segment.
    pub fn hash(&self) -> ObjectId {
        ObjectId::digest(&self.to_bytes())
    }
}

/// Narrow query interface over an external change source.
pub trait ChangeNotifier {
    fn cursor(&self) -> WatchCursor;

    fn has_changed_since(&self, cursor: &WatchCursor) -> bool {
        self.cursor() != *cursor
    }
}

/// Filesystem-notification backed [`ChangeNotifier`] for a git directory.
pub struct IndexWatcher {
    generation: Arc<AtomicU64>,
    index_path: PathBuf,
    _watcher: RecommendedWatcher,
}

impl IndexWatcher {
    /// Watch `git_dir` (non-recursively) for index writes.
    pub fn start(git_dir: &Path) -> std::result::Result<Self, notify::Error> {
        let generation = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&generation);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let relevant = match res {
                Ok(event) => event.paths.iter().any(|p| is_index_path(p)),
                // an error may hide a change
                Err(_) => true,
            };
            if relevant {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })?;
        watcher.watch(git_dir, RecursiveMode::NonRecursive)?;

        info!(git_dir = %git_dir.display(), "index watcher started");
        Ok(Self {
            generation,
            index_path: git_dir.join("index"),
            _watcher: watcher,
        })
    }
}

impl ChangeNotifier for IndexWatcher {
    fn cursor(&self) -> WatchCursor {
        WatchCursor {
            generation: self.generation.load(Ordering::SeqCst),
            fingerprint: IndexFingerprint::of(&self.index_path),
        }
    }
}

fn is_index_path(path: &Path) -> bool {
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name == "index" || name == "index.lock" || name.starts_with("sharedindex."),
        None => false,
    }
}

/// Read a published sidecar and return the cursor it carries.
pub fn read_sidecar(name: &SegmentName) -> Result<WatchCursor> {
    let view = shm::open_readonly(name.as_str())?;
    let bytes = view.as_slice();
    if bytes.len() != CURSOR_LEN + HASH_LEN {
        return Err(IndexHelperError::invalid_segment(name.as_str(), "unexpected sidecar size"));
    }
    let (payload, trailer) = bytes.split_at(CURSOR_LEN);
    if trailer != name.hash().as_bytes() || ObjectId::digest(payload) != *name.hash() {
        return Err(IndexHelperError::invalid_segment(
            name.as_str(),
            "trailer does not match name",
        ));
    }
    WatchCursor::from_bytes(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cursor_bytes() {
        let cursor = WatchCursor {
            generation: 7,
            fingerprint: IndexFingerprint {
                len: 1024,
                mtime_secs: 1_700_000_000,
                mtime_nsecs: 5,
                ino: 99,
            },
        };
        let bytes = cursor.to_bytes();
        assert_eq!(bytes.len(), CURSOR_LEN);
        assert_eq!(WatchCursor::from_bytes(&bytes).unwrap(), cursor);
        assert!(WatchCursor::from_bytes(&bytes[1..]).is_err());
    }

    #[test]
    fn test_index_path_filter() {
        assert!(is_index_path(Path::new("/repo/.git/index")));
        assert!(is_index_path(Path::new("/repo/.git/index.lock")));
        assert!(is_index_path(Path::new("/repo/.git/sharedindex.abc")));
        assert!(!is_index_path(Path::new("/repo/.git/HEAD")));
        assert!(!is_index_path(Path::new("/repo/.git/index-helper.pid")));
    }

    #[test]
    fn test_fingerprint_tracks_writes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index");
        assert_eq!(IndexFingerprint::of(&path), IndexFingerprint::default());

        std::fs::write(&path, b"one").unwrap();
        let first = IndexFingerprint::of(&path);
        assert_eq!(first.len, 3);

        std::fs::write(&path, b"longer").unwrap();
        assert_ne!(IndexFingerprint::of(&path), first);
    }

    #[test]
    fn test_watcher_sees_index_replacement() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("index"), b"v1").unwrap();
        let watcher = IndexWatcher::start(tmp.path()).unwrap();
        let before = watcher.cursor();
        assert!(!watcher.has_changed_since(&before));

        std::fs::write(tmp.path().join("index"), b"version two").unwrap();
        // the fingerprint alone is enough, whatever the notification latency
        assert!(watcher.has_changed_since(&before));
    }

    #[cfg(unix)]
    #[test]
    fn test_read_sidecar() {
        use crate::publish::Publisher;
        use crate::shm::Role;

        let cursor = WatchCursor {
            generation: 3,
            ..Default::default()
        };
        let payload = cursor.to_bytes();
        let publisher = Publisher::new(format!("ihwat{}-", std::process::id()));
        let seg = publisher
            .stage_bytes(Role::WatchSidecar(12), &cursor.hash(), &payload)
            .unwrap()
            .seal();
        assert_eq!(read_sidecar(seg.name()).unwrap(), cursor);
    }
}
