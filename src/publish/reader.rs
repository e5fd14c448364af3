//! Client-side access to published segments.

use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{fence, Ordering};
use tracing::debug;

use crate::error::{IndexHelperError, Result};
use crate::index::{read_trailing_hash, FileIndexStore, IndexSnapshot, IndexStore, HASH_LEN};
use crate::shm::{self, Role, SegmentName};

/// Map `name`, accept it only if its trailer equals the hash in its name,
/// and decode it.
pub fn open_published(name: &SegmentName, verify_checksum: bool) -> Result<IndexSnapshot> {
    let view = shm::open_readonly(name.as_str())?;
    let bytes = view.as_slice();
    if bytes.len() <= HASH_LEN {
        return Err(IndexHelperError::invalid_segment(name.as_str(), "segment too short"));
    }
    if &bytes[bytes.len() - HASH_LEN..] != name.hash().as_bytes() {
        return Err(IndexHelperError::invalid_segment(
            name.as_str(),
            "trailer does not match name",
        ));
    }
    fence(Ordering::Acquire);
    let owned = bytes.to_vec();
    drop(view);
    IndexSnapshot::parse(owned, verify_checksum)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexSource {
    SharedMemory,
    Disk,
}

#[derive(Debug)]
pub struct LoadedIndex {
    pub snapshot: IndexSnapshot,
    pub source: IndexSource,
}

/// Load the repository index, preferring the published copy that matches the
/// durable file's trailing hash and falling back to reading the file.
pub fn load_index(git_dir: &Path, namespace: &str, verify_checksum: bool) -> Result<LoadedIndex> {
    let mut store = FileIndexStore::new(git_dir);
    match load_shared(&store, namespace, verify_checksum) {
        Ok(snapshot) => Ok(LoadedIndex {
            snapshot,
            source: IndexSource::SharedMemory,
        }),
        Err(e) => {
            debug!(error = %e, "shared index unavailable, reading from disk");
            Ok(LoadedIndex {
                snapshot: store.read_snapshot()?,
                source: IndexSource::Disk,
            })
        }
    }
}

fn load_shared(store: &FileIndexStore, namespace: &str, verify_checksum: bool) -> Result<IndexSnapshot> {
    let hash = read_trailing_hash(&store.index_path())?;
    let name = SegmentName::new(namespace, Role::Main, &hash)?;
    let snapshot = open_published(&name, verify_checksum)?;

    match snapshot.split_base_hash() {
        Some(base_hash) => {
            let base_name = SegmentName::new(namespace, Role::Base, &base_hash)?;
            let base = match open_published(&base_name, verify_checksum) {
                Ok(base) => base,
                Err(_) => FileIndexStore::read_file(&store.shared_index_path(&base_hash))?,
            };
            Ok(snapshot.with_split_base(base))
        }
        None => Ok(snapshot),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::index::{IndexEntry, ObjectId};
    use crate::publish::{Publisher, SegmentRegistry, Staged};
    use tempfile::TempDir;

    fn ns(tag: &str) -> String {
        format!("ihrd{}-{}-", std::process::id(), tag)
    }

    fn snapshot(names: &[&str]) -> IndexSnapshot {
        let entries = names
            .iter()
            .map(|n| IndexEntry::new(*n, 0o100644, ObjectId::digest(n.as_bytes())))
            .collect();
        IndexSnapshot::from_entries(2, entries, vec![])
    }

    #[test]
    fn test_unsealed_segment_is_rejected() {
        let publisher = Publisher::new(ns("a"));
        let snap = snapshot(&["a"]);
        let staged = match publisher.stage(Role::Main, &snap, &SegmentRegistry::new()).unwrap() {
            Staged::Pending(s) => s,
            Staged::Unchanged => panic!("expected a new segment"),
        };
        let name = staged.name().clone();
        assert!(matches!(
            open_published(&name, false),
            Err(IndexHelperError::InvalidSegment { .. })
        ));

        let sealed = staged.seal();
        let read = open_published(&name, true).unwrap();
        assert_eq!(read.entries(), snap.entries());
        drop(sealed);
    }

    #[test]
    fn test_load_index_prefers_shared_then_falls_back() {
        let tmp = TempDir::new().unwrap();
        let namespace = ns("b");
        let snap = snapshot(&["one", "two", "three"]);
        std::fs::write(tmp.path().join("index"), snap.as_bytes()).unwrap();

        let loaded = load_index(tmp.path(), &namespace, false).unwrap();
        assert_eq!(loaded.source, IndexSource::Disk);
        assert_eq!(loaded.snapshot.hash(), snap.hash());

        let publisher = Publisher::new(namespace.clone());
        let seg = publisher
            .publish(Role::Main, &snap, &SegmentRegistry::new())
            .unwrap()
            .unwrap();
        let loaded = load_index(tmp.path(), &namespace, true).unwrap();
        assert_eq!(loaded.source, IndexSource::SharedMemory);
        assert_eq!(loaded.snapshot.entries(), snap.entries());

        drop(seg);
        let loaded = load_index(tmp.path(), &namespace, false).unwrap();
        assert_eq!(loaded.source, IndexSource::Disk);
    }
}
