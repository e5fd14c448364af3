//! Reading the durable index from a repository's metadata directory.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::oid::{ObjectId, HASH_LEN};
use super::IndexSnapshot;
use crate::error::{IndexHelperError, Result};

/// Source of index snapshots for the daemon.
pub trait IndexStore {
    /// Read the current index, including the split base when there is one.
    fn read_snapshot(&mut self) -> Result<IndexSnapshot>;
}

/// Reads `<git-dir>/index` (and `<git-dir>/sharedindex.<hex>` for split
/// indexes) from disk.
#[derive(Debug, Clone)]
pub struct FileIndexStore {
    git_dir: PathBuf,
}

impl FileIndexStore {
    pub fn new(git_dir: impl Into<PathBuf>) -> Self {
        Self {
            git_dir: git_dir.into(),
        }
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    pub fn index_path(&self) -> PathBuf {
        self.git_dir.join("index")
    }

    pub fn shared_index_path(&self, base: &ObjectId) -> PathBuf {
        self.git_dir.join(format!("sharedindex.{}", base))
    }

    /// Read a durable index file, always checking its trailing hash.
    pub fn read_file(path: &Path) -> Result<IndexSnapshot> {
        let bytes = fs::read(path)?;
        let snapshot = IndexSnapshot::parse(bytes, true)?;
        debug!(
            path = %path.display(),
            entries = snapshot.len(),
            hash = %snapshot.hash(),
            "index file read"
        );
        Ok(snapshot)
    }
}

impl IndexStore for FileIndexStore {
    fn read_snapshot(&mut self) -> Result<IndexSnapshot> {
        let snapshot = Self::read_file(&self.index_path())?;
        match snapshot.split_base_hash() {
            Some(base_hash) => {
                let base = Self::read_file(&self.shared_index_path(&base_hash))?;
                if base.hash() != base_hash {
                    return Err(IndexHelperError::ChecksumMismatch {
                        expected: base_hash.to_hex(),
                        actual: base.hash().to_hex(),
                    });
                }
                Ok(snapshot.with_split_base(base))
            }
            None => Ok(snapshot),
        }
    }
}

/// Read only the trailing content hash of a durable index file.
pub fn read_trailing_hash(path: &Path) -> Result<ObjectId> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < (HASH_LEN + 12) as u64 {
        return Err(IndexHelperError::format(format!(
            "{} is too short to be an index",
            path.display()
        )));
    }
    file.seek(SeekFrom::End(-(HASH_LEN as i64)))?;
    let mut buf = [0u8; HASH_LEN];
    file.read_exact(&mut buf)?;
    Ok(ObjectId::from_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{Extension, IndexEntry, LINK_EXTENSION};
    use tempfile::TempDir;

    fn write_index(dir: &Path, names: &[&str]) -> IndexSnapshot {
        let entries = names
            .iter()
            .map(|n| IndexEntry::new(*n, 0o100644, ObjectId::digest(n.as_bytes())))
            .collect();
        let snap = IndexSnapshot::from_entries(2, entries, vec![]);
        fs::write(dir.join("index"), snap.as_bytes()).unwrap();
        snap
    }

    #[test]
    fn test_read_snapshot() {
        let tmp = TempDir::new().unwrap();
        let written = write_index(tmp.path(), &["a", "b", "c"]);

        let mut store = FileIndexStore::new(tmp.path());
        let snap = store.read_snapshot().unwrap();
        assert_eq!(snap.hash(), written.hash());
        assert_eq!(snap.len(), 3);
        assert!(snap.split_base().is_none());
    }

    #[test]
    fn test_missing_index_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let mut store = FileIndexStore::new(tmp.path());
        assert!(matches!(store.read_snapshot(), Err(IndexHelperError::Io(_))));
    }

    #[test]
    fn test_read_split_index() {
        let tmp = TempDir::new().unwrap();
        let base = IndexSnapshot::from_entries(
            2,
            vec![IndexEntry::new("base.txt", 0o100644, ObjectId::digest(b"base"))],
            vec![],
        );
        let store = FileIndexStore::new(tmp.path());
        fs::write(store.shared_index_path(&base.hash()), base.as_bytes()).unwrap();

        let overlay = IndexSnapshot::from_entries(
            2,
            vec![IndexEntry::new("new.txt", 0o100644, ObjectId::digest(b"new"))],
            vec![Extension::new(LINK_EXTENSION, base.hash().as_bytes().to_vec())],
        );
        fs::write(store.index_path(), overlay.as_bytes()).unwrap();

        let mut store = store;
        let snap = store.read_snapshot().unwrap();
        assert_eq!(snap.hash(), overlay.hash());
        assert_eq!(snap.split_base().map(|b| b.hash()), Some(base.hash()));
    }

    #[test]
    fn test_read_trailing_hash() {
        let tmp = TempDir::new().unwrap();
        let written = write_index(tmp.path(), &["x"]);
        let hash = read_trailing_hash(&tmp.path().join("index")).unwrap();
        assert_eq!(hash, written.hash());
    }
}
