//! Index store - the parsed repository index and the file it lives in.
//!
//! An [`IndexSnapshot`] keeps both the decoded entries and the exact durable
//! bytes they were decoded from (or encoded to), so publishing never needs to
//! re-serialize and the shared copy is byte-identical to the file on disk.

pub mod codec;
pub mod entry;
pub mod oid;
pub mod store;

pub use codec::Extension;
pub use entry::{EntryFlags, FileTime, IndexEntry, StatData};
pub use oid::{ObjectId, HASH_LEN};
pub use store::{read_trailing_hash, FileIndexStore, IndexStore};

use crate::error::Result;

/// Split-index link extension signature.
pub const LINK_EXTENSION: &[u8; 4] = b"link";

#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    version: u32,
    entries: Vec<IndexEntry>,
    extensions: Vec<Extension>,
    bytes: Vec<u8>,
    hash: ObjectId,
    base: Option<Box<IndexSnapshot>>,
}

impl IndexSnapshot {
    /// Decode durable bytes, keeping them for publishing.
    pub fn parse(bytes: Vec<u8>, verify_checksum: bool) -> Result<Self> {
        let decoded = codec::decode(&bytes, verify_checksum)?;
        Ok(Self {
            version: decoded.version,
            entries: decoded.entries,
            extensions: decoded.extensions,
            hash: decoded.checksum,
            bytes,
            base: None,
        })
    }

    /// Encode entries into the durable layout.
    pub fn from_entries(version: u32, entries: Vec<IndexEntry>, extensions: Vec<Extension>) -> Self {
        let (version, bytes) = codec::encode(version, &entries, &extensions);
        let hash = ObjectId::digest(&bytes[..bytes.len() - HASH_LEN]);
        Self {
            version,
            entries,
            extensions,
            bytes,
            hash,
            base: None,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// The trailing content hash.
    pub fn hash(&self) -> ObjectId {
        self.hash
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Mutable access to the decoded entries. The durable bytes are left
    /// as they were.
    pub fn entries_mut(&mut self) -> &mut Vec<IndexEntry> {
        &mut self.entries
    }

    pub fn extensions(&self) -> &[Extension] {
        &self.extensions
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Base hash named by the `link` extension, if this is a split index.
    pub fn split_base_hash(&self) -> Option<ObjectId> {
        self.extensions
            .iter()
            .find(|ext| &ext.signature == LINK_EXTENSION)
            .and_then(|ext| ext.data.get(..HASH_LEN))
            .and_then(|raw| ObjectId::from_slice(raw).ok())
            .filter(|oid| !oid.is_null())
    }

    pub fn split_base(&self) -> Option<&IndexSnapshot> {
        self.base.as_deref()
    }

    pub fn with_split_base(mut self, base: IndexSnapshot) -> Self {
        self.base = Some(Box::new(base));
        self
    }
}
