//! 20-byte content hashes.

use serde::{Serialize, Serializer};
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;

use crate::error::{IndexHelperError, Result};

/// Width of every content hash (SHA-1).
pub const HASH_LEN: usize = 20;

/// A content hash: object ids inside entries and the trailing index checksum.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct ObjectId([u8; HASH_LEN]);

impl ObjectId {
    pub const NULL: ObjectId = ObjectId([0; HASH_LEN]);

    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        ObjectId(bytes)
    }

    /// Build from a slice that must be exactly [`HASH_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; HASH_LEN] = bytes.try_into().map_err(|_| {
            IndexHelperError::format(format!("expected {} hash bytes, got {}", HASH_LEN, bytes.len()))
        })?;
        Ok(ObjectId(arr))
    }

    /// SHA-1 of `data`.
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        ObjectId(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0; HASH_LEN]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for ObjectId {
    type Err = IndexHelperError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| IndexHelperError::format(format!("bad hex hash {:?}: {}", s, e)))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}
