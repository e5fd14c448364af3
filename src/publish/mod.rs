//! Index publisher - copies snapshots into content-addressed shared segments.
//!
//! Publishing is a two-step write with a single ordering rule:
//!
//! 1. create `<namespace><role>-<hash>` exclusively and copy every payload
//!    byte (everything except the last 20);
//! 2. after a release fence, write the 20-byte trailing hash.
//!
//! Readers treat a segment as valid only when its trailer equals the hash in
//! its name, so a half-written segment is indistinguishable from garbage and
//! never from a good one.

pub mod reader;
pub mod registry;

pub use reader::{load_index, open_published, IndexSource, LoadedIndex};
pub use registry::{OwnedSegment, SegmentRegistry};

use std::sync::atomic::{fence, Ordering};
use tracing::{debug, info};

use crate::error::{IndexHelperError, Result};
use crate::index::{IndexSnapshot, ObjectId, HASH_LEN};
use crate::shm::{self, Role, SegmentMut, SegmentName};

/// Roles a snapshot publishes to: the split base first, then the main index.
pub fn publish_roles(snapshot: &IndexSnapshot) -> Vec<(Role, &IndexSnapshot)> {
    let mut roles = Vec::with_capacity(2);
    if let Some(base) = snapshot.split_base() {
        roles.push((Role::Base, base));
    }
    roles.push((Role::Main, snapshot));
    roles
}

/// Result of staging one role.
#[derive(Debug)]
pub enum Staged {
    /// The registry already holds this hash for the role.
    Unchanged,
    Pending(UnsealedSegment),
}

/// A segment whose payload is copied but whose trailer is still zero.
/// Dropping it unlinks the segment.
#[derive(Debug)]
pub struct UnsealedSegment {
    inner: OwnedSegment,
}

impl UnsealedSegment {
    pub fn name(&self) -> &SegmentName {
        self.inner.name()
    }

    /// Write the trailing hash, making the segment valid for readers.
    pub fn seal(mut self) -> OwnedSegment {
        let hash = *self.inner.hash();
        if let Some(bytes) = self.inner.bytes_mut() {
            let len = bytes.len();
            fence(Ordering::Release);
            bytes[len - HASH_LEN..].copy_from_slice(hash.as_bytes());
            fence(Ordering::SeqCst);
        }
        self.inner
    }
}

/// Creates segments for a namespace.
#[derive(Debug, Clone)]
pub struct Publisher {
    namespace: String,
    mode: u32,
}

impl Publisher {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            mode: shm::DEFAULT_MODE,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn segment_name(&self, role: Role, hash: &ObjectId) -> Result<SegmentName> {
        SegmentName::new(&self.namespace, role, hash)
    }

    /// Create the segment for `role` and copy the payload, leaving the trailer
    /// zeroed. A no-op when the registry already publishes this hash.
    pub fn stage(
        &self,
        role: Role,
        snapshot: &IndexSnapshot,
        registry: &SegmentRegistry,
    ) -> Result<Staged> {
        let bytes = snapshot.as_bytes();
        let hash = snapshot.hash();
        if bytes.len() <= HASH_LEN || &bytes[bytes.len() - HASH_LEN..] != hash.as_bytes() {
            return Err(IndexHelperError::invalid_segment(
                format!("{}", role),
                "snapshot bytes do not end with its hash",
            ));
        }
        if registry.current_hash(role) == Some(hash) {
            debug!(role = %role, hash = %hash, "already published");
            return Ok(Staged::Unchanged);
        }
        self.stage_bytes(role, &hash, &bytes[..bytes.len() - HASH_LEN])
            .map(Staged::Pending)
    }

    /// Create a segment named for `hash` holding `payload` plus room for the
    /// trailer.
    pub fn stage_bytes(&self, role: Role, hash: &ObjectId, payload: &[u8]) -> Result<UnsealedSegment> {
        let name = self.segment_name(role, hash)?;
        let mut region: SegmentMut = shm::create(name.as_str(), payload.len() + HASH_LEN, self.mode)?;
        region.as_mut_slice()[..payload.len()].copy_from_slice(payload);
        Ok(UnsealedSegment {
            inner: OwnedSegment::new(name, region),
        })
    }

    /// Stage and seal. Returns `None` when nothing changed.
    pub fn publish(
        &self,
        role: Role,
        snapshot: &IndexSnapshot,
        registry: &SegmentRegistry,
    ) -> Result<Option<OwnedSegment>> {
        match self.stage(role, snapshot, registry)? {
            Staged::Unchanged => Ok(None),
            Staged::Pending(unsealed) => {
                let segment = unsealed.seal();
                info!(
                    role = %role,
                    name = %segment.name(),
                    bytes = segment.len(),
                    entries = snapshot.len(),
                    "index published"
                );
                Ok(Some(segment))
            }
        }
    }
}
