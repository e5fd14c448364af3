//! Live segments, one per role.

use std::collections::BTreeMap;
use std::sync::atomic::{fence, Ordering};
use tracing::{debug, warn};

use crate::error::IndexHelperError;
use crate::index::ObjectId;
use crate::shm::{self, Role, SegmentMut, SegmentName};

/// A sealed segment owned by the daemon. Dropping it unmaps and unlinks.
pub struct OwnedSegment {
    name: SegmentName,
    region: Option<SegmentMut>,
}

impl OwnedSegment {
    pub(crate) fn new(name: SegmentName, region: SegmentMut) -> Self {
        Self {
            name,
            region: Some(region),
        }
    }

    pub fn name(&self) -> &SegmentName {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.name.role()
    }

    pub fn hash(&self) -> &ObjectId {
        self.name.hash()
    }

    pub fn len(&self) -> usize {
        self.region.as_ref().map_or(0, |r| r.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        self.region.as_mut().map(|r| r.as_mut_slice())
    }

    /// Unmap and unlink now.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(region) = self.region.take() {
            fence(Ordering::SeqCst);
            region.unmap();
            match shm::unlink(self.name.as_str()) {
                Ok(()) => debug!(name = %self.name, "segment released"),
                Err(IndexHelperError::SegmentNotFound(_)) => {
                    debug!(name = %self.name, "segment already gone")
                }
                Err(e) => warn!(name = %self.name, error = %e, "failed to unlink segment"),
            }
        }
    }
}

impl Drop for OwnedSegment {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for OwnedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedSegment")
            .field("name", &self.name.as_str())
            .field("len", &self.len())
            .finish()
    }
}

/// Role → currently published segment.
#[derive(Debug, Default)]
pub struct SegmentRegistry {
    slots: BTreeMap<Role, OwnedSegment>,
}

impl SegmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_hash(&self, role: Role) -> Option<ObjectId> {
        self.slots.get(&role).map(|seg| *seg.hash())
    }

    pub fn get(&self, role: Role) -> Option<&OwnedSegment> {
        self.slots.get(&role)
    }

    /// Make `segment` the live one for its role, releasing any predecessor.
    pub fn install(&mut self, segment: OwnedSegment) {
        let role = segment.role();
        debug!(role = %role, name = %segment.name(), "segment installed");
        if let Some(old) = self.slots.insert(role, segment) {
            old.release();
        }
    }

    pub fn release(&mut self, role: Role) -> bool {
        match self.slots.remove(&role) {
            Some(seg) => {
                seg.release();
                true
            }
            None => false,
        }
    }

    /// Release every role matching `pred`; returns how many were released.
    pub fn release_where(&mut self, mut pred: impl FnMut(Role) -> bool) -> usize {
        let doomed: Vec<Role> = self.slots.keys().copied().filter(|r| pred(*r)).collect();
        for role in &doomed {
            self.release(*role);
        }
        doomed.len()
    }

    pub fn release_all(&mut self) -> usize {
        self.release_where(|_| true)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OwnedSegment> {
        self.slots.values()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::shm::DEFAULT_MODE;

    fn segment(ns: &str, role: Role, seed: &[u8]) -> OwnedSegment {
        let name = SegmentName::new(ns, role, &ObjectId::digest(seed)).unwrap();
        let region = shm::create(name.as_str(), 64, DEFAULT_MODE).unwrap();
        OwnedSegment::new(name, region)
    }

    fn exists(name: &str) -> bool {
        shm::open_readonly(name).is_ok()
    }

    #[test]
    fn test_install_replaces_and_releases() {
        let ns = format!("ihreg{}-a-", std::process::id());
        let mut registry = SegmentRegistry::new();

        let first = segment(&ns, Role::Main, b"one");
        let first_name = first.name().as_str().to_string();
        registry.install(first);
        assert!(exists(&first_name));
        assert_eq!(registry.current_hash(Role::Main), Some(ObjectId::digest(b"one")));

        let second = segment(&ns, Role::Main, b"two");
        let second_name = second.name().as_str().to_string();
        registry.install(second);
        assert!(!exists(&first_name));
        assert!(exists(&second_name));
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.release_all(), 1);
        assert!(!exists(&second_name));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drop_unlinks() {
        let ns = format!("ihreg{}-b-", std::process::id());
        let seg = segment(&ns, Role::Base, b"dropme");
        let name = seg.name().as_str().to_string();
        assert!(exists(&name));
        drop(seg);
        assert!(!exists(&name));
    }

    #[test]
    fn test_release_where() {
        let ns = format!("ihreg{}-c-", std::process::id());
        let mut registry = SegmentRegistry::new();
        registry.install(segment(&ns, Role::Main, b"m"));
        registry.install(segment(&ns, Role::WatchSidecar(1), b"s1"));
        registry.install(segment(&ns, Role::WatchSidecar(2), b"s2"));

        let released = registry.release_where(|r| matches!(r, Role::WatchSidecar(_)));
        assert_eq!(released, 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(Role::Main).is_some());
    }
}
