//! Segment manager - named shared-memory regions across platforms.
//!
//! One interface over the platform backends:
//!
//! - [`create`] exclusively creates and maps a region read-write. A name that
//!   already exists is a [`SegmentExists`](crate::IndexHelperError::SegmentExists)
//!   error, never an overwrite.
//! - [`open_readonly`] maps an existing region for clients.
//! - Dropping (or [`SegmentMut::unmap`]) unmaps.
//! - [`unlink`] removes the name; a no-op where the last unmap already
//!   destroys the object.
//!
//! Regions always expose their *logical* length. Backends that only know a
//! page-rounded size recover it from a trailing page (see [`trailer`]).

pub mod name;
pub mod trailer;

#[cfg(unix)]
#[path = "posix.rs"]
mod sys;
#[cfg(windows)]
#[path = "windows.rs"]
mod sys;
#[cfg(not(any(unix, windows)))]
#[path = "unsupported.rs"]
mod sys;

pub use name::{Role, SegmentName, MAX_NAME_LEN};
pub use trailer::{LengthDiscovery, LENGTH_DISCOVERY};

use tracing::debug;

use crate::error::{IndexHelperError, Result};

/// Permission bits for created regions (owner only).
pub const DEFAULT_MODE: u32 = 0o700;

/// A region this process created and may write.
pub struct SegmentMut {
    name: String,
    map: sys::MapMut,
    len: usize,
}

impl SegmentMut {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map[..self.len]
    }

    pub fn unmap(self) {
        drop(self);
    }
}

impl std::fmt::Debug for SegmentMut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentMut")
            .field("name", &self.name)
            .field("len", &self.len)
            .finish()
    }
}

/// A read-only mapping of someone else's region.
pub struct SegmentView {
    name: String,
    map: sys::MapRo,
    len: usize,
}

impl SegmentView {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map[..self.len]
    }

    pub fn unmap(self) {
        drop(self);
    }
}

impl std::fmt::Debug for SegmentView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentView")
            .field("name", &self.name)
            .field("len", &self.len)
            .finish()
    }
}

pub fn page_size() -> usize {
    sys::page_size()
}

/// Exclusively create `name` holding `size` logical bytes, zero-filled.
pub fn create(name: &str, size: usize, mode: u32) -> Result<SegmentMut> {
    name::check_len(name)?;
    if size == 0 {
        return Err(IndexHelperError::invalid_segment(name, "zero-length segment"));
    }
    let page = sys::page_size();
    let mapped = trailer::mapped_len(LENGTH_DISCOVERY, size, page);
    let mut map = sys::create(name, mapped, mode)?;
    if LENGTH_DISCOVERY == LengthDiscovery::PageTrailer {
        trailer::write_length(&mut map, page, size);
    }
    debug!(name, size, mapped, "shared segment created");
    Ok(SegmentMut {
        name: name.to_string(),
        map,
        len: size,
    })
}

/// Map an existing region read-only.
pub fn open_readonly(name: &str) -> Result<SegmentView> {
    name::check_len(name)?;
    let map = sys::open_readonly(name)?;
    let len = trailer::logical_len(LENGTH_DISCOVERY, &map, sys::page_size(), name)?;
    Ok(SegmentView {
        name: name.to_string(),
        map,
        len,
    })
}

pub fn unlink(name: &str) -> Result<()> {
    name::check_len(name)?;
    sys::unlink(name)?;
    debug!(name, "shared segment unlinked");
    Ok(())
}

/// Create and remove a throwaway region to confirm shared memory works here.
pub fn probe(namespace: &str) -> Result<()> {
    name::validate_namespace(namespace)?;
    let name = format!("{}probe-{}", namespace, std::process::id());
    // A leftover from a crashed probe with our PID is ours to replace.
    let _ = sys::unlink(&name);
    let segment = create(&name, 1, DEFAULT_MODE)?;
    segment.unmap();
    match unlink(&name) {
        Ok(()) | Err(IndexHelperError::SegmentNotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("ihshm{}-{}", std::process::id(), tag)
    }

    #[test]
    fn test_create_open_unlink() {
        let name = unique("basic");
        let mut seg = create(&name, 100, DEFAULT_MODE).unwrap();
        assert_eq!(seg.len(), 100);
        assert!(seg.as_slice().iter().all(|&b| b == 0));
        seg.as_mut_slice()[..5].copy_from_slice(b"hello");

        let view = open_readonly(&name).unwrap();
        assert_eq!(view.len(), 100);
        assert_eq!(&view.as_slice()[..5], b"hello");

        view.unmap();
        seg.unmap();
        unlink(&name).unwrap();
        assert!(matches!(
            open_readonly(&name),
            Err(IndexHelperError::SegmentNotFound(_))
        ));
    }

    #[test]
    fn test_exclusive_create() {
        let name = unique("excl");
        let mut first = create(&name, 32, DEFAULT_MODE).unwrap();
        first.as_mut_slice()[0] = 7;

        let second = create(&name, 64, DEFAULT_MODE);
        assert!(matches!(second, Err(IndexHelperError::SegmentExists(_))));

        // the existing region is untouched
        let view = open_readonly(&name).unwrap();
        assert_eq!(view.len(), 32);
        assert_eq!(view.as_slice()[0], 7);

        drop(view);
        drop(first);
        unlink(&name).unwrap();
    }

    #[test]
    fn test_unlink_missing() {
        assert!(matches!(
            unlink(&unique("missing")),
            Err(IndexHelperError::SegmentNotFound(_))
        ));
    }

    #[test]
    fn test_rejects_bad_names() {
        assert!(create("a/b", 10, DEFAULT_MODE).is_err());
        assert!(create(&"x".repeat(MAX_NAME_LEN + 1), 10, DEFAULT_MODE).is_err());
        assert!(create(&unique("zero"), 0, DEFAULT_MODE).is_err());
    }

    #[test]
    fn test_probe() {
        probe("ihprobe-").unwrap();
    }
}
