//! Logical length recovery for page-granular platforms.
//!
//! Where the OS only reports a mapping's size rounded to pages, the creator
//! allocates one extra page and stores the logical length as a u64 LE at the
//! start of that final page:
//!
//! ```text
//! [logical bytes][zero fill to page boundary][len: u64 LE | ...zero...]
//! ```

use crate::error::{IndexHelperError, Result};

const LEN_FIELD: usize = std::mem::size_of::<u64>();

/// How a platform backend learns a segment's logical length on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthDiscovery {
    /// The object reports its exact size.
    Exact,
    /// Size is page-rounded; the length lives in a trailing page.
    PageTrailer,
}

#[cfg(any(target_os = "macos", target_os = "ios", windows))]
pub const LENGTH_DISCOVERY: LengthDiscovery = LengthDiscovery::PageTrailer;
#[cfg(not(any(target_os = "macos", target_os = "ios", windows)))]
pub const LENGTH_DISCOVERY: LengthDiscovery = LengthDiscovery::Exact;

/// Bytes to allocate for `logical` bytes under the given discovery mode.
pub fn mapped_len(mode: LengthDiscovery, logical: usize, page: usize) -> usize {
    match mode {
        LengthDiscovery::Exact => logical,
        LengthDiscovery::PageTrailer => round_up(logical, page) + page,
    }
}

fn round_up(len: usize, page: usize) -> usize {
    match len % page {
        0 => len,
        rem => len + (page - rem),
    }
}

/// Record `logical` in the final page of `map`.
pub fn write_length(map: &mut [u8], page: usize, logical: usize) {
    let at = map.len() - page;
    map[at..at + LEN_FIELD].copy_from_slice(&(logical as u64).to_le_bytes());
}

/// Recover the logical length from the final page of `map`.
pub fn read_length(map: &[u8], page: usize, name: &str) -> Result<usize> {
    if map.len() < page || map.len() % page != 0 {
        return Err(IndexHelperError::invalid_segment(
            name,
            format!("mapping size {} is not a multiple of page size {}", map.len(), page),
        ));
    }
    let at = map.len() - page;
    let mut raw = [0u8; LEN_FIELD];
    raw.copy_from_slice(&map[at..at + LEN_FIELD]);
    let logical = u64::from_le_bytes(raw) as usize;
    if logical > at {
        return Err(IndexHelperError::invalid_segment(
            name,
            format!("recorded length {} exceeds mapped payload {}", logical, at),
        ));
    }
    Ok(logical)
}

/// Logical length of an opened mapping under the given discovery mode.
pub fn logical_len(mode: LengthDiscovery, map: &[u8], page: usize, name: &str) -> Result<usize> {
    match mode {
        LengthDiscovery::Exact => Ok(map.len()),
        LengthDiscovery::PageTrailer => read_length(map, page, name),
    }
}
