//! Verifier - re-reads a published segment the way a client would and checks
//! it against the snapshot it was copied from.
//!
//! Only durable data is compared: the entry count, each path, the on-disk
//! subset of the flags, and the stat block with mode and object id. Volatile
//! in-memory flags are ignored.

use tracing::{debug, warn};

use crate::error::{IndexHelperError, Result};
use crate::index::{EntryFlags, IndexEntry, IndexSnapshot};
use crate::publish::open_published;
use crate::shm::SegmentName;

/// Open `name` through the client read path and compare it with `source`.
pub fn verify_segment(name: &SegmentName, source: &IndexSnapshot) -> Result<()> {
    let published = open_published(name, true)?;
    match compare_snapshots(source, &published) {
        Ok(()) => {
            debug!(name = %name, entries = source.len(), "segment verified");
            Ok(())
        }
        Err(e) => {
            warn!(name = %name, error = %e, "segment does not match its source");
            Err(e)
        }
    }
}

/// First durable difference between two snapshots, if any.
pub fn compare_snapshots(source: &IndexSnapshot, published: &IndexSnapshot) -> Result<()> {
    if source.len() != published.len() {
        return Err(IndexHelperError::VerifyMismatch {
            entry: source.len().min(published.len()),
            reason: format!(
                "entry count {} != {}",
                source.len(),
                published.len()
            ),
        });
    }
    for (i, (a, b)) in source.entries().iter().zip(published.entries()).enumerate() {
        if let Some(reason) = entry_difference(a, b) {
            return Err(IndexHelperError::VerifyMismatch { entry: i, reason });
        }
    }
    Ok(())
}

fn entry_difference(a: &IndexEntry, b: &IndexEntry) -> Option<String> {
    if a.name.len() != b.name.len() {
        return Some(format!("name length {} != {}", a.name.len(), b.name.len()));
    }
    if a.name != b.name {
        return Some(format!("name {:?} != {:?}", a.name_lossy(), b.name_lossy()));
    }
    if a.flags.durable() != b.flags.durable() {
        return Some(format!(
            "flags {:#x} != {:#x}",
            a.flags.0 & EntryFlags::DURABLE,
            b.flags.0 & EntryFlags::DURABLE
        ));
    }
    if a.stat != b.stat || a.mode != b.mode || a.oid != b.oid {
        return Some(format!("stat data differs for {:?}", a.name_lossy()));
    }
    None
}
