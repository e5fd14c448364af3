//! Index entries: stat data, mode, object id, flags and path.

use serde::Serialize;

use super::oid::ObjectId;

/// Seconds + nanoseconds timestamp as stored in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FileTime {
    pub secs: u32,
    pub nsecs: u32,
}

/// The stat block cached for change detection. Every field is durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatData {
    pub ctime: FileTime,
    pub mtime: FileTime,
    pub dev: u32,
    pub ino: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
}

/// In-memory entry flags.
///
/// The low 16 bits mirror the on-disk flag word (minus the name length);
/// bits 16..=20 are volatile bookkeeping that is never written; bits 29 and
/// 30 are the v3 extended flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EntryFlags(pub u32);

impl EntryFlags {
    pub const NAME_MASK: u32 = 0x0fff;
    pub const STAGE_MASK: u32 = 0x3000;
    pub const EXTENDED: u32 = 0x4000;
    pub const VALID: u32 = 0x8000;
    pub const STAGE_SHIFT: u32 = 12;

    pub const UPDATE: u32 = 1 << 16;
    pub const REMOVE: u32 = 1 << 17;
    pub const UPTODATE: u32 = 1 << 18;
    pub const ADDED: u32 = 1 << 19;
    pub const HASHED: u32 = 1 << 20;

    pub const INTENT_TO_ADD: u32 = 1 << 29;
    pub const SKIP_WORKTREE: u32 = 1 << 30;
    pub const EXTENDED_FLAGS: u32 = Self::INTENT_TO_ADD | Self::SKIP_WORKTREE;

    /// Bits that survive a write/read cycle.
    pub const DURABLE: u32 = Self::STAGE_MASK | Self::VALID | Self::EXTENDED_FLAGS;

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    pub fn insert(&mut self, bits: u32) {
        self.0 |= bits;
    }

    pub fn remove(&mut self, bits: u32) {
        self.0 &= !bits;
    }

    pub fn durable(self) -> u32 {
        self.0 & Self::DURABLE
    }

    pub fn stage(self) -> u8 {
        ((self.0 & Self::STAGE_MASK) >> Self::STAGE_SHIFT) as u8
    }

    pub fn has_extended(self) -> bool {
        self.0 & Self::EXTENDED_FLAGS != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    pub stat: StatData,
    pub mode: u32,
    pub oid: ObjectId,
    pub flags: EntryFlags,
    #[serde(serialize_with = "serialize_name")]
    pub name: Vec<u8>,
}

impl IndexEntry {
    /// A stage-0 entry with zeroed stat data.
    pub fn new(name: impl Into<Vec<u8>>, mode: u32, oid: ObjectId) -> Self {
        Self {
            stat: StatData::default(),
            mode,
            oid,
            flags: EntryFlags::default(),
            name: name.into(),
        }
    }

    pub fn name_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }

    pub fn stage(&self) -> u8 {
        self.flags.stage()
    }
}

fn serialize_name<S: serde::Serializer>(name: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&String::from_utf8_lossy(name))
}
