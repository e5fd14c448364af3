//! Durable index byte layout: decode and encode.
//!
//! ```text
//! "DIRC" | version u32 | count u32 | entries... | extensions... | sha1
//! ```
//!
//! All integers are big-endian. Each entry is padded with 1..=8 NUL bytes so
//! its length is a multiple of 8.

use super::entry::{EntryFlags, FileTime, IndexEntry, StatData};
use super::oid::{ObjectId, HASH_LEN};
use crate::error::{IndexHelperError, Result};

pub const SIGNATURE: &[u8; 4] = b"DIRC";
const HEADER_LEN: usize = 12;
/// Ten stat words, the object id and the flag word.
const ENTRY_FIXED_LEN: usize = 40 + HASH_LEN + 2;
const ONDISK_EXTENDED: u16 = 0x4000;

/// An index extension, preserved byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub signature: [u8; 4],
    pub data: Vec<u8>,
}

impl Extension {
    pub fn new(signature: &[u8; 4], data: Vec<u8>) -> Self {
        Self {
            signature: *signature,
            data,
        }
    }
}

/// Decoded form of an index file, minus the bytes themselves.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub version: u32,
    pub entries: Vec<IndexEntry>,
    pub extensions: Vec<Extension>,
    pub checksum: ObjectId,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| {
                IndexHelperError::format(format!("truncated index at offset {}", self.pos))
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// On-disk size of an entry with the given name length.
fn entry_len(fixed: usize, name_len: usize) -> usize {
    (fixed + name_len + 8) & !7
}

/// Decode an index. With `verify_checksum` the trailing hash is recomputed
/// over the payload and must match.
pub fn decode(bytes: &[u8], verify_checksum: bool) -> Result<Decoded> {
    if bytes.len() < HEADER_LEN + HASH_LEN {
        return Err(IndexHelperError::format(format!(
            "index too short ({} bytes)",
            bytes.len()
        )));
    }
    let body_len = bytes.len() - HASH_LEN;
    let checksum = ObjectId::from_slice(&bytes[body_len..])?;

    if verify_checksum {
        let actual = ObjectId::digest(&bytes[..body_len]);
        if actual != checksum {
            return Err(IndexHelperError::ChecksumMismatch {
                expected: checksum.to_hex(),
                actual: actual.to_hex(),
            });
        }
    }

    let mut r = Reader {
        buf: &bytes[..body_len],
        pos: 0,
    };
    if r.take(4)? != SIGNATURE {
        return Err(IndexHelperError::format("bad index signature"));
    }
    let version = r.u32()?;
    if !(2..=3).contains(&version) {
        return Err(IndexHelperError::format(format!(
            "unsupported index version {}",
            version
        )));
    }
    let count = r.u32()? as usize;

    // Every entry takes at least 64 bytes; don't trust a huge count.
    let mut entries = Vec::with_capacity(count.min(r.remaining() / 64 + 1));
    for i in 0..count {
        entries.push(decode_entry(&mut r, version, i)?);
    }

    let mut extensions = Vec::new();
    while r.remaining() > 0 {
        if r.remaining() < 8 {
            return Err(IndexHelperError::format("trailing garbage after extensions"));
        }
        let sig = r.take(4)?;
        let size = r.u32()? as usize;
        let data = r.take(size)?;
        extensions.push(Extension {
            signature: [sig[0], sig[1], sig[2], sig[3]],
            data: data.to_vec(),
        });
    }

    Ok(Decoded {
        version,
        entries,
        extensions,
        checksum,
    })
}

fn decode_entry(r: &mut Reader<'_>, version: u32, index: usize) -> Result<IndexEntry> {
    let start = r.pos;
    let stat_words = r.take(40)?;
    let word = |i: usize| {
        let b = &stat_words[i * 4..i * 4 + 4];
        u32::from_be_bytes([b[0], b[1], b[2], b[3]])
    };
    let stat = StatData {
        ctime: FileTime {
            secs: word(0),
            nsecs: word(1),
        },
        mtime: FileTime {
            secs: word(2),
            nsecs: word(3),
        },
        dev: word(4),
        ino: word(5),
        uid: word(7),
        gid: word(8),
        size: word(9),
    };
    let mode = word(6);
    let oid = ObjectId::from_slice(r.take(HASH_LEN)?)?;
    let ondisk = r.u16()?;

    let mut fixed = ENTRY_FIXED_LEN;
    let mut flags = u32::from(ondisk) & (EntryFlags::STAGE_MASK | EntryFlags::VALID);
    if ondisk & ONDISK_EXTENDED != 0 {
        if version < 3 {
            return Err(IndexHelperError::format(format!(
                "entry {} has extended flags in a v{} index",
                index, version
            )));
        }
        let extended = r.u16()?;
        flags |= (u32::from(extended) << 16) & EntryFlags::EXTENDED_FLAGS;
        fixed += 2;
    }

    let name_field = (u32::from(ondisk) & EntryFlags::NAME_MASK) as usize;
    let name_len = if name_field < EntryFlags::NAME_MASK as usize {
        name_field
    } else {
        r.buf[r.pos..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| IndexHelperError::format(format!("entry {} name not terminated", index)))?
    };
    let name = r.take(name_len)?.to_vec();
    if name.is_empty() {
        return Err(IndexHelperError::format(format!("entry {} has an empty name", index)));
    }

    let padding = entry_len(fixed, name_len) - fixed - name_len;
    let pad = r.take(padding)?;
    if pad.iter().any(|&b| b != 0) {
        return Err(IndexHelperError::format(format!(
            "entry {} at offset {} has non-NUL padding",
            index, start
        )));
    }

    Ok(IndexEntry {
        stat,
        mode,
        oid,
        flags: EntryFlags(flags),
        name,
    })
}

/// Encode an index and append its trailing hash. The version is raised to 3
/// when an entry carries extended flags.
pub fn encode(version: u32, entries: &[IndexEntry], extensions: &[Extension]) -> (u32, Vec<u8>) {
    let version = if entries.iter().any(|e| e.flags.has_extended()) {
        version.max(3)
    } else {
        version
    };

    let mut out = Vec::with_capacity(HEADER_LEN + entries.len() * 80 + HASH_LEN);
    out.extend_from_slice(SIGNATURE);
    out.extend_from_slice(&version.to_be_bytes());
    out.extend_from_slice(&(entries.len() as u32).to_be_bytes());

    for entry in entries {
        encode_entry(&mut out, entry);
    }

    for ext in extensions {
        out.extend_from_slice(&ext.signature);
        out.extend_from_slice(&(ext.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&ext.data);
    }

    let checksum = ObjectId::digest(&out);
    out.extend_from_slice(checksum.as_bytes());
    (version, out)
}

fn encode_entry(out: &mut Vec<u8>, entry: &IndexEntry) {
    let s = &entry.stat;
    for word in [
        s.ctime.secs,
        s.ctime.nsecs,
        s.mtime.secs,
        s.mtime.nsecs,
        s.dev,
        s.ino,
        entry.mode,
        s.uid,
        s.gid,
        s.size,
    ] {
        out.extend_from_slice(&word.to_be_bytes());
    }
    out.extend_from_slice(entry.oid.as_bytes());

    let extended = entry.flags.has_extended();
    let name_len = entry.name.len();
    let mut ondisk = entry.flags.0 & (EntryFlags::STAGE_MASK | EntryFlags::VALID);
    ondisk |= (name_len as u32).min(EntryFlags::NAME_MASK);
    if extended {
        ondisk |= u32::from(ONDISK_EXTENDED);
    }
    out.extend_from_slice(&(ondisk as u16).to_be_bytes());

    let mut fixed = ENTRY_FIXED_LEN;
    if extended {
        let ext = (entry.flags.0 & EntryFlags::EXTENDED_FLAGS) >> 16;
        out.extend_from_slice(&(ext as u16).to_be_bytes());
        fixed += 2;
    }

    out.extend_from_slice(&entry.name);
    let padding = entry_len(fixed, name_len) - fixed - name_len;
    out.resize(out.len() + padding, 0);
}
