//! Content-addressed segment names: `<namespace><role>-<hex>[-<pid>]`.

use serde::Serialize;
use std::fmt;

use crate::error::{IndexHelperError, Result};
use crate::index::ObjectId;

/// Longest name accepted, so the platform path (`/name` or `Local\name`)
/// plus terminator stays inside a small fixed buffer.
pub const MAX_NAME_LEN: usize = 71;

/// Logical slot a published segment occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Main,
    Base,
    WatchSidecar(u32),
}

impl Role {
    /// Name component for this role.
    pub fn tag(&self) -> &'static str {
        match self {
            Role::Main => "index",
            Role::Base => "sharedindex",
            Role::WatchSidecar(_) => "watch",
        }
    }

    pub fn requester(&self) -> Option<u32> {
        match self {
            Role::WatchSidecar(pid) => Some(*pid),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Main => f.write_str("main"),
            Role::Base => f.write_str("base"),
            Role::WatchSidecar(pid) => write!(f, "watch-sidecar[{}]", pid),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentName {
    full: String,
    role: Role,
    hash: ObjectId,
}

impl SegmentName {
    pub fn new(namespace: &str, role: Role, hash: &ObjectId) -> Result<Self> {
        validate_namespace(namespace)?;
        let mut full = format!("{}{}-{}", namespace, role.tag(), hash);
        if let Some(pid) = role.requester() {
            full.push_str(&format!("-{}", pid));
        }
        check_len(&full)?;
        Ok(Self {
            full,
            role,
            hash: *hash,
        })
    }

    /// Parse a name produced by [`SegmentName::new`] with the same namespace.
    pub fn parse(namespace: &str, name: &str) -> Result<Self> {
        let invalid = || IndexHelperError::InvalidName(name.to_string());
        let rest = name.strip_prefix(namespace).ok_or_else(invalid)?;

        let (role_tag, rest) = rest.split_once('-').ok_or_else(invalid)?;
        let (hex_part, pid) = match rest.split_once('-') {
            Some((hex_part, pid)) => (hex_part, Some(pid.parse::<u32>().map_err(|_| invalid())?)),
            None => (rest, None),
        };
        let hash: ObjectId = hex_part.parse().map_err(|_| invalid())?;
        let role = match (role_tag, pid) {
            ("index", None) => Role::Main,
            ("sharedindex", None) => Role::Base,
            ("watch", Some(pid)) => Role::WatchSidecar(pid),
            _ => return Err(invalid()),
        };
        Self::new(namespace, role, &hash)
    }

    pub fn as_str(&self) -> &str {
        &self.full
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn hash(&self) -> &ObjectId {
        &self.hash
    }
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl AsRef<str> for SegmentName {
    fn as_ref(&self) -> &str {
        &self.full
    }
}

pub(crate) fn validate_namespace(namespace: &str) -> Result<()> {
    let ok = namespace
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(IndexHelperError::InvalidName(namespace.to_string()))
    }
}

/// Bounds and character checks applied to every raw name.
pub(crate) fn check_len(name: &str) -> Result<()> {
    if name.len() > MAX_NAME_LEN {
        return Err(IndexHelperError::NameTooLong {
            name: name.to_string(),
            len: name.len(),
            max: MAX_NAME_LEN,
        });
    }
    if name.is_empty() || name.contains(['/', '\\', '\0']) {
        return Err(IndexHelperError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_name_format() {
        let hash = ObjectId::digest(b"abc");
        let name = SegmentName::new("git-", Role::Main, &hash).unwrap();
        assert_eq!(
            name.as_str(),
            "git-index-a9993e364706816aba3e25717850c26c9cd0d89d"
        );

        let base = SegmentName::new("git-", Role::Base, &hash).unwrap();
        assert!(base.as_str().starts_with("git-sharedindex-"));

        let sidecar = SegmentName::new("git-", Role::WatchSidecar(4242), &hash).unwrap();
        assert!(sidecar.as_str().ends_with("-4242"));
        assert!(sidecar.as_str().len() <= MAX_NAME_LEN);
    }

    #[test]
    fn test_name_too_long() {
        let hash = ObjectId::digest(b"abc");
        let ns = "n".repeat(40);
        assert!(matches!(
            SegmentName::new(&ns, Role::Main, &hash),
            Err(IndexHelperError::NameTooLong { .. })
        ));
    }

    #[test]
    fn test_bad_namespace() {
        let hash = ObjectId::digest(b"abc");
        assert!(SegmentName::new("a/b", Role::Main, &hash).is_err());
        assert!(SegmentName::new("Local\\", Role::Main, &hash).is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(SegmentName::parse("git-", "git-index-zz").is_err());
        assert!(SegmentName::parse("git-", "other-index-00").is_err());
        let hex = ObjectId::digest(b"x").to_hex();
        assert!(SegmentName::parse("git-", &format!("git-watch-{}", hex)).is_err());
        assert!(SegmentName::parse("git-", &format!("git-index-{}-12", hex)).is_err());
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Main.to_string(), "main");
        assert_eq!(Role::WatchSidecar(7).to_string(), "watch-sidecar[7]");
    }

    proptest! {
        #[test]
        fn prop_parse_inverts_new(bytes in any::<[u8; 20]>(), kind in 0u8..3, pid in any::<u32>()) {
            let hash = ObjectId::from_bytes(bytes);
            let role = match kind {
                0 => Role::Main,
                1 => Role::Base,
                _ => Role::WatchSidecar(pid),
            };
            let name = SegmentName::new("ih-", role, &hash).unwrap();
            let parsed = SegmentName::parse("ih-", name.as_str()).unwrap();
            prop_assert_eq!(parsed, name);
        }
    }
}
