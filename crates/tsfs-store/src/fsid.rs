//! Hierarchical identifiers for stored series and blobs.

use core::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Longest accepted textual id, in bytes. Bounds the size of B-tree pages.
pub const MAX_FSID_LEN: usize = 512;

/// Identifier of one logical series or blob, e.g. `/pdc/SapFlux/1234`.
///
/// The path (everything before the last `/`) names the series family and
/// the name is the final component. Ordering is by path, then name, so ids
/// of one family are adjacent in the index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FsId {
    path: String,
    name: String,
}

impl FsId {
    /// Creates an id from a path such as `/pdc/SapFlux` and a name.
    pub fn new(path: &str, name: &str) -> StoreResult<Self> {
        Self::parse(&format!("{}/{}", path.trim_end_matches('/'), name))
    }

    /// Parses the full textual form `/path/.../name`.
    pub fn parse(s: &str) -> StoreResult<Self> {
        let invalid = |reason: &str| StoreError::InvalidFsId {
            id: s.to_string(),
            reason: reason.to_string(),
        };

        if s.len() > MAX_FSID_LEN {
            return Err(invalid("id too long"));
        }
        if !s.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }
        if let Some(c) = s.chars().find(|c| c.is_whitespace() || c.is_control()) {
            return Err(invalid(&format!("illegal character {:?}", c)));
        }
        let split = s.rfind('/').unwrap_or(0);
        if split == 0 {
            return Err(invalid("needs a path and a name"));
        }
        let path = &s[..split];
        let name = &s[split + 1..];
        if name.is_empty() {
            return Err(invalid("empty name"));
        }
        if path[1..].split('/').any(|c| c.is_empty()) {
            return Err(invalid("empty path component"));
        }

        Ok(Self {
            path: path.to_string(),
            name: name.to_string(),
        })
    }

    /// The series family, e.g. `/pdc/SapFlux`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The final component.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if this id lives under `prefix` (a path, with or without
    /// a trailing slash).
    pub fn is_under(&self, prefix: &str) -> bool {
        let prefix = prefix.trim_end_matches('/');
        self.path == prefix
            || self
                .path
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

impl fmt::Display for FsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.path, self.name)
    }
}

impl FromStr for FsId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_path_and_name() {
        let id = FsId::parse("/pdc/SapFlux/1234").unwrap();
        assert_eq!(id.path(), "/pdc/SapFlux");
        assert_eq!(id.name(), "1234");
        assert_eq!(id.to_string(), "/pdc/SapFlux/1234");
    }

    #[test]
    fn test_new_matches_parse() {
        let a = FsId::new("/cal/pixels/", "7").unwrap();
        let b: FsId = "/cal/pixels/7".parse().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_bad_ids() {
        for bad in ["", "noslash", "/onlyname", "/a//b", "/a/b/", "/a/b c", "/a/\tb"] {
            assert!(
                matches!(FsId::parse(bad), Err(StoreError::InvalidFsId { .. })),
                "accepted {:?}",
                bad
            );
        }
        let long = format!("/a/{}", "x".repeat(MAX_FSID_LEN));
        assert!(FsId::parse(&long).is_err());
    }

    #[test]
    fn test_ordering_groups_by_path() {
        let a = FsId::parse("/a/z").unwrap();
        let b = FsId::parse("/a/b/a").unwrap();
        let c = FsId::parse("/b/a").unwrap();
        // path "/a" sorts before "/a/b"
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_is_under() {
        let id = FsId::parse("/pdc/SapFlux/1").unwrap();
        assert!(id.is_under("/pdc"));
        assert!(id.is_under("/pdc/"));
        assert!(id.is_under("/pdc/SapFlux"));
        assert!(!id.is_under("/pd"));
        assert!(!id.is_under("/pdc/Sap"));
    }
}
