//! Node identity and its wire encoding.
//!
//! Every inserted character is named by the pair `(site, clock)`.
//! On the wire the pair is written as:
//!
//! ```text
//! {site_len}:{site}-{clock}
//!     │        │      └── logical clock of the inserting buffer
//!     │        └───────── site string, copied verbatim
//!     └────────────────── byte length of the site string
//! ```
//!
//! The length prefix keeps the encoding unambiguous when a site itself
//! contains `-` or `:` (session-derived site ids routinely do).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Globally unique identity of one inserted character.
///
/// Equality, hashing and ordering only look at `(site, clock)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub site: String,
    pub clock: u64,
}

impl NodeId {
    pub fn new(site: impl Into<String>, clock: u64) -> Self {
        Self {
            site: site.into(),
            clock,
        }
    }

    /// The ROOT sentinel every document hangs off.
    ///
    /// Real nodes never use the empty site, so the sentinel cannot collide.
    pub fn root() -> Self {
        Self {
            site: String::new(),
            clock: 0,
        }
    }

    pub fn is_root(&self) -> bool {
        self.site.is_empty() && self.clock == 0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::root()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.site.len(), self.site, self.clock)
    }
}

/// Failure to decode a wire identity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdParseError {
    #[error("node id {0:?} has no length prefix")]
    MissingLength(String),
    #[error("node id {0:?} has an invalid length prefix")]
    InvalidLength(String),
    #[error("node id {id:?} is shorter than its declared site length {len}")]
    Truncated { id: String, len: usize },
    #[error("node id {0:?} has no clock separator")]
    MissingSeparator(String),
    #[error("node id {0:?} has an invalid clock")]
    InvalidClock(String),
}

impl FromStr for NodeId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (len, rest) = s
            .split_once(':')
            .ok_or_else(|| IdParseError::MissingLength(s.to_string()))?;
        if len.is_empty() || !len.bytes().all(|b| b.is_ascii_digit()) {
            return Err(IdParseError::InvalidLength(s.to_string()));
        }
        let len: usize = len
            .parse()
            .map_err(|_| IdParseError::InvalidLength(s.to_string()))?;

        if rest.len() < len || !rest.is_char_boundary(len) {
            return Err(IdParseError::Truncated {
                id: s.to_string(),
                len,
            });
        }
        let (site, tail) = rest.split_at(len);

        let clock = tail
            .strip_prefix('-')
            .ok_or_else(|| IdParseError::MissingSeparator(s.to_string()))?;
        if clock.is_empty() || !clock.bytes().all(|b| b.is_ascii_digit()) {
            return Err(IdParseError::InvalidClock(s.to_string()));
        }
        let clock = clock
            .parse()
            .map_err(|_| IdParseError::InvalidClock(s.to_string()))?;

        Ok(Self::new(site, clock))
    }
}

// Ids travel in their string form so a malformed one surfaces as a
// per-message decode error on the receiving side.
impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_length_prefixed() {
        assert_eq!(NodeId::new("site1", 3).to_string(), "5:site1-3");
        assert_eq!(NodeId::root().to_string(), "0:-0");
    }

    #[test]
    fn test_parse_site_containing_delimiters() {
        let id = NodeId::new("abc-edit:7-x", 42);
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.site, "abc-edit:7-x");
        assert_eq!(parsed.clock, 42);
    }

    #[test]
    fn test_parse_multibyte_site() {
        let id = NodeId::new("ünï-cødé", 9);
        assert_eq!(id.to_string().parse::<NodeId>().unwrap(), id);
    }

    #[test]
    fn test_parse_root() {
        let root: NodeId = "0:-0".parse().unwrap();
        assert!(root.is_root());
    }

    #[test]
    fn test_parse_rejects_legacy_format() {
        // The old "site-clock" form is ambiguous and no longer accepted.
        assert!(matches!(
            "site1-3".parse::<NodeId>(),
            Err(IdParseError::MissingLength(_))
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!("x:ab-1".parse::<NodeId>(), Err(IdParseError::InvalidLength(_))));
        assert!(matches!("+2:ab-1".parse::<NodeId>(), Err(IdParseError::InvalidLength(_))));
        assert!(matches!("9:ab-1".parse::<NodeId>(), Err(IdParseError::Truncated { len: 9, .. })));
        assert!(matches!("2:ab1".parse::<NodeId>(), Err(IdParseError::MissingSeparator(_))));
        assert!(matches!("2:ab-".parse::<NodeId>(), Err(IdParseError::InvalidClock(_))));
        assert!(matches!("2:ab--1".parse::<NodeId>(), Err(IdParseError::InvalidClock(_))));
        // Cutting a multi-byte character in half is a truncation, not a panic.
        assert!(matches!("1:é-1".parse::<NodeId>(), Err(IdParseError::Truncated { .. })));
    }

    #[test]
    fn test_serde_uses_wire_string() {
        let id = NodeId::new("a-b", 7);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"3:a-b-7\"");
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<NodeId>("\"garbage\"").is_err());
    }

    #[test]
    fn test_equality_is_identity_only() {
        assert_eq!(NodeId::new("s", 1), NodeId::new("s".to_string(), 1));
        assert_ne!(NodeId::new("s", 1), NodeId::new("s", 2));
        assert_ne!(NodeId::new("s", 1), NodeId::new("t", 1));
    }
}
