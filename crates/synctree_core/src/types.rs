//! Core type definitions for synctree.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Local handle of an entry.
///
/// Metahandles are assigned once when an entry is created, are dense and
/// monotonically increasing, and are never reused while the directory
/// lives. They never leave the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Metahandle(pub i64);

impl Metahandle {
    /// The handle returned by lookups that find nothing.
    pub const INVALID: Metahandle = Metahandle(0);

    /// The handle of the root entry.
    pub const ROOT: Metahandle = Metahandle(1);

    /// Creates a metahandle from its raw value.
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw handle value.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Returns true unless this is [`Metahandle::INVALID`].
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Display for Metahandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mh:{}", self.0)
    }
}

/// Server-side identifier of an entry.
///
/// Stable across commits and used to match an entry with the remote copy.
/// The root is `"r"`; ids minted on this client start with `"c"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SyncId(String);

impl SyncId {
    const ROOT: &'static str = "r";

    /// The id of the root entry.
    #[must_use]
    pub fn root() -> Self {
        Self(Self::ROOT.to_owned())
    }

    /// Mints a fresh client-side id.
    #[must_use]
    pub fn new_local() -> Self {
        Self(format!("c{}", Uuid::new_v4().simple()))
    }

    /// Returns true for the root id.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0 == Self::ROOT
    }

    /// Returns true for ids minted on this client.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.0.starts_with('c')
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SyncId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for SyncId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies who opened a write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriterTag {
    /// The local API (user edits).
    SyncApi,
    /// The sync loop applying server state.
    Syncer,
    /// Tests and tooling.
    Unittest,
}

impl fmt::Display for WriterTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriterTag::SyncApi => "syncapi",
            WriterTag::Syncer => "syncer",
            WriterTag::Unittest => "unittest",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metahandle_validity() {
        assert!(!Metahandle::INVALID.is_valid());
        assert!(Metahandle::ROOT.is_valid());
        assert!(Metahandle::new(2) > Metahandle::ROOT);
    }

    #[test]
    fn local_ids_are_unique() {
        let a = SyncId::new_local();
        let b = SyncId::new_local();
        assert_ne!(a, b);
        assert!(a.is_local());
        assert!(!a.is_root());
        assert!(SyncId::root().is_root());
    }

    #[test]
    fn writer_display() {
        assert_eq!(WriterTag::Syncer.to_string(), "syncer");
        assert_eq!(format!("{}", Metahandle::new(3)), "mh:3");
    }
}
