//! The stored form of an entry.

use crate::ordinal::Ordinal;
use crate::types::{Metahandle, SyncId};
use serde::{Deserialize, Serialize};

/// All fields of one entry, as stored in the directory.
///
/// Siblings form a doubly linked list through `prev_id` / `next_id`; `None`
/// marks either end. Tombstoned entries (`is_del`) are unlinked from their
/// sibling list but stay in the handle and id indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryKernel {
    /// Immutable local handle.
    pub metahandle: Metahandle,
    /// Server id.
    pub id: SyncId,
    /// Server id of the parent. The root is its own parent.
    pub parent_id: SyncId,
    /// Previous sibling.
    pub prev_id: Option<SyncId>,
    /// Next sibling.
    pub next_id: Option<SyncId>,
    /// Server-defined tag for well-known entries.
    pub unique_tag: Option<String>,
    /// Name in server form (see [`crate::entry::sync_api_name_to_server_name`]).
    pub name: String,
    /// Folder or leaf.
    pub is_dir: bool,
    /// Whether this entry belongs to the synchronized domain model.
    pub is_domain_object: bool,
    /// Tombstone.
    pub is_del: bool,
    /// Needs to be committed to the server.
    pub is_unsynced: bool,
    /// Opaque payload: URL.
    pub url: String,
    /// Opaque payload: favicon bytes.
    pub favicon: Vec<u8>,
    /// Id in a separate local-only data model.
    pub external_id: i64,
    /// Server version this entry was last based on.
    pub base_version: i64,
    /// Latest version seen from the server.
    pub server_version: i64,
    /// Position among siblings in the newer ordinal scheme.
    pub ordinal: Option<Ordinal>,
}

impl EntryKernel {
    /// Creates a kernel with default field values.
    #[must_use]
    pub fn new(metahandle: Metahandle, id: SyncId, parent_id: SyncId) -> Self {
        Self {
            metahandle,
            id,
            parent_id,
            prev_id: None,
            next_id: None,
            unique_tag: None,
            name: String::new(),
            is_dir: false,
            is_domain_object: false,
            is_del: false,
            is_unsynced: false,
            url: String::new(),
            favicon: Vec::new(),
            external_id: 0,
            base_version: 0,
            server_version: 0,
            ordinal: None,
        }
    }

    /// Creates the root entry.
    #[must_use]
    pub fn root() -> Self {
        let mut root = Self::new(Metahandle::ROOT, SyncId::root(), SyncId::root());
        root.is_dir = true;
        root
    }

    /// Returns true for the root entry.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.id.is_root()
    }

    /// Returns true if the entry is not tombstoned.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.is_del
    }

    /// Returns true if the parent or the next sibling differ.
    ///
    /// An entry's index can change without its `next_id` changing when its
    /// successor also moved. Callers treat a position change on any sibling as
    /// a change for all of them.
    #[must_use]
    pub fn position_differs(&self, other: &EntryKernel) -> bool {
        self.next_id != other.next_id || self.parent_id != other.parent_id
    }

    /// Returns true if any field visible to observers differs.
    #[must_use]
    pub fn observed_fields_differ(&self, other: &EntryKernel) -> bool {
        self.name != other.name
            || self.is_dir != other.is_dir
            || self.url != other.url
            || self.favicon != other.favicon
            || self.position_differs(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel(mh: i64, id: &str) -> EntryKernel {
        EntryKernel::new(Metahandle::new(mh), SyncId::from(id), SyncId::root())
    }

    #[test]
    fn root_is_dir_and_self_parented() {
        let root = EntryKernel::root();
        assert!(root.is_root());
        assert!(root.is_dir);
        assert_eq!(root.parent_id, root.id);
        assert_eq!(root.metahandle, Metahandle::ROOT);
    }

    #[test]
    fn observed_fields() {
        let a = kernel(2, "c1");
        let mut b = a.clone();
        b.is_unsynced = true;
        b.external_id = 99;
        b.base_version = 4;
        assert!(!a.observed_fields_differ(&b));

        b.url = "http://example.com/".into();
        assert!(a.observed_fields_differ(&b));
        assert!(!a.position_differs(&b));
    }

    #[test]
    fn position_differs_on_next_or_parent() {
        let a = kernel(2, "c1");
        let mut b = a.clone();
        b.prev_id = Some(SyncId::from("c0"));
        assert!(!a.position_differs(&b));
        b.next_id = Some(SyncId::from("c9"));
        assert!(a.position_differs(&b));

        let mut c = a.clone();
        c.parent_id = SyncId::from("c5");
        assert!(a.position_differs(&c));
    }
}
