//! The indexed set of entries behind a directory.

use crate::entry::EntryKernel;
use crate::error::{CoreError, CoreResult};
use crate::types::{Metahandle, SyncId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Directory-wide values persisted alongside the entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryInfo {
    /// Next metahandle to hand out.
    pub next_metahandle: i64,
    /// Opaque server cursor for "fetch updates since".
    pub download_cursor: u64,
    /// Whether a full download has completed at least once.
    pub initial_sync_ended: bool,
    /// Server store identity; a change means the server data was reset.
    pub store_birthday: Option<String>,
}

impl Default for DirectoryInfo {
    fn default() -> Self {
        Self {
            next_metahandle: Metahandle::ROOT.as_i64() + 1,
            download_cursor: 0,
            initial_sync_ended: false,
            store_birthday: None,
        }
    }
}

/// All entries of a directory with their secondary indexes.
///
/// Reads are available through any transaction; mutation is crate-private
/// and happens only inside a write transaction.
#[derive(Debug, Clone)]
pub struct EntryTable {
    entries: HashMap<Metahandle, EntryKernel>,
    ids: HashMap<SyncId, Metahandle>,
    tags: HashMap<String, Metahandle>,
    /// Parent id -> handles of entries that name it as parent (tombstones included).
    children: HashMap<SyncId, BTreeSet<Metahandle>>,
    info: DirectoryInfo,
}

impl EntryTable {
    /// Creates a table holding only the root.
    #[must_use]
    pub fn new() -> Self {
        let mut table = Self {
            entries: HashMap::new(),
            ids: HashMap::new(),
            tags: HashMap::new(),
            children: HashMap::new(),
            info: DirectoryInfo::default(),
        };
        table.index(&EntryKernel::root());
        table
            .entries
            .insert(Metahandle::ROOT, EntryKernel::root());
        table
    }

    /// Rebuilds a table from persisted parts.
    ///
    /// # Errors
    ///
    /// Fails if the root is missing or an id, tag or handle repeats.
    pub fn from_parts(info: DirectoryInfo, entries: Vec<EntryKernel>) -> CoreResult<Self> {
        let mut table = Self {
            entries: HashMap::with_capacity(entries.len()),
            ids: HashMap::with_capacity(entries.len()),
            tags: HashMap::new(),
            children: HashMap::new(),
            info,
        };
        for kernel in entries {
            table.insert(kernel)?;
        }
        match table.get(Metahandle::ROOT) {
            Some(root) if root.is_root() => {}
            _ => return Err(CoreError::invalid_format("snapshot has no root entry")),
        }
        let max_handle = table.entries.keys().map(|mh| mh.as_i64()).max().unwrap_or(1);
        if table.info.next_metahandle <= max_handle {
            table.info.next_metahandle = max_handle + 1;
        }
        Ok(table)
    }

    /// Looks up an entry by metahandle.
    #[must_use]
    pub fn get(&self, metahandle: Metahandle) -> Option<&EntryKernel> {
        self.entries.get(&metahandle)
    }

    /// Looks up an entry by server id.
    #[must_use]
    pub fn get_by_id(&self, id: &SyncId) -> Option<&EntryKernel> {
        self.ids.get(id).and_then(|mh| self.entries.get(mh))
    }

    /// Looks up an entry by unique tag.
    #[must_use]
    pub fn get_by_tag(&self, tag: &str) -> Option<&EntryKernel> {
        self.tags.get(tag).and_then(|mh| self.entries.get(mh))
    }

    /// Returns the root entry.
    #[must_use]
    pub fn root(&self) -> &EntryKernel {
        // The root is inserted on construction and never removed.
        &self.entries[&Metahandle::ROOT]
    }

    /// Maps a server id to its metahandle, or [`Metahandle::INVALID`].
    #[must_use]
    pub fn handle_for_id(&self, id: &SyncId) -> Metahandle {
        self.ids.get(id).copied().unwrap_or(Metahandle::INVALID)
    }

    /// Returns the id of the first live child of `parent_id`.
    #[must_use]
    pub fn first_child_id(&self, parent_id: &SyncId) -> Option<SyncId> {
        self.first_child_except(parent_id, Metahandle::INVALID)
    }

    /// Like [`first_child_id`](Self::first_child_id) but ignores `skip`,
    /// which may be momentarily unlinked while it is being moved.
    pub(crate) fn first_child_except(&self, parent_id: &SyncId, skip: Metahandle) -> Option<SyncId> {
        self.children.get(parent_id).and_then(|handles| {
            handles
                .iter()
                .filter(|mh| **mh != skip)
                .filter_map(|mh| self.entries.get(mh))
                .find(|e| e.is_live() && !e.is_root() && e.prev_id.is_none())
                .map(|e| e.id.clone())
        })
    }

    /// Returns the handles of the live children of `parent_id` in sibling order.
    #[must_use]
    pub fn child_handles(&self, parent_id: &SyncId) -> Vec<Metahandle> {
        let limit = self.children.get(parent_id).map_or(0, BTreeSet::len);
        let mut handles = Vec::new();
        let mut cursor = self.first_child_id(parent_id);
        while let Some(id) = cursor {
            if handles.len() > limit {
                break;
            }
            match self.get_by_id(&id) {
                Some(entry) => {
                    handles.push(entry.metahandle);
                    cursor = entry.next_id.clone();
                }
                None => break,
            }
        }
        handles
    }

    /// Number of ancestors between the entry and the root (root is 0).
    ///
    /// Tombstones keep their parent link, so this works for deleted entries.
    #[must_use]
    pub fn depth(&self, metahandle: Metahandle) -> usize {
        let mut depth = 0;
        let mut current = match self.get(metahandle) {
            Some(entry) => entry,
            None => return 0,
        };
        while !current.is_root() && depth <= self.entries.len() {
            match self.get_by_id(&current.parent_id) {
                Some(parent) => current = parent,
                None => break,
            }
            depth += 1;
        }
        depth
    }

    /// Returns true if `id` is `ancestor` or lies somewhere below it.
    #[must_use]
    pub fn is_descendant_or_self(&self, id: &SyncId, ancestor: &SyncId) -> bool {
        let mut current = id.clone();
        for _ in 0..=self.entries.len() {
            if &current == ancestor {
                return true;
            }
            if current.is_root() {
                return false;
            }
            match self.get_by_id(&current) {
                Some(entry) => current = entry.parent_id.clone(),
                None => return false,
            }
        }
        // A parent loop already exists; treat it as a cycle.
        true
    }

    /// Iterates over all entries in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &EntryKernel> {
        self.entries.values()
    }

    /// Handles of all entries waiting to be committed.
    #[must_use]
    pub fn unsynced_handles(&self) -> Vec<Metahandle> {
        let mut handles: Vec<_> = self
            .entries
            .values()
            .filter(|e| e.is_unsynced)
            .map(|e| e.metahandle)
            .collect();
        handles.sort();
        handles
    }

    /// Total number of entries, tombstones and root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false once constructed, since the root is never removed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Directory-wide values.
    #[must_use]
    pub fn info(&self) -> &DirectoryInfo {
        &self.info
    }

    pub(crate) fn info_mut(&mut self) -> &mut DirectoryInfo {
        &mut self.info
    }

    pub(crate) fn allocate_metahandle(&mut self) -> Metahandle {
        let mh = Metahandle::new(self.info.next_metahandle);
        self.info.next_metahandle += 1;
        mh
    }

    /// Adds a new entry.
    pub(crate) fn insert(&mut self, kernel: EntryKernel) -> CoreResult<()> {
        if self.entries.contains_key(&kernel.metahandle) {
            return Err(CoreError::invalid_operation(format!(
                "metahandle {} already in use",
                kernel.metahandle
            )));
        }
        if self.ids.contains_key(&kernel.id) {
            return Err(CoreError::DuplicateId(kernel.id));
        }
        if let Some(tag) = &kernel.unique_tag {
            if self.tags.contains_key(tag) {
                return Err(CoreError::DuplicateTag(tag.clone()));
            }
        }
        self.index(&kernel);
        self.entries.insert(kernel.metahandle, kernel);
        Ok(())
    }

    /// Replaces an existing entry, keeping the indexes in step.
    pub(crate) fn replace(&mut self, kernel: EntryKernel) -> CoreResult<()> {
        let old = self
            .entries
            .get(&kernel.metahandle)
            .ok_or(CoreError::EntryNotFound(kernel.metahandle))?;
        if old.id != kernel.id && self.ids.contains_key(&kernel.id) {
            return Err(CoreError::DuplicateId(kernel.id));
        }
        if old.unique_tag != kernel.unique_tag {
            if let Some(tag) = &kernel.unique_tag {
                if self.tags.contains_key(tag) {
                    return Err(CoreError::DuplicateTag(tag.clone()));
                }
            }
        }
        let old = old.clone();
        self.unindex(&old);
        self.index(&kernel);
        self.entries.insert(kernel.metahandle, kernel);
        Ok(())
    }

    /// Puts an entry back to a recorded state without any checks.
    ///
    /// `None` removes the entry. Used by rollback, where the recorded states
    /// were consistent when taken.
    pub(crate) fn restore(&mut self, metahandle: Metahandle, original: Option<EntryKernel>) {
        if let Some(current) = self.entries.remove(&metahandle) {
            self.unindex(&current);
        }
        if let Some(kernel) = original {
            self.index(&kernel);
            self.entries.insert(metahandle, kernel);
        }
    }

    pub(crate) fn set_info(&mut self, info: DirectoryInfo) {
        self.info = info;
    }

    fn index(&mut self, kernel: &EntryKernel) {
        self.ids.insert(kernel.id.clone(), kernel.metahandle);
        if let Some(tag) = &kernel.unique_tag {
            self.tags.insert(tag.clone(), kernel.metahandle);
        }
        if !kernel.is_root() {
            self.children
                .entry(kernel.parent_id.clone())
                .or_default()
                .insert(kernel.metahandle);
        }
    }

    fn unindex(&mut self, kernel: &EntryKernel) {
        self.ids.remove(&kernel.id);
        if let Some(tag) = &kernel.unique_tag {
            self.tags.remove(tag);
        }
        if let Some(siblings) = self.children.get_mut(&kernel.parent_id) {
            siblings.remove(&kernel.metahandle);
            if siblings.is_empty() {
                self.children.remove(&kernel.parent_id);
            }
        }
    }
}

impl Default for EntryTable {
    fn default() -> Self {
        Self::new()
    }
}
