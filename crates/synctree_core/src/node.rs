//! Node-level API for application code.
//!
//! Nodes are what the rest of the application sees: titles in their
//! user-facing form, positions expressed as metahandles, and write helpers
//! that mark every sync-visible change for commit.

use crate::entry::{
    server_name_to_sync_api_name, sync_api_name_to_server_name, EntryKernel, EntryTable,
    DEFAULT_NAME_FOR_NEW_NODES,
};
use crate::error::{CoreError, CoreResult};
use crate::transaction::{BaseTransaction, WriteTransaction};
use crate::types::{Metahandle, SyncId};
use tracing::warn;

/// A read-only view of one live entry.
#[derive(Debug, Clone, Copy)]
pub struct ReadNode<'t> {
    kernel: &'t EntryKernel,
    table: &'t EntryTable,
}

impl<'t> ReadNode<'t> {
    /// The root node.
    pub fn root<T: BaseTransaction>(tx: &'t T) -> Self {
        let table = tx.table();
        Self {
            kernel: table.root(),
            table,
        }
    }

    /// Looks up a live node by metahandle.
    ///
    /// # Errors
    ///
    /// `EntryNotFound` if there is no such entry or it is tombstoned.
    pub fn by_id<T: BaseTransaction>(tx: &'t T, metahandle: Metahandle) -> CoreResult<Self> {
        Self::in_table(tx.table(), metahandle)
    }

    /// Looks up a live node by its server-defined tag.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` for an empty tag, `EntryNotFound` if no live entry
    /// carries it.
    pub fn by_tag<T: BaseTransaction>(tx: &'t T, tag: &str) -> CoreResult<Self> {
        if tag.is_empty() {
            return Err(CoreError::invalid_operation("empty tag lookup"));
        }
        let table = tx.table();
        let kernel = table
            .get_by_tag(tag)
            .filter(|k| k.is_live())
            .ok_or(CoreError::EntryNotFound(Metahandle::INVALID))?;
        if !kernel.is_domain_object {
            warn!(tag, metahandle = %kernel.metahandle, "tag lookup found a non-domain entry");
        }
        Ok(Self { kernel, table })
    }

    fn in_table(table: &'t EntryTable, metahandle: Metahandle) -> CoreResult<Self> {
        let kernel = table
            .get(metahandle)
            .filter(|k| k.is_live())
            .ok_or(CoreError::EntryNotFound(metahandle))?;
        Ok(Self { kernel, table })
    }

    /// The stored entry behind this node.
    #[must_use]
    pub fn kernel(&self) -> &'t EntryKernel {
        self.kernel
    }

    /// The node's metahandle.
    #[must_use]
    pub fn id(&self) -> Metahandle {
        self.kernel.metahandle
    }

    /// The node's server id.
    #[must_use]
    pub fn sync_id(&self) -> &'t SyncId {
        &self.kernel.id
    }

    /// Metahandle of the parent. The root is its own parent.
    #[must_use]
    pub fn parent_id(&self) -> Metahandle {
        self.table.handle_for_id(&self.kernel.parent_id)
    }

    /// Whether this node is a folder.
    #[must_use]
    pub fn is_folder(&self) -> bool {
        self.kernel.is_dir
    }

    /// The title as the user entered it.
    #[must_use]
    pub fn title(&self) -> String {
        server_name_to_sync_api_name(&self.kernel.name)
    }

    /// The URL payload.
    #[must_use]
    pub fn url(&self) -> &'t str {
        &self.kernel.url
    }

    /// The favicon payload.
    #[must_use]
    pub fn favicon_bytes(&self) -> &'t [u8] {
        &self.kernel.favicon
    }

    /// The id in the local-only data model.
    #[must_use]
    pub fn external_id(&self) -> i64 {
        self.kernel.external_id
    }

    /// Previous sibling, or [`Metahandle::INVALID`].
    #[must_use]
    pub fn predecessor_id(&self) -> Metahandle {
        self.handle_of(self.kernel.prev_id.as_ref())
    }

    /// Next sibling, or [`Metahandle::INVALID`].
    #[must_use]
    pub fn successor_id(&self) -> Metahandle {
        self.handle_of(self.kernel.next_id.as_ref())
    }

    /// First live child, or [`Metahandle::INVALID`].
    #[must_use]
    pub fn first_child_id(&self) -> Metahandle {
        self.handle_of(self.table.first_child_id(&self.kernel.id).as_ref())
    }

    /// Live children in sibling order.
    #[must_use]
    pub fn child_ids(&self) -> Vec<Metahandle> {
        self.table.child_handles(&self.kernel.id)
    }

    fn handle_of(&self, id: Option<&SyncId>) -> Metahandle {
        id.map_or(Metahandle::INVALID, |id| self.table.handle_for_id(id))
    }
}

/// A live entry opened for local modification.
///
/// Every setter skips values that are already in place, and every
/// sync-visible change marks the entry for commit.
#[derive(Debug)]
pub struct WriteNode<'t, 'a> {
    wtx: &'t mut WriteTransaction<'a>,
    metahandle: Metahandle,
}

impl<'t, 'a> WriteNode<'t, 'a> {
    /// Opens an existing live node.
    pub fn init_by_id(wtx: &'t mut WriteTransaction<'a>, metahandle: Metahandle) -> CoreResult<Self> {
        match wtx.entry(metahandle).map(|k| (k.is_root(), k.is_live())) {
            Some((true, _)) => Err(CoreError::RootImmutable),
            Some((false, true)) => Ok(Self { wtx, metahandle }),
            _ => Err(CoreError::EntryNotFound(metahandle)),
        }
    }

    /// Creates a new folder under `parent`, placed after `predecessor` or
    /// first when `None`.
    ///
    /// The new node is a domain object named with the placeholder title; the
    /// caller is expected to set its title and folder flag.
    pub fn init_by_creation(
        wtx: &'t mut WriteTransaction<'a>,
        parent: Metahandle,
        predecessor: Option<Metahandle>,
    ) -> CoreResult<Self> {
        let parent_id = match wtx.entry(parent) {
            Some(k) if k.is_live() && k.is_dir => k.id.clone(),
            Some(_) => {
                return Err(CoreError::invalid_operation(format!(
                    "parent {parent} is not a live folder"
                )))
            }
            None => return Err(CoreError::EntryNotFound(parent)),
        };
        let predecessor_id = match predecessor {
            Some(pred) => Some(child_id_of(&*wtx, pred, &parent_id)?),
            None => None,
        };

        let metahandle = wtx.create(&parent_id, DEFAULT_NAME_FOR_NEW_NODES)?;
        {
            let mut entry = wtx.entry_mut(metahandle)?;
            entry.put_is_dir(true)?;
            entry.put_is_domain_object(true)?;
            entry.put_predecessor(predecessor_id.as_ref())?;
            entry.put_is_unsynced(true)?;
        }
        Ok(Self { wtx, metahandle })
    }

    /// The node's metahandle.
    #[must_use]
    pub fn id(&self) -> Metahandle {
        self.metahandle
    }

    /// A read view of the node's current state.
    pub fn read(&self) -> CoreResult<ReadNode<'_>> {
        ReadNode::by_id(&*self.wtx, self.metahandle)
    }

    /// Sets the folder flag.
    pub fn set_is_folder(&mut self, is_folder: bool) -> CoreResult<()> {
        let changed = self.wtx.entry_mut(self.metahandle)?.put_is_dir(is_folder)?;
        self.mark_for_syncing_if(changed)
    }

    /// Sets the title, translating it to a server-legal name.
    pub fn set_title(&mut self, title: &str) -> CoreResult<()> {
        let server_name = sync_api_name_to_server_name(title);
        let changed = self.wtx.entry_mut(self.metahandle)?.put_name(&server_name)?;
        self.mark_for_syncing_if(changed)
    }

    /// Sets the URL.
    pub fn set_url(&mut self, url: &str) -> CoreResult<()> {
        let changed = self.wtx.entry_mut(self.metahandle)?.put_url(url)?;
        self.mark_for_syncing_if(changed)
    }

    /// Sets the favicon bytes.
    pub fn set_favicon_bytes(&mut self, favicon: &[u8]) -> CoreResult<()> {
        let changed = self.wtx.entry_mut(self.metahandle)?.put_favicon(favicon)?;
        self.mark_for_syncing_if(changed)
    }

    /// Sets the local-only external id. Not sync-visible, so never marks.
    pub fn set_external_id(&mut self, external_id: i64) -> CoreResult<()> {
        self.wtx
            .entry_mut(self.metahandle)?
            .put_external_id(external_id)?;
        Ok(())
    }

    /// Moves the node under `new_parent`, after `predecessor` (or first).
    ///
    /// Returns false without touching anything when the node is already
    /// there. Moving a node under itself or a descendant fails and dooms
    /// the transaction.
    pub fn set_position(
        &mut self,
        new_parent: Metahandle,
        predecessor: Option<Metahandle>,
    ) -> CoreResult<bool> {
        let parent_id = self
            .wtx
            .entry(new_parent)
            .filter(|k| k.is_live())
            .map(|k| k.id.clone())
            .ok_or(CoreError::EntryNotFound(new_parent))?;
        let predecessor_id = match predecessor {
            Some(pred) => Some(child_id_of(&*self.wtx, pred, &parent_id)?),
            None => None,
        };

        let current = self
            .wtx
            .entry(self.metahandle)
            .ok_or(CoreError::EntryNotFound(self.metahandle))?;
        if current.parent_id == parent_id && current.prev_id == predecessor_id {
            return Ok(false);
        }

        let mut entry = self.wtx.entry_mut(self.metahandle)?;
        entry.put_parent_id(&parent_id)?;
        entry.put_predecessor(predecessor_id.as_ref())?;
        self.mark_for_syncing_if(true)?;
        Ok(true)
    }

    /// Tombstones the node and takes it out of its sibling list.
    pub fn remove(&mut self) -> CoreResult<()> {
        let changed = self.wtx.entry_mut(self.metahandle)?.put_is_del(true)?;
        self.mark_for_syncing_if(changed)
    }

    fn mark_for_syncing_if(&mut self, changed: bool) -> CoreResult<()> {
        if changed {
            self.wtx
                .entry_mut(self.metahandle)?
                .put_is_unsynced(true)?;
        }
        Ok(())
    }
}

/// Resolves `child` to its server id, checking it is a live child of `parent_id`.
fn child_id_of<T: BaseTransaction>(tx: &T, child: Metahandle, parent_id: &SyncId) -> CoreResult<SyncId> {
    match tx.entry(child) {
        Some(k) if k.is_live() && &k.parent_id == parent_id && !k.is_root() => Ok(k.id.clone()),
        Some(k) => Err(CoreError::InvalidPredecessor {
            parent: parent_id.clone(),
            predecessor: k.id.clone(),
        }),
        None => Err(CoreError::EntryNotFound(child)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Directory;
    use crate::types::WriterTag;

    fn create_dir() -> Directory {
        Directory::open_in_memory("nodes@example.com").unwrap()
    }

    fn make_folder(wtx: &mut WriteTransaction<'_>, parent: Metahandle, title: &str) -> Metahandle {
        let mut node = WriteNode::init_by_creation(wtx, parent, None).unwrap();
        node.set_title(title).unwrap();
        node.id()
    }

    #[test]
    fn first_child_follows_tombstone() {
        let dir = create_dir();
        let (a, b) = dir
            .write(WriterTag::Unittest, |wtx| {
                let a = make_folder(wtx, Metahandle::ROOT, "Folder");
                let b = make_folder(wtx, a, "Child");
                Ok((a, b))
            })
            .unwrap();

        {
            let rtx = dir.read().unwrap();
            assert_eq!(ReadNode::by_id(&rtx, a).unwrap().first_child_id(), b);
        }

        dir.write(WriterTag::Unittest, |wtx| WriteNode::init_by_id(wtx, b)?.remove())
            .unwrap();

        let rtx = dir.read().unwrap();
        assert_eq!(
            ReadNode::by_id(&rtx, a).unwrap().first_child_id(),
            Metahandle::INVALID
        );
        assert!(ReadNode::by_id(&rtx, b).is_err());
        // Still reachable by handle for conflict handling.
        assert!(rtx.entry(b).unwrap().is_del);
    }

    #[test]
    fn creation_defaults() {
        let dir = create_dir();
        let mh = dir
            .write(WriterTag::Unittest, |wtx| {
                Ok(WriteNode::init_by_creation(wtx, Metahandle::ROOT, None)?.id())
            })
            .unwrap();
        let rtx = dir.read().unwrap();
        let node = ReadNode::by_id(&rtx, mh).unwrap();
        assert!(node.is_folder());
        assert!(node.kernel().is_domain_object);
        assert!(node.kernel().is_unsynced);
        assert_eq!(node.kernel().name, " ");
        assert_eq!(node.parent_id(), Metahandle::ROOT);
    }

    #[test]
    fn sibling_order_respects_predecessor() {
        let dir = create_dir();
        let (x, y, z) = dir
            .write(WriterTag::Unittest, |wtx| {
                let x = make_folder(wtx, Metahandle::ROOT, "x");
                let z = WriteNode::init_by_creation(wtx, Metahandle::ROOT, Some(x))?.id();
                let y = WriteNode::init_by_creation(wtx, Metahandle::ROOT, Some(x))?.id();
                Ok((x, y, z))
            })
            .unwrap();

        let rtx = dir.read().unwrap();
        let root = ReadNode::root(&rtx);
        assert_eq!(root.child_ids(), vec![x, y, z]);
        let middle = ReadNode::by_id(&rtx, y).unwrap();
        assert_eq!(middle.predecessor_id(), x);
        assert_eq!(middle.successor_id(), z);
        assert_eq!(ReadNode::by_id(&rtx, x).unwrap().predecessor_id(), Metahandle::INVALID);
    }

    #[test]
    fn reserved_titles_round_trip() {
        let dir = create_dir();
        let mh = dir
            .write(WriterTag::Unittest, |wtx| Ok(make_folder(wtx, Metahandle::ROOT, "..")))
            .unwrap();
        let rtx = dir.read().unwrap();
        let node = ReadNode::by_id(&rtx, mh).unwrap();
        assert_eq!(node.kernel().name, ".. ");
        assert_eq!(node.title(), "..");
    }

    #[test]
    fn redundant_set_does_not_dirty() {
        let dir = create_dir();
        let mh = dir
            .write(WriterTag::Unittest, |wtx| {
                let mh = make_folder(wtx, Metahandle::ROOT, "Same");
                wtx.entry_mut(mh)?.clear_unsynced()?;
                Ok(mh)
            })
            .unwrap();

        dir.write(WriterTag::Unittest, |wtx| {
            let mut node = WriteNode::init_by_id(wtx, mh)?;
            node.set_title("Same")?;
            node.set_external_id(42)?;
            Ok(())
        })
        .unwrap();

        let rtx = dir.read().unwrap();
        let node = ReadNode::by_id(&rtx, mh).unwrap();
        assert!(!node.kernel().is_unsynced);
        assert_eq!(node.external_id(), 42);
    }

    #[test]
    fn set_position_same_place_is_noop() {
        let dir = create_dir();
        let mh = dir
            .write(WriterTag::Unittest, |wtx| Ok(make_folder(wtx, Metahandle::ROOT, "a")))
            .unwrap();
        let moved = dir
            .write(WriterTag::Unittest, |wtx| {
                WriteNode::init_by_id(wtx, mh)?.set_position(Metahandle::ROOT, None)
            })
            .unwrap();
        assert!(!moved);
    }

    #[test]
    fn tag_lookup() {
        let dir = create_dir();
        let mh = dir
            .write(WriterTag::Syncer, |wtx| {
                let mh = make_folder(wtx, Metahandle::ROOT, "Bookmark Bar");
                wtx.entry_mut(mh)?
                    .put_unique_tag(Some("bookmark_bar".to_owned()))?;
                Ok(mh)
            })
            .unwrap();

        let rtx = dir.read().unwrap();
        assert_eq!(ReadNode::by_tag(&rtx, "bookmark_bar").unwrap().id(), mh);
        assert!(ReadNode::by_tag(&rtx, "").is_err());
        assert!(ReadNode::by_tag(&rtx, "other").is_err());
    }

    #[test]
    fn root_cannot_be_opened_for_write() {
        let dir = create_dir();
        let result = dir.write(WriterTag::Unittest, |wtx| {
            WriteNode::init_by_id(wtx, Metahandle::ROOT).map(|_| ())
        });
        assert!(matches!(result, Err(CoreError::RootImmutable)));
    }
}
