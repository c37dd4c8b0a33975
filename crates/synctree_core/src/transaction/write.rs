//! Write transactions.

use crate::change_event::CalculateChangesEvent;
use crate::directory::Directory;
use crate::entry::{DirectoryInfo, EntryKernel, EntryTable};
use crate::error::{CoreError, CoreResult};
use crate::transaction::{BaseTransaction, MutableEntry};
use crate::types::{Metahandle, SyncId, WriterTag};
use parking_lot::RwLockWriteGuard;
use std::collections::BTreeMap;
use tracing::{debug, error, warn};

/// Exclusive, mutating access to a directory.
///
/// The first time an entry is touched its current state is recorded. On
/// commit the entries that really differ from their recorded state are
/// handed to the directory's change listener; on abort they are put back.
///
/// Dropping an active transaction commits it, unless the thread is
/// unwinding from a panic, in which case it rolls back.
///
/// A failed mutation that would break a tree invariant (a cycle, a root
/// change, a duplicate id or tag, a bad predecessor) poisons the
/// transaction: it can no longer commit and everything it did is undone.
pub struct WriteTransaction<'a> {
    directory: &'a Directory,
    guard: Option<RwLockWriteGuard<'a, EntryTable>>,
    writer: WriterTag,
    /// `None` marks an entry created by this transaction.
    originals: BTreeMap<Metahandle, Option<EntryKernel>>,
    info_before: DirectoryInfo,
    poisoned: bool,
}

impl<'a> WriteTransaction<'a> {
    pub(crate) fn new(
        directory: &'a Directory,
        guard: RwLockWriteGuard<'a, EntryTable>,
        writer: WriterTag,
    ) -> Self {
        let info_before = guard.info().clone();
        Self {
            directory,
            guard: Some(guard),
            writer,
            originals: BTreeMap::new(),
            info_before,
            poisoned: false,
        }
    }

    /// Who is writing.
    #[must_use]
    pub fn writer(&self) -> WriterTag {
        self.writer
    }

    /// Returns true once an invariant violation has doomed this transaction.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Creates a live, local entry as the first child of `parent_id`.
    ///
    /// The entry gets a fresh client id and the given name (server form).
    /// Flags are left at their defaults; callers decide what to mark.
    pub fn create(&mut self, parent_id: &SyncId, name: &str) -> CoreResult<Metahandle> {
        self.guarded(|wtx| {
            match wtx.table_ref().get_by_id(parent_id) {
                Some(parent) if parent.is_live() => {}
                _ => return Err(CoreError::IdNotFound(parent_id.clone())),
            }
            let metahandle = wtx.table_mut().allocate_metahandle();
            let mut kernel = EntryKernel::new(metahandle, SyncId::new_local(), parent_id.clone());
            kernel.name = name.to_owned();
            wtx.originals.insert(metahandle, None);
            wtx.table_mut().insert(kernel)?;
            wtx.link_after(metahandle, None)?;
            Ok(metahandle)
        })
    }

    /// Creates a placeholder for a server item about to be applied.
    ///
    /// The placeholder is a tombstone under the root, outside any sibling
    /// list, until the update gives it a parent and undeletes it.
    pub fn create_update_item(&mut self, id: SyncId) -> CoreResult<Metahandle> {
        self.guarded(|wtx| {
            if wtx.table_ref().get_by_id(&id).is_some() {
                return Err(CoreError::DuplicateId(id));
            }
            let metahandle = wtx.table_mut().allocate_metahandle();
            let mut kernel = EntryKernel::new(metahandle, id, SyncId::root());
            kernel.is_del = true;
            wtx.originals.insert(metahandle, None);
            wtx.table_mut().insert(kernel)?;
            Ok(metahandle)
        })
    }

    /// Opens an entry for mutation.
    pub fn entry_mut(&mut self, metahandle: Metahandle) -> CoreResult<MutableEntry<'_, 'a>> {
        if self.table_ref().get(metahandle).is_none() {
            return Err(CoreError::EntryNotFound(metahandle));
        }
        Ok(MutableEntry::new(self, metahandle))
    }

    /// Opens the entry with the given server id for mutation.
    pub fn entry_mut_by_id(&mut self, id: &SyncId) -> CoreResult<MutableEntry<'_, 'a>> {
        let metahandle = self.table_ref().handle_for_id(id);
        if !metahandle.is_valid() {
            return Err(CoreError::IdNotFound(id.clone()));
        }
        Ok(MutableEntry::new(self, metahandle))
    }

    /// Records the server cursor reached by the last applied batch.
    pub fn set_download_cursor(&mut self, cursor: u64) {
        self.table_mut().info_mut().download_cursor = cursor;
    }

    /// Records that a full download has completed.
    pub fn set_initial_sync_ended(&mut self, ended: bool) {
        self.table_mut().info_mut().initial_sync_ended = ended;
    }

    /// Records the server store identity.
    pub fn set_store_birthday(&mut self, birthday: Option<String>) {
        self.table_mut().info_mut().store_birthday = birthday;
    }

    /// Publishes the changes and releases the directory.
    ///
    /// # Errors
    ///
    /// Returns `TransactionAborted` for a poisoned transaction (which is
    /// rolled back instead), or the I/O error of a failed snapshot save. A
    /// failed save still leaves the changes applied in memory.
    pub fn commit(mut self) -> CoreResult<()> {
        match self.guard.take() {
            Some(guard) => self.finish(guard),
            None => Ok(()),
        }
    }

    /// Restores every touched entry and releases the directory.
    pub fn abort(mut self) {
        if let Some(mut guard) = self.guard.take() {
            self.rollback(&mut guard);
        }
    }

    // ------------------------------------------------------------------
    // Mutation primitives used by `MutableEntry`
    // ------------------------------------------------------------------

    /// Runs `op`, poisoning the transaction if it breaks an invariant.
    pub(crate) fn guarded<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let result = op(self);
        if let Err(e) = &result {
            if e.is_invariant_violation() {
                error!(
                    directory = self.directory.name(),
                    writer = %self.writer,
                    error = %e,
                    "invariant violation, transaction will be rolled back"
                );
                self.poisoned = true;
            }
        }
        result
    }

    pub(crate) fn kernel(&self, metahandle: Metahandle) -> CoreResult<EntryKernel> {
        self.table_ref()
            .get(metahandle)
            .cloned()
            .ok_or(CoreError::EntryNotFound(metahandle))
    }

    /// Applies `f` to a non-root entry. Returns whether anything changed.
    pub(crate) fn update(
        &mut self,
        metahandle: Metahandle,
        f: impl FnOnce(&mut EntryKernel),
    ) -> CoreResult<bool> {
        let current = self.kernel(metahandle)?;
        if current.is_root() {
            return Err(CoreError::RootImmutable);
        }
        let mut next = current.clone();
        f(&mut next);
        if next == current {
            return Ok(false);
        }
        self.originals.entry(metahandle).or_insert(Some(current));
        self.table_mut().replace(next)?;
        Ok(true)
    }

    /// Moves an entry under a new parent, as its first child if live.
    pub(crate) fn set_parent(&mut self, metahandle: Metahandle, parent_id: &SyncId) -> CoreResult<bool> {
        let entry = self.kernel(metahandle)?;
        if entry.is_root() {
            return Err(CoreError::RootImmutable);
        }
        if &entry.parent_id == parent_id {
            return Ok(false);
        }
        if self.table_ref().get_by_id(parent_id).is_none() {
            return Err(CoreError::IdNotFound(parent_id.clone()));
        }
        if self.table_ref().is_descendant_or_self(parent_id, &entry.id) {
            return Err(CoreError::CycleDetected {
                entry: metahandle,
                new_parent: parent_id.clone(),
            });
        }

        let live = entry.is_live();
        if live {
            self.unlink(metahandle)?;
        }
        self.update(metahandle, |k| k.parent_id = parent_id.clone())?;
        if live {
            self.link_after(metahandle, None)?;
        }
        Ok(true)
    }

    /// Places a live entry right after `predecessor` (or first when `None`).
    pub(crate) fn set_predecessor(
        &mut self,
        metahandle: Metahandle,
        predecessor: Option<&SyncId>,
    ) -> CoreResult<bool> {
        let entry = self.kernel(metahandle)?;
        if entry.is_root() {
            return Err(CoreError::RootImmutable);
        }
        if !entry.is_live() {
            return Err(CoreError::invalid_operation(format!(
                "cannot position deleted entry {metahandle}"
            )));
        }
        if entry.prev_id.as_ref() == predecessor {
            return Ok(false);
        }
        if let Some(pred) = predecessor {
            self.check_predecessor(metahandle, &entry.parent_id, pred)?;
        }
        self.unlink(metahandle)?;
        self.link_after(metahandle, predecessor)?;
        Ok(true)
    }

    /// Tombstones or revives an entry, keeping the sibling list consistent.
    pub(crate) fn set_deleted(&mut self, metahandle: Metahandle, deleted: bool) -> CoreResult<bool> {
        let entry = self.kernel(metahandle)?;
        if entry.is_root() {
            return Err(CoreError::RootImmutable);
        }
        if entry.is_del == deleted {
            return Ok(false);
        }
        if deleted {
            self.unlink(metahandle)?;
            self.update(metahandle, |k| k.is_del = true)?;
        } else {
            if self.table_ref().get_by_id(&entry.parent_id).is_none() {
                return Err(CoreError::IdNotFound(entry.parent_id));
            }
            self.update(metahandle, |k| k.is_del = false)?;
            self.link_after(metahandle, None)?;
        }
        Ok(true)
    }

    fn check_predecessor(
        &self,
        metahandle: Metahandle,
        parent_id: &SyncId,
        predecessor: &SyncId,
    ) -> CoreResult<Metahandle> {
        self.table_ref()
            .get_by_id(predecessor)
            .filter(|p| {
                p.is_live() && !p.is_root() && &p.parent_id == parent_id && p.metahandle != metahandle
            })
            .map(|p| p.metahandle)
            .ok_or_else(|| CoreError::InvalidPredecessor {
                parent: parent_id.clone(),
                predecessor: predecessor.clone(),
            })
    }

    /// Takes an entry out of its sibling list, joining its neighbors.
    fn unlink(&mut self, metahandle: Metahandle) -> CoreResult<()> {
        let entry = self.kernel(metahandle)?;
        if let Some(prev) = &entry.prev_id {
            let prev_mh = self.table_ref().handle_for_id(prev);
            if prev_mh.is_valid() {
                self.update(prev_mh, |k| k.next_id = entry.next_id.clone())?;
            }
        }
        if let Some(next) = &entry.next_id {
            let next_mh = self.table_ref().handle_for_id(next);
            if next_mh.is_valid() {
                self.update(next_mh, |k| k.prev_id = entry.prev_id.clone())?;
            }
        }
        self.update(metahandle, |k| {
            k.prev_id = None;
            k.next_id = None;
        })?;
        Ok(())
    }

    /// Inserts an unlinked entry into its parent's sibling list.
    fn link_after(&mut self, metahandle: Metahandle, predecessor: Option<&SyncId>) -> CoreResult<()> {
        let entry = self.kernel(metahandle)?;
        let next = match predecessor {
            Some(pred) => {
                let pred_mh = self.check_predecessor(metahandle, &entry.parent_id, pred)?;
                let next = self.kernel(pred_mh)?.next_id;
                self.update(pred_mh, |k| k.next_id = Some(entry.id.clone()))?;
                next
            }
            None => self
                .table_ref()
                .first_child_except(&entry.parent_id, metahandle),
        };
        if let Some(next_id) = &next {
            let next_mh = self.table_ref().handle_for_id(next_id);
            self.update(next_mh, |k| k.prev_id = Some(entry.id.clone()))?;
        }
        self.update(metahandle, |k| {
            k.prev_id = predecessor.cloned();
            k.next_id = next;
        })?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commit and rollback
    // ------------------------------------------------------------------

    fn finish(&mut self, mut guard: RwLockWriteGuard<'a, EntryTable>) -> CoreResult<()> {
        if self.poisoned {
            self.rollback(&mut guard);
            return Err(CoreError::transaction_aborted(
                "an invariant violation occurred inside the transaction",
            ));
        }

        let originals = std::mem::take(&mut self.originals);
        let changed: BTreeMap<Metahandle, Option<EntryKernel>> = originals
            .into_iter()
            .filter(|(mh, original)| guard.get(*mh) != original.as_ref())
            .collect();
        let info_changed = guard.info() != &self.info_before;
        if changed.is_empty() && !info_changed {
            return Ok(());
        }

        let listener = if changed.is_empty() {
            None
        } else {
            self.directory.change_listener()
        };
        if let Some(listener) = &listener {
            listener.calculate_changes(&CalculateChangesEvent::new(self.writer, &changed, &guard));
        }

        let guard = RwLockWriteGuard::downgrade(guard);
        let saved = self.directory.persist(&guard);
        drop(guard);

        debug!(
            directory = self.directory.name(),
            writer = %self.writer,
            changed = changed.len(),
            "write transaction committed"
        );
        if let Err(e) = &saved {
            error!(directory = self.directory.name(), error = %e, "failed to save directory");
        }

        if let Some(listener) = listener {
            listener.transaction_complete(self.writer);
        }
        saved
    }

    fn rollback(&mut self, table: &mut EntryTable) {
        let originals = std::mem::take(&mut self.originals);
        if !originals.is_empty() {
            debug!(
                directory = self.directory.name(),
                writer = %self.writer,
                touched = originals.len(),
                "rolling back write transaction"
            );
        }
        for (metahandle, original) in originals.into_iter().rev() {
            table.restore(metahandle, original);
        }
        table.set_info(self.info_before.clone());
    }

    fn table_ref(&self) -> &EntryTable {
        match &self.guard {
            Some(guard) => &**guard,
            None => unreachable!("write transaction used after it finished"),
        }
    }

    fn table_mut(&mut self) -> &mut EntryTable {
        match &mut self.guard {
            Some(guard) => &mut **guard,
            None => unreachable!("write transaction used after it finished"),
        }
    }
}

impl BaseTransaction for WriteTransaction<'_> {
    fn table(&self) -> &EntryTable {
        self.table_ref()
    }

    fn directory_name(&self) -> &str {
        self.directory.name()
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        let Some(mut guard) = self.guard.take() else {
            return;
        };
        if std::thread::panicking() {
            self.rollback(&mut guard);
            return;
        }
        if let Err(e) = self.finish(guard) {
            warn!(
                directory = self.directory.name(),
                error = %e,
                "write transaction failed to commit on drop"
            );
        }
    }
}

impl std::fmt::Debug for WriteTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTransaction")
            .field("directory", &self.directory.name())
            .field("writer", &self.writer)
            .field("touched", &self.originals.len())
            .field("poisoned", &self.poisoned)
            .finish()
    }
}
