//! Listener contract for directory write transactions.
//!
//! Every write transaction that changed at least one entry produces exactly
//! one [`DirectoryChangeListener::calculate_changes`] call followed by one
//! [`DirectoryChangeListener::transaction_complete`] call. Empty and rolled
//! back transactions produce nothing.

use crate::entry::{EntryKernel, EntryTable};
use crate::types::{Metahandle, WriterTag};
use std::collections::BTreeMap;

/// The changes made by one write transaction.
///
/// Handed to the listener while the write lock is still held, so the table
/// reflects exactly this transaction's result.
#[derive(Debug)]
pub struct CalculateChangesEvent<'a> {
    writer: WriterTag,
    originals: &'a BTreeMap<Metahandle, Option<EntryKernel>>,
    table: &'a EntryTable,
}

impl<'a> CalculateChangesEvent<'a> {
    pub(crate) fn new(
        writer: WriterTag,
        originals: &'a BTreeMap<Metahandle, Option<EntryKernel>>,
        table: &'a EntryTable,
    ) -> Self {
        Self {
            writer,
            originals,
            table,
        }
    }

    /// Who made the changes.
    #[must_use]
    pub fn writer(&self) -> WriterTag {
        self.writer
    }

    /// Handles of the changed entries, in ascending order.
    pub fn changed_handles(&self) -> impl Iterator<Item = Metahandle> + '_ {
        self.originals.keys().copied()
    }

    /// Pre-transaction state of a changed entry; `None` if it was created.
    #[must_use]
    pub fn original(&self, metahandle: Metahandle) -> Option<&EntryKernel> {
        self.originals.get(&metahandle).and_then(Option::as_ref)
    }

    /// Post-transaction state of an entry.
    #[must_use]
    pub fn current(&self, metahandle: Metahandle) -> Option<&EntryKernel> {
        self.table.get(metahandle)
    }

    /// The whole post-transaction table.
    #[must_use]
    pub fn table(&self) -> &EntryTable {
        self.table
    }

    /// Number of changed entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.originals.len()
    }

    /// Always false for events handed to a listener.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.originals.is_empty()
    }
}

/// Receives change notifications from a [`Directory`](crate::Directory).
///
/// `calculate_changes` runs with the directory write lock held and must not
/// open transactions on the same directory. `transaction_complete` runs after
/// the lock is released and the snapshot is saved.
pub trait DirectoryChangeListener: Send + Sync {
    /// Inspects the changes of a transaction that is about to be released.
    fn calculate_changes(&self, event: &CalculateChangesEvent<'_>);

    /// The transaction whose changes were last calculated is complete.
    fn transaction_complete(&self, writer: WriterTag);
}
