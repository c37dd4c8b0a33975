//! Read transactions.

use crate::entry::EntryTable;
use crate::transaction::BaseTransaction;
use parking_lot::RwLockReadGuard;

/// A shared, read-only view of a directory.
pub struct ReadTransaction<'a> {
    name: &'a str,
    guard: RwLockReadGuard<'a, EntryTable>,
}

impl<'a> ReadTransaction<'a> {
    pub(crate) fn new(name: &'a str, guard: RwLockReadGuard<'a, EntryTable>) -> Self {
        Self { name, guard }
    }
}

impl BaseTransaction for ReadTransaction<'_> {
    fn table(&self) -> &EntryTable {
        &self.guard
    }

    fn directory_name(&self) -> &str {
        self.name
    }
}

impl std::fmt::Debug for ReadTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadTransaction")
            .field("directory", &self.name)
            .field("entries", &self.guard.len())
            .finish()
    }
}
