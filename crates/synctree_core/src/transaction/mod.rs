//! Scoped access to a directory.
//!
//! - [`ReadTransaction`] shares the directory with other readers and never
//!   observes a write transaction in progress.
//! - [`WriteTransaction`] holds the directory exclusively. Every entry it
//!   touches is recorded first, so the transaction can either publish its
//!   changes to the directory's listener or roll everything back.
//!
//! Both release the directory when dropped, on every exit path.

mod mutable;
mod read;
mod write;

pub use mutable::MutableEntry;
pub use read::ReadTransaction;
pub use write::WriteTransaction;

use crate::entry::{EntryKernel, EntryTable};
use crate::types::{Metahandle, SyncId};

/// Read access shared by both transaction kinds.
pub trait BaseTransaction {
    /// The entries as seen by this transaction.
    fn table(&self) -> &EntryTable;

    /// Name of the directory this transaction belongs to.
    fn directory_name(&self) -> &str;

    /// Looks up an entry by metahandle.
    fn entry(&self, metahandle: Metahandle) -> Option<&EntryKernel> {
        self.table().get(metahandle)
    }

    /// Looks up an entry by server id.
    fn entry_by_id(&self, id: &SyncId) -> Option<&EntryKernel> {
        self.table().get_by_id(id)
    }

    /// Looks up an entry by unique tag.
    fn entry_by_tag(&self, tag: &str) -> Option<&EntryKernel> {
        self.table().get_by_tag(tag)
    }

    /// Returns the root entry.
    fn root(&self) -> &EntryKernel {
        self.table().root()
    }
}
