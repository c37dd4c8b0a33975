//! Field-level mutation of one entry.

use crate::entry::EntryKernel;
use crate::error::CoreResult;
use crate::ordinal::Ordinal;
use crate::transaction::{BaseTransaction, WriteTransaction};
use crate::types::{Metahandle, SyncId};

/// One entry opened for mutation inside a write transaction.
///
/// Setters return whether the value actually changed. None of them touch
/// the dirty flag; local API callers mark it themselves, the sync loop
/// applies server state without marking.
#[derive(Debug)]
pub struct MutableEntry<'t, 'a> {
    wtx: &'t mut WriteTransaction<'a>,
    metahandle: Metahandle,
}

impl<'t, 'a> MutableEntry<'t, 'a> {
    pub(crate) fn new(wtx: &'t mut WriteTransaction<'a>, metahandle: Metahandle) -> Self {
        Self { wtx, metahandle }
    }

    /// The handle of this entry.
    #[must_use]
    pub fn metahandle(&self) -> Metahandle {
        self.metahandle
    }

    /// Current state of the entry, or `None` if it was rolled away.
    #[must_use]
    pub fn kernel(&self) -> Option<&EntryKernel> {
        self.wtx.entry(self.metahandle)
    }

    fn put(&mut self, f: impl FnOnce(&mut EntryKernel)) -> CoreResult<bool> {
        let metahandle = self.metahandle;
        self.wtx.guarded(|wtx| wtx.update(metahandle, f))
    }

    /// Sets the name (server form).
    pub fn put_name(&mut self, name: &str) -> CoreResult<bool> {
        self.put(|k| {
            if k.name != name {
                k.name = name.to_owned();
            }
        })
    }

    /// Sets the folder flag.
    pub fn put_is_dir(&mut self, is_dir: bool) -> CoreResult<bool> {
        self.put(|k| k.is_dir = is_dir)
    }

    /// Sets the domain-object flag.
    pub fn put_is_domain_object(&mut self, value: bool) -> CoreResult<bool> {
        self.put(|k| k.is_domain_object = value)
    }

    /// Sets the URL payload.
    pub fn put_url(&mut self, url: &str) -> CoreResult<bool> {
        self.put(|k| {
            if k.url != url {
                k.url = url.to_owned();
            }
        })
    }

    /// Sets the favicon payload.
    pub fn put_favicon(&mut self, favicon: &[u8]) -> CoreResult<bool> {
        self.put(|k| {
            if k.favicon != favicon {
                k.favicon = favicon.to_vec();
            }
        })
    }

    /// Sets the local-only external id.
    pub fn put_external_id(&mut self, external_id: i64) -> CoreResult<bool> {
        self.put(|k| k.external_id = external_id)
    }

    /// Sets or clears the unique tag.
    pub fn put_unique_tag(&mut self, tag: Option<String>) -> CoreResult<bool> {
        self.put(|k| k.unique_tag = tag)
    }

    /// Sets the dirty flag.
    pub fn put_is_unsynced(&mut self, unsynced: bool) -> CoreResult<bool> {
        self.put(|k| k.is_unsynced = unsynced)
    }

    /// Clears the dirty flag after the server accepted the entry.
    pub fn clear_unsynced(&mut self) -> CoreResult<bool> {
        self.put_is_unsynced(false)
    }

    /// Sets the version the local state is based on.
    pub fn put_base_version(&mut self, version: i64) -> CoreResult<bool> {
        self.put(|k| k.base_version = version)
    }

    /// Sets the latest version seen from the server.
    pub fn put_server_version(&mut self, version: i64) -> CoreResult<bool> {
        self.put(|k| k.server_version = version)
    }

    /// Sets the ordinal position.
    pub fn put_ordinal(&mut self, ordinal: Option<Ordinal>) -> CoreResult<bool> {
        self.put(|k| k.ordinal = ordinal)
    }

    /// Moves the entry under `parent_id`, as its first child if live.
    ///
    /// Fails with `CycleDetected` if `parent_id` is the entry itself or one
    /// of its descendants.
    pub fn put_parent_id(&mut self, parent_id: &SyncId) -> CoreResult<bool> {
        let metahandle = self.metahandle;
        self.wtx.guarded(|wtx| wtx.set_parent(metahandle, parent_id))
    }

    /// Places the entry after `predecessor` among its siblings, or first.
    pub fn put_predecessor(&mut self, predecessor: Option<&SyncId>) -> CoreResult<bool> {
        let metahandle = self.metahandle;
        self.wtx
            .guarded(|wtx| wtx.set_predecessor(metahandle, predecessor))
    }

    /// Tombstones (unlinking it from its siblings) or revives the entry.
    pub fn put_is_del(&mut self, deleted: bool) -> CoreResult<bool> {
        let metahandle = self.metahandle;
        self.wtx.guarded(|wtx| wtx.set_deleted(metahandle, deleted))
    }
}
