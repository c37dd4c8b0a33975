//! The directory: all entries of one identity.

use crate::change_event::DirectoryChangeListener;
use crate::config::Config;
use crate::dir::DirectoryLocation;
use crate::entry::EntryTable;
use crate::error::{CoreError, CoreResult};
use crate::transaction::{BaseTransaction, ReadTransaction, WriteTransaction};
use crate::types::WriterTag;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// The transactional store of all entries for one identity.
///
/// All access goes through transactions:
///
/// ```rust,ignore
/// use synctree_core::{BaseTransaction, Directory, SyncId, WriterTag};
///
/// let dir = Directory::open_in_memory("alice@example.com")?;
/// let folder = dir.write(WriterTag::SyncApi, |wtx| wtx.create(&SyncId::root(), "Folder"))?;
///
/// let rtx = dir.read()?;
/// assert_eq!(rtx.entry(folder).map(|e| e.name.as_str()), Some("Folder"));
/// ```
///
/// A write transaction holds the whole directory exclusively; read
/// transactions share it with each other.
pub struct Directory {
    name: String,
    config: Config,
    /// Holds the lock file. `None` for in-memory directories and after close.
    location: Mutex<Option<DirectoryLocation>>,
    path: Option<PathBuf>,
    kernel: RwLock<EntryTable>,
    listener: RwLock<Option<Arc<dyn DirectoryChangeListener>>>,
    is_open: AtomicBool,
}

impl Directory {
    /// Opens (or creates) the directory stored at `path`.
    ///
    /// # Errors
    ///
    /// Returns `DirectoryLocked` if another process has it open, or a codec
    /// / format error if the snapshot cannot be read.
    pub fn open(path: &Path, name: impl Into<String>, config: Config) -> CoreResult<Self> {
        let name = name.into();
        let location = DirectoryLocation::open(path, config.create_if_missing)?;
        let table = match location.load(config.format_version)? {
            Some(table) => table,
            None => EntryTable::new(),
        };
        info!(
            directory = %name,
            path = %path.display(),
            entries = table.len(),
            initial_sync_ended = table.info().initial_sync_ended,
            "directory opened"
        );
        Ok(Self {
            name,
            config,
            location: Mutex::new(Some(location)),
            path: Some(path.to_path_buf()),
            kernel: RwLock::new(table),
            listener: RwLock::new(None),
            is_open: AtomicBool::new(true),
        })
    }

    /// Creates an empty directory that lives only in memory.
    pub fn open_in_memory(name: impl Into<String>) -> CoreResult<Self> {
        Ok(Self {
            name: name.into(),
            config: Config::default(),
            location: Mutex::new(None),
            path: None,
            kernel: RwLock::new(EntryTable::new()),
            listener: RwLock::new(None),
            is_open: AtomicBool::new(true),
        })
    }

    /// The identity this directory belongs to.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Where the directory is stored, if on disk.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns true until [`close`](Self::close) is called.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    /// Begins a read transaction. Blocks while a write transaction is open.
    pub fn read(&self) -> CoreResult<ReadTransaction<'_>> {
        let guard = self.kernel.read();
        self.ensure_open()?;
        Ok(ReadTransaction::new(&self.name, guard))
    }

    /// Begins a write transaction. Blocks while any other transaction is open.
    pub fn begin_write(&self, writer: WriterTag) -> CoreResult<WriteTransaction<'_>> {
        let guard = self.kernel.write();
        self.ensure_open()?;
        Ok(WriteTransaction::new(self, guard, writer))
    }

    /// Runs `f` in a write transaction.
    ///
    /// If `f` returns `Ok`, the transaction is committed. If it returns
    /// `Err`, everything it did is rolled back and no change events fire.
    pub fn write<F, T>(&self, writer: WriterTag, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut WriteTransaction<'_>) -> CoreResult<T>,
    {
        let mut wtx = self.begin_write(writer)?;
        match f(&mut wtx) {
            Ok(value) => {
                wtx.commit()?;
                Ok(value)
            }
            Err(e) => {
                wtx.abort();
                Err(e)
            }
        }
    }

    /// Installs (or with `None`, removes) the change listener.
    pub fn set_change_listener(&self, listener: Option<Arc<dyn DirectoryChangeListener>>) {
        *self.listener.write() = listener;
    }

    /// Returns true if a change listener is installed.
    #[must_use]
    pub fn has_change_listener(&self) -> bool {
        self.listener.read().is_some()
    }

    pub(crate) fn change_listener(&self) -> Option<Arc<dyn DirectoryChangeListener>> {
        self.listener.read().clone()
    }

    /// Whether a full download has completed at least once.
    pub fn initial_sync_ended(&self) -> CoreResult<bool> {
        let rtx = self.read()?;
        Ok(rtx.table().info().initial_sync_ended)
    }

    /// Number of entries waiting to be committed.
    pub fn unsynced_count(&self) -> CoreResult<usize> {
        let rtx = self.read()?;
        Ok(rtx.table().iter().filter(|e| e.is_unsynced).count())
    }

    /// Writes a snapshot now, regardless of `save_on_commit`.
    pub fn save_changes(&self) -> CoreResult<()> {
        let guard = self.kernel.read();
        self.ensure_open()?;
        self.save_table(&guard)
    }

    /// Saves, detaches the listener and releases the lock file.
    ///
    /// Waits for open transactions to finish. Transactions begun afterwards
    /// fail with `DirectoryClosed`.
    pub fn close(&self) -> CoreResult<()> {
        let guard = self.kernel.write();
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let saved = self.save_table(&guard);
        self.location.lock().take();
        self.listener.write().take();
        info!(directory = %self.name, "directory closed");
        saved
    }

    /// Persists after a commit if configured to.
    pub(crate) fn persist(&self, table: &EntryTable) -> CoreResult<()> {
        if self.config.save_on_commit {
            self.save_table(table)
        } else {
            Ok(())
        }
    }

    fn save_table(&self, table: &EntryTable) -> CoreResult<()> {
        let location = self.location.lock();
        if let Some(location) = location.as_ref() {
            location.save(table, self.config.format_version)?;
            debug!(directory = %self.name, entries = table.len(), "directory saved");
        }
        Ok(())
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CoreError::DirectoryClosed)
        }
    }
}

impl std::fmt::Debug for Directory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("is_open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl Drop for Directory {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_event::CalculateChangesEvent;
    use crate::types::{Metahandle, SyncId};
    use tempfile::tempdir;

    #[derive(Default)]
    struct CountingListener {
        calculated: Mutex<Vec<(WriterTag, usize)>>,
        completed: Mutex<Vec<WriterTag>>,
    }

    impl DirectoryChangeListener for CountingListener {
        fn calculate_changes(&self, event: &CalculateChangesEvent<'_>) {
            self.calculated.lock().push((event.writer(), event.len()));
        }

        fn transaction_complete(&self, writer: WriterTag) {
            self.completed.lock().push(writer);
        }
    }

    fn create_dir() -> Directory {
        Directory::open_in_memory("test@example.com").unwrap()
    }

    #[test]
    fn open_in_memory_has_root() {
        let dir = create_dir();
        let rtx = dir.read().unwrap();
        assert_eq!(rtx.root().metahandle, Metahandle::ROOT);
        assert_eq!(rtx.directory_name(), "test@example.com");
    }

    #[test]
    fn committed_write_is_visible() {
        let dir = create_dir();
        let mh = dir
            .write(WriterTag::Unittest, |wtx| wtx.create(&SyncId::root(), "a"))
            .unwrap();
        let rtx = dir.read().unwrap();
        assert_eq!(rtx.entry(mh).unwrap().name, "a");
    }

    #[test]
    fn failed_closure_rolls_back() {
        let dir = create_dir();
        let result: CoreResult<()> = dir.write(WriterTag::Unittest, |wtx| {
            wtx.create(&SyncId::root(), "a")?;
            Err(CoreError::invalid_operation("boom"))
        });
        assert!(result.is_err());
        assert_eq!(dir.read().unwrap().table().len(), 1);
    }

    #[test]
    fn one_event_pair_per_changed_transaction() {
        let dir = create_dir();
        let listener = Arc::new(CountingListener::default());
        dir.set_change_listener(Some(listener.clone()));

        dir.write(WriterTag::SyncApi, |wtx| {
            let mh = wtx.create(&SyncId::root(), "a")?;
            wtx.entry_mut(mh)?.put_is_unsynced(true)?;
            Ok(())
        })
        .unwrap();

        // Nothing changed: no events.
        dir.write(WriterTag::SyncApi, |_| Ok(())).unwrap();

        assert_eq!(*listener.calculated.lock(), vec![(WriterTag::SyncApi, 1)]);
        assert_eq!(*listener.completed.lock(), vec![WriterTag::SyncApi]);
    }

    #[test]
    fn rolled_back_transaction_fires_nothing() {
        let dir = create_dir();
        let listener = Arc::new(CountingListener::default());
        dir.set_change_listener(Some(listener.clone()));

        let mut wtx = dir.begin_write(WriterTag::Syncer).unwrap();
        wtx.create(&SyncId::root(), "a").unwrap();
        wtx.abort();

        assert!(listener.calculated.lock().is_empty());
        assert!(listener.completed.lock().is_empty());
    }

    #[test]
    fn drop_commits() {
        let dir = create_dir();
        {
            let mut wtx = dir.begin_write(WriterTag::Unittest).unwrap();
            wtx.create(&SyncId::root(), "a").unwrap();
        }
        assert_eq!(dir.read().unwrap().table().len(), 2);
    }

    #[test]
    fn closed_directory_rejects_transactions() {
        let dir = create_dir();
        dir.close().unwrap();
        assert!(!dir.is_open());
        assert!(matches!(dir.read(), Err(CoreError::DirectoryClosed)));
        assert!(matches!(
            dir.begin_write(WriterTag::Unittest),
            Err(CoreError::DirectoryClosed)
        ));
        // Closing twice is fine.
        dir.close().unwrap();
    }

    #[test]
    fn reopen_restores_entries() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("alice");
        let mh = {
            let dir = Directory::open(&path, "alice", Config::default()).unwrap();
            let mh = dir
                .write(WriterTag::SyncApi, |wtx| {
                    let mh = wtx.create(&SyncId::root(), "Folder")?;
                    wtx.set_download_cursor(9);
                    Ok(mh)
                })
                .unwrap();
            dir.close().unwrap();
            mh
        };

        let dir = Directory::open(&path, "alice", Config::default()).unwrap();
        let rtx = dir.read().unwrap();
        assert_eq!(rtx.entry(mh).unwrap().name, "Folder");
        assert_eq!(rtx.table().info().download_cursor, 9);
    }

    #[test]
    fn second_open_is_locked() {
        let temp = tempdir().unwrap();
        let _dir = Directory::open(temp.path(), "alice", Config::default()).unwrap();
        let second = Directory::open(temp.path(), "alice", Config::default());
        assert!(matches!(second, Err(CoreError::DirectoryLocked)));
    }
}
