//! On-disk location of a directory.
//!
//! Each identity gets its own folder:
//!
//! ```text
//! <location>/
//! ├─ LOCK              # Advisory lock, one process per directory
//! ├─ entries.cbor      # Snapshot of all entries and directory info
//! └─ entries.cbor.tmp  # Present only while a save is in flight
//! ```

use crate::entry::{DirectoryInfo, EntryKernel, EntryTable};
use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
/// Name of the snapshot file inside a directory folder.
pub const SNAPSHOT_FILE: &str = "entries.cbor";
const SNAPSHOT_TEMP: &str = "entries.cbor.tmp";

#[derive(Serialize)]
struct SnapshotRef<'a> {
    format_version: u16,
    info: &'a DirectoryInfo,
    entries: Vec<&'a EntryKernel>,
}

#[derive(Deserialize)]
struct Snapshot {
    format_version: u16,
    info: DirectoryInfo,
    entries: Vec<EntryKernel>,
}

/// A locked directory folder on disk.
///
/// Holds an exclusive advisory lock for as long as it lives; dropping it
/// releases the lock.
#[derive(Debug)]
pub struct DirectoryLocation {
    path: PathBuf,
    _lock_file: File,
}

impl DirectoryLocation {
    /// Opens a directory folder, creating it if allowed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DirectoryLocked`] if another process holds the
    /// lock, and `InvalidFormat` if the folder is missing and may not be
    /// created or the path is not a folder.
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_format(format!(
                    "directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DirectoryLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the folder path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path of the snapshot file.
    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.path.join(SNAPSHOT_FILE)
    }

    /// Loads the last saved snapshot, or `None` for a fresh folder.
    pub fn load(&self, expected_version: u16) -> CoreResult<Option<EntryTable>> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }
        read_snapshot(&path, expected_version).map(Some)
    }

    /// Writes a snapshot of `table` atomically.
    ///
    /// The data goes to a temp file which is synced and then renamed over
    /// the previous snapshot.
    pub fn save(&self, table: &EntryTable, format_version: u16) -> CoreResult<()> {
        let temp_path = self.path.join(SNAPSHOT_TEMP);

        let mut entries: Vec<&EntryKernel> = table.iter().collect();
        entries.sort_by_key(|e| e.metahandle);
        let snapshot = SnapshotRef {
            format_version,
            info: table.info(),
            entries,
        };

        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        ciborium::into_writer(&snapshot, &mut writer)
            .map_err(|e| CoreError::codec(e.to_string()))?;
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| CoreError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.snapshot_path())?;
        self.sync_directory()?;
        Ok(())
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> CoreResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> CoreResult<()> {
        Ok(())
    }
}

/// Reads a snapshot file without taking the directory lock.
///
/// Used by tooling that inspects a directory another process may own.
pub fn read_snapshot(path: &Path, expected_version: u16) -> CoreResult<EntryTable> {
    let file = File::open(path)?;
    let snapshot: Snapshot = ciborium::from_reader(BufReader::new(file))
        .map_err(|e| CoreError::codec(e.to_string()))?;
    if snapshot.format_version != expected_version {
        return Err(CoreError::invalid_format(format!(
            "unsupported snapshot version {} (expected {expected_version})",
            snapshot.format_version
        )));
    }
    EntryTable::from_parts(snapshot.info, snapshot.entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Metahandle, SyncId};
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("new_dir");

        let location = DirectoryLocation::open(&path, true).unwrap();
        assert!(path.is_dir());
        assert_eq!(location.path(), path);
    }

    #[test]
    fn open_fails_if_missing_and_no_create() {
        let temp = tempdir().unwrap();
        let result = DirectoryLocation::open(&temp.path().join("missing"), false);
        assert!(matches!(result, Err(CoreError::InvalidFormat { .. })));
    }

    #[test]
    fn lock_prevents_second_open() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("locked");

        let _first = DirectoryLocation::open(&path, true).unwrap();
        let second = DirectoryLocation::open(&path, true);
        assert!(matches!(second, Err(CoreError::DirectoryLocked)));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("reopen");

        {
            let _location = DirectoryLocation::open(&path, true).unwrap();
        }
        DirectoryLocation::open(&path, true).unwrap();
    }

    #[test]
    fn snapshot_round_trip() {
        let temp = tempdir().unwrap();
        let location = DirectoryLocation::open(temp.path(), true).unwrap();
        assert!(location.load(1).unwrap().is_none());

        let mut table = EntryTable::new();
        let mh = table.allocate_metahandle();
        let mut kernel = EntryKernel::new(mh, SyncId::from("s1"), SyncId::root());
        kernel.name = "Bookmarks".to_owned();
        kernel.favicon = vec![1, 2, 3];
        table.insert(kernel).unwrap();
        table.info_mut().download_cursor = 17;

        location.save(&table, 1).unwrap();
        let loaded = location.load(1).unwrap().unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.info().download_cursor, 17);
        let entry = loaded.get_by_id(&SyncId::from("s1")).unwrap();
        assert_eq!(entry.metahandle, mh);
        assert_eq!(entry.favicon, vec![1, 2, 3]);
        assert_eq!(loaded.handle_for_id(&SyncId::root()), Metahandle::ROOT);
    }

    #[test]
    fn version_mismatch_rejected() {
        let temp = tempdir().unwrap();
        let location = DirectoryLocation::open(temp.path(), true).unwrap();
        location.save(&EntryTable::new(), 1).unwrap();

        let result = location.load(2);
        assert!(matches!(result, Err(CoreError::InvalidFormat { .. })));
    }
}
