//! CLI command implementations.

pub mod dump;
pub mod inspect;
pub mod ordinal;

use std::path::{Path, PathBuf};
use synctree_core::{read_snapshot, Config, CoreError, EntryTable, SNAPSHOT_FILE};
use thiserror::Error;
use tracing::debug;

/// Errors from loading a directory for inspection.
#[derive(Debug, Error)]
pub enum CommandError {
    /// No snapshot at the given path.
    #[error("no directory found at {0}")]
    NotFound(PathBuf),

    /// The snapshot could not be read.
    #[error("cannot read {path}: {source}")]
    Unreadable {
        /// Snapshot file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: CoreError,
    },
}

/// Loads the entry table from a directory folder or snapshot file.
///
/// Reads the snapshot without taking the directory lock, so a running
/// client can keep the directory open.
pub fn load_table(path: &Path) -> Result<EntryTable, CommandError> {
    let snapshot = if path.is_dir() {
        path.join(SNAPSHOT_FILE)
    } else {
        path.to_path_buf()
    };
    if !snapshot.is_file() {
        return Err(CommandError::NotFound(path.to_path_buf()));
    }
    debug!(path = %snapshot.display(), "reading snapshot");
    read_snapshot(&snapshot, Config::default().format_version).map_err(|source| {
        CommandError::Unreadable {
            path: snapshot,
            source,
        }
    })
}
