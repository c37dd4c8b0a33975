//! Directories for several identities under one storage root.

use crate::config::Config;
use crate::directory::Directory;
use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// Opens and tracks one [`Directory`] per identity.
///
/// Each identity lives in its own sub-folder of the storage root, named
/// after the identity with filesystem-unsafe characters replaced.
#[derive(Debug)]
pub struct DirectoryManager {
    root: PathBuf,
    config: Config,
    open: Mutex<HashMap<String, Arc<Directory>>>,
}

impl DirectoryManager {
    /// Creates a manager rooted at `root`. Nothing is touched until a
    /// directory is opened.
    pub fn new(root: impl Into<PathBuf>, config: Config) -> Self {
        Self {
            root: root.into(),
            config,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// The storage root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Folder that holds (or would hold) the directory of `identity`.
    pub fn path_for(&self, identity: &str) -> CoreResult<PathBuf> {
        Ok(self.root.join(folder_name(identity)?))
    }

    /// Opens the directory for `identity`, or returns it if already open.
    pub fn open(&self, identity: &str) -> CoreResult<Arc<Directory>> {
        let mut open = self.open.lock();
        if let Some(dir) = open.get(identity) {
            return Ok(Arc::clone(dir));
        }
        let path = self.path_for(identity)?;
        let dir = Arc::new(Directory::open(&path, identity, self.config.clone())?);
        open.insert(identity.to_owned(), Arc::clone(&dir));
        Ok(dir)
    }

    /// Returns the open directory for `identity`.
    #[must_use]
    pub fn get(&self, identity: &str) -> Option<Arc<Directory>> {
        self.open.lock().get(identity).cloned()
    }

    /// Returns true if a directory for `identity` is open.
    #[must_use]
    pub fn is_open(&self, identity: &str) -> bool {
        self.open.lock().contains_key(identity)
    }

    /// Closes and forgets the directory for `identity`.
    pub fn close(&self, identity: &str) -> CoreResult<()> {
        let dir = self.open.lock().remove(identity);
        match dir {
            Some(dir) => dir.close(),
            None => Ok(()),
        }
    }

    /// Saves every open directory, logging failures. Returns the first error.
    pub fn final_save_all(&self) -> CoreResult<()> {
        let dirs: Vec<Arc<Directory>> = self.open.lock().values().cloned().collect();
        let mut first_error = None;
        for dir in dirs {
            if let Err(e) = dir.save_changes() {
                error!(directory = dir.name(), error = %e, "final save failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Closes every open directory.
    pub fn close_all(&self) -> CoreResult<()> {
        let dirs: Vec<(String, Arc<Directory>)> = self.open.lock().drain().collect();
        let mut first_error = None;
        for (identity, dir) in dirs {
            if let Err(e) = dir.close() {
                error!(directory = %identity, error = %e, "close failed");
                first_error.get_or_insert(e);
            }
        }
        if first_error.is_none() {
            info!(root = %self.root.display(), "all directories closed");
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Maps an identity to a folder name.
fn folder_name(identity: &str) -> CoreResult<String> {
    let name: String = identity
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() || name.chars().all(|c| c == '.') {
        return Err(CoreError::invalid_operation(format!(
            "identity {identity:?} cannot name a directory"
        )));
    }
    Ok(name)
}
