//! Error types for synctree core.

use crate::types::{Metahandle, SyncId};
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in directory and transaction operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Snapshot could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the codec failure.
        message: String,
    },

    /// Another process holds the directory lock.
    #[error("directory locked: another process has exclusive access")]
    DirectoryLocked,

    /// The directory has been closed.
    #[error("directory is closed")]
    DirectoryClosed,

    /// Invalid on-disk format or version.
    #[error("invalid directory format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// No entry with the given handle.
    #[error("entry not found: {0}")]
    EntryNotFound(Metahandle),

    /// No entry with the given server id.
    #[error("no entry with id {0}")]
    IdNotFound(SyncId),

    /// Reparenting would create a cycle.
    #[error("moving {entry} under {new_parent} would create a cycle")]
    CycleDetected {
        /// The entry being moved.
        entry: Metahandle,
        /// The requested parent.
        new_parent: SyncId,
    },

    /// The root entry cannot be modified.
    #[error("the root entry is immutable")]
    RootImmutable,

    /// An entry with this server id already exists.
    #[error("duplicate server id {0}")]
    DuplicateId(SyncId),

    /// An entry with this unique tag already exists.
    #[error("duplicate unique tag {0:?}")]
    DuplicateTag(String),

    /// The predecessor is not a live child of the target parent.
    #[error("predecessor {predecessor} is not a child of {parent}")]
    InvalidPredecessor {
        /// The requested parent.
        parent: SyncId,
        /// The offending predecessor.
        predecessor: SyncId,
    },

    /// Transaction was rolled back.
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Reason for abort.
        reason: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates a transaction aborted error.
    pub fn transaction_aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if this error reports a broken tree or store invariant.
    ///
    /// These indicate a bug in the caller rather than a transient condition.
    #[must_use]
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::CycleDetected { .. }
                | Self::RootImmutable
                | Self::DuplicateId(_)
                | Self::DuplicateTag(_)
                | Self::InvalidPredecessor { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_classification() {
        assert!(CoreError::RootImmutable.is_invariant_violation());
        assert!(CoreError::DuplicateId(SyncId::root()).is_invariant_violation());
        assert!(!CoreError::DirectoryClosed.is_invariant_violation());
        assert!(!CoreError::invalid_operation("x").is_invariant_violation());
    }

    #[test]
    fn error_display() {
        let err = CoreError::CycleDetected {
            entry: Metahandle::new(7),
            new_parent: SyncId::from("c42"),
        };
        let text = err.to_string();
        assert!(text.contains("mh:7"));
        assert!(text.contains("c42"));
    }
}
