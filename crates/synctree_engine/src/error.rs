//! Error types for the sync engine.

use crate::auth::AuthFailure;
use std::time::Duration;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the sync engine.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The server rejected the session token; a new authentication is needed.
    #[error("server requires re-authentication")]
    AuthenticationRequired,

    /// Credential validation failed.
    #[error("authentication failed: {0}")]
    Auth(AuthFailure),

    /// Server rejected the request or sent a malformed response.
    #[error("server error: {0}")]
    ServerError(String),

    /// The server's data store was reset since the last download.
    #[error("store birthday changed from {local} to {remote}")]
    StoreBirthdayChanged {
        /// Birthday recorded in the directory.
        local: String,
        /// Birthday reported by the server.
        remote: String,
    },

    /// Directory error during sync.
    #[error("directory error: {0}")]
    Core(#[from] synctree_core::CoreError),

    /// I/O error outside the directory (settings, thread spawn).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings file could not be read or written.
    #[error("settings error: {0}")]
    Settings(String),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// The manager was used before `initialize` or after `shutdown`.
    #[error("sync manager is not initialized")]
    NotInitialized,

    /// The manager was initialized twice.
    #[error("sync manager is already initialized")]
    AlreadyInitialized,

    /// A re-authentication produced a different user than the session's.
    #[error("identity mismatch: session belongs to {expected}, got {actual}")]
    IdentityMismatch {
        /// Identity recorded by the first successful authentication.
        expected: String,
        /// Identity reported by the later authentication.
        actual: String,
    },

    /// A worker thread did not exit in time.
    #[error("thread {thread} did not exit within {timeout:?}")]
    ThreadJoinTimeout {
        /// Thread name.
        thread: String,
        /// Join timeout that elapsed.
        timeout: Duration,
    },

    /// A worker thread panicked.
    #[error("thread {0} panicked")]
    ThreadPanicked(String),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a settings error.
    pub fn settings(message: impl Into<String>) -> Self {
        Self::Settings(message.into())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout | SyncError::NotConnected => true,
            SyncError::ServerError(_) => true,
            _ => false,
        }
    }

    /// Returns true if this error means the server could not be reached.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            SyncError::Transport { .. } | SyncError::Timeout | SyncError::NotConnected
        )
    }

    /// Returns true if the server did not give a usable answer, whether
    /// it was unreachable or answered with an error.
    pub fn is_server_failure(&self) -> bool {
        self.is_connection_error()
            || matches!(
                self,
                SyncError::ServerError(_) | SyncError::StoreBirthdayChanged { .. }
            )
    }
}
