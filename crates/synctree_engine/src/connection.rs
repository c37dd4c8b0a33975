//! Tracks whether the sync server can be reached.

use crate::error::SyncResult;
use crate::transport::ServerConnection;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Wraps a [`ServerConnection`] with reachability and health state.
pub struct ServerConnectionManager {
    connection: Arc<dyn ServerConnection>,
    endpoint: String,
    reachable: AtomicBool,
    server_up: AtomicBool,
}

impl ServerConnectionManager {
    /// Creates a manager. The server counts as unreachable until probed.
    pub fn new(connection: Arc<dyn ServerConnection>, endpoint: impl Into<String>) -> Self {
        Self {
            connection,
            endpoint: endpoint.into(),
            reachable: AtomicBool::new(false),
            server_up: AtomicBool::new(false),
        }
    }

    /// The server endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The wrapped connection.
    pub fn connection(&self) -> &dyn ServerConnection {
        self.connection.as_ref()
    }

    /// Result of the last probe.
    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Whether the last request got an answer.
    pub fn is_server_up(&self) -> bool {
        self.server_up.load(Ordering::SeqCst)
    }

    /// Probes the server and records the result.
    pub fn check_server_reachable(&self) -> bool {
        let reachable = self.connection.check_reachable();
        let was = self.reachable.swap(reachable, Ordering::SeqCst);
        if reachable != was {
            info!(endpoint = %self.endpoint, reachable, "server reachability changed");
        }
        if reachable {
            self.server_up.store(true, Ordering::SeqCst);
        }
        reachable
    }

    /// Marks the server unreachable without probing.
    pub fn set_server_unreachable(&self) {
        if self.reachable.swap(false, Ordering::SeqCst) {
            info!(endpoint = %self.endpoint, "server marked unreachable");
        }
        self.server_up.store(false, Ordering::SeqCst);
    }

    /// Records the outcome of a request and passes it through.
    pub fn observe<T>(&self, result: SyncResult<T>) -> SyncResult<T> {
        match &result {
            Ok(_) => self.server_up.store(true, Ordering::SeqCst),
            Err(e) if e.is_server_failure() => {
                if self.server_up.swap(false, Ordering::SeqCst) {
                    warn!(endpoint = %self.endpoint, error = %e, "server stopped answering");
                }
            }
            Err(_) => {}
        }
        result
    }
}

impl fmt::Debug for ServerConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnectionManager")
            .field("endpoint", &self.endpoint)
            .field("reachable", &self.is_reachable())
            .field("server_up", &self.is_server_up())
            .finish_non_exhaustive()
    }
}
