//! # synctree engine
//!
//! Keeps a [`synctree_core::Directory`] in sync with a server.
//!
//! This crate provides:
//! - A change pipeline that nudges the sync loop on local edits and delivers
//!   tree-ordered change records for server edits
//! - The sync loop: nudge coalescing, download/apply, commit, backoff
//! - An authentication state machine on a worker thread
//! - A reachability watcher with swappable backends
//! - A peer notification channel
//! - Status aggregation and the [`SyncManager`] orchestrator
//!
//! ## Key Invariants
//!
//! - Initialization completion is reported exactly once per session
//! - The first authenticated identity is fixed for the session
//! - After `shutdown` returns, no observer callback fires
//! - Components never call into each other; they report to the manager
//!
//! ## Testing
//!
//! [`MockServerConnection`], [`MockAuthenticator`], [`MockPeerNotifier`],
//! [`fake_reachability`] and [`RecordingObserver`] let a whole session run
//! in-process with deterministic inputs.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod changes;
mod config;
mod connection;
mod context;
mod error;
mod manager;
mod notifier;
mod observer;
mod reachability;
mod settings;
mod status;
mod syncer;
mod transport;
mod worker;

pub use auth::{
    AuthEvent, AuthEventHandler, AuthFailure, AuthRequest, AuthState, AuthToken, AuthWatcher,
    Authenticator, CaptchaAnswer, MockAuthenticator,
};
pub use changes::{
    ChangeProcessor, ChangeRecord, ChangeReorderBuffer, ChangeType, NudgeSource, Nudger,
};
pub use config::{RetryConfig, SyncConfig, DEFAULT_CAPTCHA_URL_PREFIX};
pub use connection::ServerConnectionManager;
pub use context::SessionContext;
pub use error::{SyncError, SyncResult};
pub use manager::{Collaborators, CredentialSource, InitParams, SyncManager};
pub use notifier::{MockPeerNotifier, NotificationChannel, NotificationStats, PeerNotifier};
pub use observer::{AuthError, ObservedEvent, RecordingObserver, SyncObserver};
pub use reachability::{
    fake_reachability, FakeReachabilityBackend, FakeReachabilityController,
    IntervalReachabilityBackend, NetworkChange, ReachabilityBackend, ReachabilityListener,
    ReachabilityWatcher,
};
pub use settings::UserSettings;
pub use status::{Status, StatusAggregator, StatusSummary};
pub use syncer::{
    NudgeCoalescer, SyncCycleSnapshot, SyncStats, SyncTrigger, Syncer, SyncerEvent,
    SyncerEventHandler, SyncerState,
};
pub use transport::{
    CommitRequest, CommitResponse, CommitResult, GetUpdatesRequest, MockServerConnection,
    ServerConnection, ServerEntity, UpdatesResponse,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
