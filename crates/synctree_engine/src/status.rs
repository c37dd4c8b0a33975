//! Aggregated session status.

use crate::syncer::SyncCycleSnapshot;
use parking_lot::Mutex;
use serde::Serialize;

/// One-word summary of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSummary {
    /// Not connected; nothing waiting to be committed.
    Offline,
    /// Not connected; local changes are waiting.
    OfflineUnsynced,
    /// Connected and working.
    Syncing,
    /// Connected and up to date.
    Ready,
    /// Connected but conflicts keep items from committing.
    Conflict,
    /// Not connected and the initial download never finished.
    OfflineUnusable,
    /// The session has been shut down.
    Invalid,
}

/// Detailed session status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    /// Summary derived from the other fields.
    pub summary: StatusSummary,
    /// A validated identity is present.
    pub authenticated: bool,
    /// The last request got a well-formed answer.
    pub server_up: bool,
    /// The last probe reached the server.
    pub server_reachable: bool,
    /// The peer notification channel is running.
    pub notifications_enabled: bool,
    /// Peer notifications received.
    pub notifications_received: u64,
    /// Peer notifications sent.
    pub notifications_sent: u64,
    /// Peer notification attempts that failed.
    pub notifications_failed: u64,
    /// Entries waiting to be committed.
    pub unsynced_count: usize,
    /// Entries that conflicted in the last cycle.
    pub conflicting_count: usize,
    /// A cycle is running or about to.
    pub syncing: bool,
    /// The initial download has completed at least once.
    pub initial_sync_ended: bool,
    /// The last cycle made no progress on conflicting entries.
    pub syncer_stuck: bool,
    /// Server updates applied over the session.
    pub updates_received: u64,
    /// Longest run of failed cycles seen.
    pub max_consecutive_errors: u32,
    /// Current run of failed cycles.
    pub consecutive_errors: u32,
    /// The last failure gets no backoff retry; the next trigger retries.
    pub retries_exhausted: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            summary: StatusSummary::OfflineUnusable,
            authenticated: false,
            server_up: false,
            server_reachable: false,
            notifications_enabled: false,
            notifications_received: 0,
            notifications_sent: 0,
            notifications_failed: 0,
            unsynced_count: 0,
            conflicting_count: 0,
            syncing: false,
            initial_sync_ended: false,
            syncer_stuck: false,
            updates_received: 0,
            max_consecutive_errors: 0,
            consecutive_errors: 0,
            retries_exhausted: false,
        }
    }
}

impl Status {
    /// Derives the summary from the raw fields.
    pub fn compute_summary(&self) -> StatusSummary {
        let online = self.authenticated && self.server_reachable && self.server_up;
        if online {
            if self.syncer_stuck || self.conflicting_count > 0 {
                StatusSummary::Conflict
            } else if self.syncing || self.unsynced_count > 0 {
                StatusSummary::Syncing
            } else {
                StatusSummary::Ready
            }
        } else if !self.initial_sync_ended {
            StatusSummary::OfflineUnusable
        } else if self.unsynced_count > 0 {
            StatusSummary::OfflineUnsynced
        } else {
            StatusSummary::Offline
        }
    }
}

/// Collects status updates from every component.
#[derive(Debug, Default)]
pub struct StatusAggregator {
    inner: Mutex<StatusInner>,
}

#[derive(Debug, Default)]
struct StatusInner {
    status: Status,
    invalid: bool,
}

impl StatusAggregator {
    /// Creates an aggregator for a fresh session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot with the summary filled in.
    pub fn status(&self) -> Status {
        let inner = self.inner.lock();
        let mut status = inner.status.clone();
        status.summary = if inner.invalid {
            StatusSummary::Invalid
        } else {
            status.compute_summary()
        };
        status
    }

    /// Summary only.
    pub fn summary(&self) -> StatusSummary {
        self.status().summary
    }

    fn update(&self, f: impl FnOnce(&mut Status)) {
        f(&mut self.inner.lock().status);
    }

    /// Records the authentication state.
    pub fn set_authenticated(&self, authenticated: bool) {
        self.update(|s| s.authenticated = authenticated);
    }

    /// Records the outcome of a reachability probe.
    pub fn set_server_reachable(&self, reachable: bool) {
        self.update(|s| {
            s.server_reachable = reachable;
            if !reachable {
                s.server_up = false;
            }
        });
    }

    /// Records whether the server answered the last request.
    pub fn set_server_up(&self, up: bool) {
        self.update(|s| s.server_up = up);
    }

    /// Records the directory's initial-sync flag and unsynced count.
    pub fn set_directory_state(&self, initial_sync_ended: bool, unsynced_count: usize) {
        self.update(|s| {
            s.initial_sync_ended = initial_sync_ended;
            s.unsynced_count = unsynced_count;
        });
    }

    /// A cycle is starting.
    pub fn cycle_started(&self) {
        self.update(|s| s.syncing = true);
    }

    /// A cycle finished.
    pub fn cycle_ended(&self, snapshot: &SyncCycleSnapshot) {
        self.update(|s| {
            s.syncing = snapshot.has_more_to_sync;
            s.server_up = true;
            s.server_reachable = true;
            s.unsynced_count = snapshot.unsynced_count;
            s.conflicting_count = snapshot.conflicting_count;
            s.initial_sync_ended |= snapshot.is_share_usable;
            s.updates_received += snapshot.updates_applied as u64;
            s.syncer_stuck = snapshot.conflicting_count > 0
                && snapshot.commits == 0
                && snapshot.updates_applied == 0;
            s.consecutive_errors = 0;
            s.retries_exhausted = false;
        });
    }

    /// A cycle failed. A server failure takes the session offline until a
    /// cycle succeeds.
    pub fn cycle_failed(&self, consecutive_errors: u32, server_failure: bool, will_retry: bool) {
        self.update(|s| {
            s.syncing = false;
            s.consecutive_errors = consecutive_errors;
            s.max_consecutive_errors = s.max_consecutive_errors.max(consecutive_errors);
            s.retries_exhausted = !will_retry;
            if server_failure {
                s.server_up = false;
            }
        });
    }

    /// Records the notification channel's counters.
    pub fn set_notifications(&self, enabled: bool, sent: u64, failed: u64) {
        self.update(|s| {
            s.notifications_enabled = enabled;
            s.notifications_sent = sent;
            s.notifications_failed = failed;
        });
    }

    /// A peer notification arrived.
    pub fn notification_received(&self) {
        self.update(|s| s.notifications_received += 1);
    }

    /// The session is shutting down; every later summary is `Invalid`.
    pub fn invalidate(&self) {
        self.inner.lock().invalid = true;
    }
}
