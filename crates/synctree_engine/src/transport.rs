//! Server connection abstraction.
//!
//! The wire protocol lives outside this crate. The sync loop only needs two
//! fallible calls: fetch updates since a cursor, and commit a batch of
//! unsynced entries.

use crate::auth::AuthToken;
use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use synctree_core::{Ordinal, SyncId};

/// One entry as the server sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntity {
    /// Server id.
    pub id: SyncId,
    /// Server id of the parent.
    pub parent_id: SyncId,
    /// Server id of the previous sibling, `None` for the first child.
    pub predecessor_id: Option<SyncId>,
    /// Server-legal name.
    pub name: String,
    /// Folder flag.
    pub is_dir: bool,
    /// URL payload.
    pub url: String,
    /// Favicon payload.
    pub favicon: Vec<u8>,
    /// Tombstone flag.
    pub is_deleted: bool,
    /// Server version in updates; the client's base version in commits.
    pub version: i64,
    /// Server-defined unique tag.
    pub unique_tag: Option<String>,
    /// Sibling position key, if the server tracks one.
    pub ordinal: Option<Ordinal>,
}

impl ServerEntity {
    /// A folder under `parent_id`, placed first.
    pub fn folder(id: impl Into<SyncId>, parent_id: impl Into<SyncId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: parent_id.into(),
            predecessor_id: None,
            name: name.into(),
            is_dir: true,
            url: String::new(),
            favicon: Vec::new(),
            is_deleted: false,
            version: 0,
            unique_tag: None,
            ordinal: None,
        }
    }

    /// A leaf with a URL under `parent_id`, placed first.
    pub fn leaf(
        id: impl Into<SyncId>,
        parent_id: impl Into<SyncId>,
        name: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            is_dir: false,
            url: url.into(),
            ..Self::folder(id, parent_id, name)
        }
    }

    /// Places this entity after `predecessor`.
    #[must_use]
    pub fn after(mut self, predecessor: impl Into<SyncId>) -> Self {
        self.predecessor_id = Some(predecessor.into());
        self
    }

    /// Sets the unique tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.unique_tag = Some(tag.into());
        self
    }

    /// Marks this entity deleted.
    #[must_use]
    pub fn deleted(mut self) -> Self {
        self.is_deleted = true;
        self
    }
}

/// Fetch updates since a cursor.
#[derive(Debug, Clone)]
pub struct GetUpdatesRequest {
    /// Requesting client.
    pub client_id: String,
    /// Session token.
    pub token: AuthToken,
    /// Position in the server's change log already applied locally.
    pub cursor: u64,
    /// Maximum entities to return.
    pub limit: usize,
}

/// Response to [`GetUpdatesRequest`].
#[derive(Debug, Clone, Default)]
pub struct UpdatesResponse {
    /// Changed entities, in log order.
    pub entries: Vec<ServerEntity>,
    /// Cursor to persist once the entries are applied.
    pub new_cursor: u64,
    /// Entities still waiting after this batch.
    pub changes_remaining: u64,
    /// Identifies the server's data store.
    pub store_birthday: Option<String>,
}

/// Commit a batch of unsynced entries.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    /// Requesting client.
    pub client_id: String,
    /// Session token.
    pub token: AuthToken,
    /// Entries to commit; `version` carries each entry's base version.
    pub entries: Vec<ServerEntity>,
}

/// Outcome for one committed entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitResult {
    /// Accepted at `new_version`.
    Success {
        /// Committed id.
        id: SyncId,
        /// Version assigned by the server.
        new_version: i64,
    },
    /// The server holds a newer version.
    Conflict {
        /// Rejected id.
        id: SyncId,
    },
    /// Not processed; retry later.
    TransientError {
        /// Skipped id.
        id: SyncId,
    },
}

/// Response to [`CommitRequest`], one result per entry in request order.
#[derive(Debug, Clone, Default)]
pub struct CommitResponse {
    /// Per-entry results.
    pub results: Vec<CommitResult>,
}

/// A connection to the sync server.
///
/// Implementations may block; they are only called from the sync loop and
/// reachability threads.
pub trait ServerConnection: Send + Sync {
    /// Probes whether the server answers at all.
    fn check_reachable(&self) -> bool;

    /// Fetches updates since `request.cursor`.
    fn get_updates(&self, request: &GetUpdatesRequest) -> SyncResult<UpdatesResponse>;

    /// Commits entries.
    fn commit(&self, request: &CommitRequest) -> SyncResult<CommitResponse>;
}

#[derive(Debug, Default)]
struct ServerState {
    log: Vec<ServerEntity>,
    latest: HashMap<SyncId, ServerEntity>,
    next_version: i64,
}

impl ServerState {
    fn publish(&mut self, mut entity: ServerEntity) -> i64 {
        self.next_version += 1;
        entity.version = self.next_version;
        self.latest.insert(entity.id.clone(), entity.clone());
        self.log.push(entity);
        self.next_version
    }
}

/// An in-memory sync server for tests.
#[derive(Debug)]
pub struct MockServerConnection {
    reachable: AtomicBool,
    state: Mutex<ServerState>,
    rejected_tokens: Mutex<HashSet<String>>,
    fail_remaining: AtomicUsize,
    reject_remaining: AtomicUsize,
    birthday: Mutex<String>,
    update_delay: Mutex<Duration>,
    get_updates_calls: AtomicUsize,
    commit_calls: AtomicUsize,
    committed: Mutex<Vec<ServerEntity>>,
}

impl MockServerConnection {
    /// Store birthday reported by the mock.
    pub const BIRTHDAY: &'static str = "mock-birthday";

    /// Creates a reachable, empty server.
    pub fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            state: Mutex::new(ServerState::default()),
            rejected_tokens: Mutex::new(HashSet::new()),
            fail_remaining: AtomicUsize::new(0),
            reject_remaining: AtomicUsize::new(0),
            birthday: Mutex::new(Self::BIRTHDAY.to_owned()),
            update_delay: Mutex::new(Duration::ZERO),
            get_updates_calls: AtomicUsize::new(0),
            commit_calls: AtomicUsize::new(0),
            committed: Mutex::new(Vec::new()),
        }
    }

    /// Sets whether requests reach the server.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Publishes a change made by another client. Returns its version.
    pub fn inject_update(&self, entity: ServerEntity) -> i64 {
        self.state.lock().publish(entity)
    }

    /// Latest version of `id` on the server.
    pub fn entity(&self, id: &SyncId) -> Option<ServerEntity> {
        self.state.lock().latest.get(id).cloned()
    }

    /// Rejects `token` with [`SyncError::AuthenticationRequired`].
    pub fn expire_token(&self, token: &AuthToken) {
        self.rejected_tokens.lock().insert(token.as_str().to_owned());
    }

    /// Fails the next `count` requests with a retryable transport error.
    pub fn fail_next(&self, count: usize) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Answers the next `count` requests with [`SyncError::ServerError`].
    pub fn reject_next(&self, count: usize) {
        self.reject_remaining.store(count, Ordering::SeqCst);
    }

    /// Replaces the store birthday, as if the server's data were reset.
    pub fn set_store_birthday(&self, birthday: impl Into<String>) {
        *self.birthday.lock() = birthday.into();
    }

    /// Delays every update download.
    pub fn set_update_delay(&self, delay: Duration) {
        *self.update_delay.lock() = delay;
    }

    /// Number of update downloads so far.
    pub fn get_updates_calls(&self) -> usize {
        self.get_updates_calls.load(Ordering::SeqCst)
    }

    /// Number of commit requests so far.
    pub fn commit_calls(&self) -> usize {
        self.commit_calls.load(Ordering::SeqCst)
    }

    /// Every entity accepted by a commit, in order.
    pub fn committed(&self) -> Vec<ServerEntity> {
        self.committed.lock().clone()
    }

    fn admit(&self, token: &AuthToken) -> SyncResult<()> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(SyncError::NotConnected);
        }
        if self.rejected_tokens.lock().contains(token.as_str()) {
            return Err(SyncError::AuthenticationRequired);
        }
        let injected = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SyncError::transport_retryable("injected failure"));
        }
        let rejected = self
            .reject_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(SyncError::ServerError("injected server error".into()));
        }
        Ok(())
    }
}

impl Default for MockServerConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerConnection for MockServerConnection {
    fn check_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn get_updates(&self, request: &GetUpdatesRequest) -> SyncResult<UpdatesResponse> {
        self.get_updates_calls.fetch_add(1, Ordering::SeqCst);
        self.admit(&request.token)?;
        let delay = *self.update_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let state = self.state.lock();
        let start = usize::try_from(request.cursor)
            .unwrap_or(usize::MAX)
            .min(state.log.len());
        let end = start.saturating_add(request.limit).min(state.log.len());
        Ok(UpdatesResponse {
            entries: state.log[start..end].to_vec(),
            new_cursor: end as u64,
            changes_remaining: (state.log.len() - end) as u64,
            store_birthday: Some(self.birthday.lock().clone()),
        })
    }

    fn commit(&self, request: &CommitRequest) -> SyncResult<CommitResponse> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        self.admit(&request.token)?;

        let mut state = self.state.lock();
        let mut results = Vec::with_capacity(request.entries.len());
        for entity in &request.entries {
            let current = state.latest.get(&entity.id).map_or(0, |e| e.version);
            if current > entity.version {
                results.push(CommitResult::Conflict {
                    id: entity.id.clone(),
                });
                continue;
            }
            let new_version = state.publish(entity.clone());
            self.committed.lock().push(entity.clone());
            results.push(CommitResult::Success {
                id: entity.id.clone(),
                new_version,
            });
        }
        Ok(CommitResponse { results })
    }
}
