//! The sync loop.
//!
//! A dedicated thread waits for a trigger (poll timer, nudge, reachability
//! regained, fresh authentication), then runs one cycle: download updates
//! since the persisted cursor and apply them, then commit unsynced entries.
//!
//! ## Key Invariants
//!
//! - Server updates win over unsynced local edits
//! - An entry's dirty flag is cleared only if it did not change while its
//!   commit was in flight
//! - The cancel flag is checked before every cycle and around every request

use crate::auth::AuthToken;
use crate::changes::{NudgeSource, Nudger};
use crate::config::SyncConfig;
use crate::connection::ServerConnectionManager;
use crate::context::SessionContext;
use crate::error::{SyncError, SyncResult};
use crate::transport::{CommitRequest, CommitResult, GetUpdatesRequest, ServerEntity};
use crate::worker::WorkerThread;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use synctree_core::{
    BaseTransaction, Directory, EntryKernel, Metahandle, WriteTransaction, WriterTag,
};
use tracing::{debug, error, info, warn};

/// Why a cycle runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// The poll interval elapsed.
    Poll,
    /// A nudge came due.
    Nudge(NudgeSource),
    /// The server became reachable again.
    ReachabilityRegained,
    /// An authentication just succeeded.
    AuthSucceeded,
    /// The previous cycle left work behind.
    Continuation,
}

/// Current activity of the sync loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncerState {
    /// Waiting for a trigger.
    Idle,
    /// Downloading and applying updates.
    Downloading,
    /// Committing unsynced entries.
    Committing,
    /// Waiting to retry after a failed cycle.
    RetryWait,
    /// The loop has exited.
    Stopped,
}

/// Outcome of one successful cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncCycleSnapshot {
    /// Entries the server accepted.
    pub commits: usize,
    /// Server updates applied locally.
    pub updates_applied: usize,
    /// Entries still waiting to be committed.
    pub unsynced_count: usize,
    /// Updates that overrode local edits plus commits the server rejected.
    pub conflicting_count: usize,
    /// The cycle stopped early and another one follows right away.
    pub has_more_to_sync: bool,
    /// The directory has finished its initial download.
    pub is_share_usable: bool,
}

/// Statistics about the sync loop.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Cycles started.
    pub cycles_started: u64,
    /// Cycles finished without error.
    pub cycles_completed: u64,
    /// Server updates applied.
    pub updates_applied: u64,
    /// Entries committed.
    pub commits: u64,
    /// Conflicts seen.
    pub conflicts_encountered: u64,
    /// Cycles that failed.
    pub failures: u64,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Events reported by the sync loop.
#[derive(Debug, Clone)]
pub enum SyncerEvent {
    /// A cycle is starting.
    SyncStarted(SyncTrigger),
    /// A cycle finished.
    CycleEnded(SyncCycleSnapshot),
    /// A cycle failed.
    CycleFailed {
        /// Error message.
        message: String,
        /// Failed cycles in a row.
        consecutive_errors: u32,
        /// The server was unreachable or answered with an error.
        server_failure: bool,
        /// Another attempt is scheduled after a backoff. When false, only the
        /// next poll or trigger retries.
        will_retry: bool,
    },
    /// The server rejected the session token.
    AuthenticationRequired,
}

/// Receives [`SyncerEvent`]s on the sync loop thread.
pub trait SyncerEventHandler: Send + Sync {
    /// Handles one event.
    fn handle_syncer_event(&self, event: SyncerEvent);
}

/// Coalesces nudges into one pending deadline.
#[derive(Debug, Default)]
pub struct NudgeCoalescer {
    pending: Option<(Instant, NudgeSource)>,
}

impl NudgeCoalescer {
    /// Creates a coalescer with nothing pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a cycle at `now + delay`. A pending earlier deadline absorbs
    /// the request. Returns true if the deadline moved.
    pub fn request(&mut self, now: Instant, delay: Duration, source: NudgeSource) -> bool {
        let at = now + delay;
        match self.pending {
            Some((pending, _)) if pending <= at => false,
            _ => {
                self.pending = Some((at, source));
                true
            }
        }
    }

    /// The pending deadline.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.map(|(at, _)| at)
    }

    /// Takes the pending nudge if it is due.
    pub fn take_due(&mut self, now: Instant) -> Option<NudgeSource> {
        match self.pending {
            Some((at, source)) if at <= now => {
                self.pending = None;
                Some(source)
            }
            _ => None,
        }
    }
}

struct Schedule {
    state: SyncerState,
    nudge: NudgeCoalescer,
    immediate: Option<SyncTrigger>,
    next_poll: Instant,
    consecutive_errors: u32,
    stats: SyncStats,
}

struct SyncerShared {
    config: SyncConfig,
    context: Arc<SessionContext>,
    connection: Arc<ServerConnectionManager>,
    handler: Arc<dyn SyncerEventHandler>,
    schedule: Mutex<Schedule>,
    wake: Condvar,
    cancelled: AtomicBool,
}

/// Handle to the sync loop thread.
pub struct Syncer {
    shared: Arc<SyncerShared>,
    worker: Mutex<Option<WorkerThread>>,
}

impl Syncer {
    /// Starts the sync loop thread.
    ///
    /// The loop does nothing until the session has a directory, a token and
    /// a reachable server.
    pub fn start(
        config: SyncConfig,
        context: Arc<SessionContext>,
        connection: Arc<ServerConnectionManager>,
        handler: Arc<dyn SyncerEventHandler>,
    ) -> SyncResult<Self> {
        let next_poll = Instant::now() + config.poll_interval;
        let shared = Arc::new(SyncerShared {
            config,
            context,
            connection,
            handler,
            schedule: Mutex::new(Schedule {
                state: SyncerState::Idle,
                nudge: NudgeCoalescer::new(),
                immediate: None,
                next_poll,
                consecutive_errors: 0,
                stats: SyncStats::default(),
            }),
            wake: Condvar::new(),
            cancelled: AtomicBool::new(false),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            WorkerThread::spawn("synctree-syncer", move || shared.run())?
        };
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// A nudger that schedules cycles on this loop.
    pub fn nudger(&self) -> Arc<dyn Nudger> {
        Arc::clone(&self.shared) as Arc<dyn Nudger>
    }

    /// Requests a cycle within `delay`.
    pub fn nudge(&self, delay: Duration, source: NudgeSource) {
        self.shared.nudge(delay, source);
    }

    /// Requests a cycle right away.
    pub fn trigger(&self, trigger: SyncTrigger) {
        let mut schedule = self.shared.schedule.lock();
        schedule.immediate = Some(trigger);
        self.shared.wake.notify_all();
    }

    /// Current activity.
    pub fn state(&self) -> SyncerState {
        self.shared.schedule.lock().state
    }

    /// Statistics so far.
    pub fn stats(&self) -> SyncStats {
        self.shared.schedule.lock().stats.clone()
    }

    /// Cancels the loop and waits up to `timeout` for the thread to exit.
    pub fn stop(&self, timeout: Duration) -> SyncResult<()> {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        {
            let _schedule = self.shared.schedule.lock();
            self.shared.wake.notify_all();
        }
        let worker = self.worker.lock().take();
        match worker {
            Some(worker) => worker.join(timeout),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Syncer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Syncer")
            .field("state", &self.state())
            .field("cancelled", &self.shared.cancelled.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Nudger for SyncerShared {
    fn nudge(&self, delay: Duration, source: NudgeSource) {
        let mut schedule = self.schedule.lock();
        if schedule.nudge.request(Instant::now(), delay, source) {
            debug!(?source, delay_ms = delay.as_millis() as u64, "nudge scheduled");
            self.wake.notify_all();
        }
    }
}

impl SyncerShared {
    fn run(&self) {
        info!("sync loop started");
        while let Some(trigger) = self.wait_for_trigger() {
            self.run_cycle(trigger);
        }
        self.set_state(SyncerState::Stopped);
        info!("sync loop exited");
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: SyncerState) {
        self.schedule.lock().state = state;
    }

    fn wait_for_trigger(&self) -> Option<SyncTrigger> {
        let mut schedule = self.schedule.lock();
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return None;
            }
            let now = Instant::now();
            if let Some(trigger) = schedule.immediate.take() {
                return Some(trigger);
            }
            if let Some(source) = schedule.nudge.take_due(now) {
                return Some(SyncTrigger::Nudge(source));
            }
            if now >= schedule.next_poll {
                schedule.next_poll = now + self.config.poll_interval;
                return Some(SyncTrigger::Poll);
            }
            let deadline = schedule
                .nudge
                .deadline()
                .map_or(schedule.next_poll, |at| at.min(schedule.next_poll));
            self.wake.wait_until(&mut schedule, deadline);
        }
    }

    fn run_cycle(&self, trigger: SyncTrigger) {
        let Some(directory) = self.context.directory() else {
            debug!(?trigger, "no directory yet; skipping cycle");
            return;
        };
        let Some(token) = self.context.auth_token() else {
            debug!(?trigger, "not authenticated; skipping cycle");
            return;
        };
        if !self.connection.is_reachable() {
            debug!(?trigger, "server unreachable; skipping cycle");
            return;
        }

        self.schedule.lock().stats.cycles_started += 1;
        debug!(?trigger, "sync cycle starting");
        self.handler
            .handle_syncer_event(SyncerEvent::SyncStarted(trigger));

        let result = self.sync_cycle(&directory, &token);
        match result {
            Ok(snapshot) => {
                {
                    let mut schedule = self.schedule.lock();
                    schedule.state = SyncerState::Idle;
                    schedule.consecutive_errors = 0;
                    schedule.stats.cycles_completed += 1;
                    schedule.stats.updates_applied += snapshot.updates_applied as u64;
                    schedule.stats.commits += snapshot.commits as u64;
                    schedule.stats.conflicts_encountered += snapshot.conflicting_count as u64;
                    schedule.stats.last_error = None;
                    if snapshot.has_more_to_sync {
                        schedule.immediate.get_or_insert(SyncTrigger::Continuation);
                    }
                }
                info!(
                    commits = snapshot.commits,
                    updates = snapshot.updates_applied,
                    unsynced = snapshot.unsynced_count,
                    conflicts = snapshot.conflicting_count,
                    more = snapshot.has_more_to_sync,
                    "sync cycle ended"
                );
                self.handler
                    .handle_syncer_event(SyncerEvent::CycleEnded(snapshot));
            }
            Err(SyncError::Cancelled) => {
                debug!("sync cycle cancelled");
            }
            Err(SyncError::AuthenticationRequired) => {
                self.set_state(SyncerState::Idle);
                warn!("server rejected the session token");
                self.context.invalidate_token();
                self.handler
                    .handle_syncer_event(SyncerEvent::AuthenticationRequired);
            }
            Err(e) => self.handle_error(&e),
        }
    }

    /// Schedules the next attempt: a backoff for retryable errors until
    /// `max_attempts` is reached, otherwise the regular poll.
    fn handle_error(&self, error: &SyncError) {
        if self.cancelled.load(Ordering::SeqCst) {
            debug!(error = %error, "sync cycle failed during shutdown");
            return;
        }
        let retry = &self.config.retry;
        let (consecutive_errors, will_retry) = {
            let mut schedule = self.schedule.lock();
            schedule.consecutive_errors += 1;
            let attempts = schedule.consecutive_errors;
            let will_retry = error.is_retryable() && attempts < retry.max_attempts;
            let delay = if will_retry {
                retry.delay_for_attempt(attempts)
            } else {
                self.config.poll_interval
            };
            schedule.next_poll = Instant::now() + delay;
            schedule.state = if will_retry {
                SyncerState::RetryWait
            } else {
                SyncerState::Idle
            };
            schedule.stats.failures += 1;
            schedule.stats.last_error = Some(error.to_string());
            (attempts, will_retry)
        };
        if will_retry {
            warn!(error = %error, consecutive_errors, "sync cycle failed");
        } else {
            error!(error = %error, consecutive_errors, "sync cycle failed; waiting for the next trigger");
        }
        self.handler.handle_syncer_event(SyncerEvent::CycleFailed {
            message: error.to_string(),
            consecutive_errors,
            server_failure: error.is_server_failure(),
            will_retry,
        });
    }

    fn sync_cycle(&self, directory: &Directory, token: &AuthToken) -> SyncResult<SyncCycleSnapshot> {
        let mut snapshot = SyncCycleSnapshot::default();

        self.check_cancelled()?;
        self.set_state(SyncerState::Downloading);
        self.download_updates(directory, token, &mut snapshot)?;

        if !directory.initial_sync_ended()? {
            self.check_cancelled()?;
            directory.write(WriterTag::Syncer, |wtx| {
                wtx.set_initial_sync_ended(true);
                Ok(())
            })?;
            info!(directory = directory.name(), "initial sync ended");
        }

        self.check_cancelled()?;
        self.set_state(SyncerState::Committing);
        self.commit_unsynced(directory, token, &mut snapshot)?;

        snapshot.unsynced_count = directory.unsynced_count()?;
        snapshot.is_share_usable = directory.initial_sync_ended()?;
        Ok(snapshot)
    }

    fn download_updates(
        &self,
        directory: &Directory,
        token: &AuthToken,
        snapshot: &mut SyncCycleSnapshot,
    ) -> SyncResult<()> {
        loop {
            self.check_cancelled()?;
            let (cursor, birthday) = {
                let trans = directory.read()?;
                let info = trans.table().info();
                (info.download_cursor, info.store_birthday.clone())
            };

            let request = GetUpdatesRequest {
                client_id: self.context.client_id().to_owned(),
                token: token.clone(),
                cursor,
                limit: self.config.fetch_batch_size,
            };
            let response = self
                .connection
                .observe(self.connection.connection().get_updates(&request))?;
            self.check_cancelled()?;

            if let (Some(local), Some(remote)) = (&birthday, &response.store_birthday) {
                if local != remote {
                    return Err(SyncError::StoreBirthdayChanged {
                        local: local.clone(),
                        remote: remote.clone(),
                    });
                }
            }

            let entries = &response.entries;
            let (applied, conflicts) = directory.write(WriterTag::Syncer, |wtx| {
                let mut applied = 0;
                let mut conflicts = 0;
                for entity in entries {
                    match apply_update(wtx, entity)? {
                        UpdateOutcome::Applied => applied += 1,
                        UpdateOutcome::Overwrote => {
                            applied += 1;
                            conflicts += 1;
                        }
                        UpdateOutcome::Unapplicable => conflicts += 1,
                        UpdateOutcome::Skipped => {}
                    }
                }
                wtx.set_download_cursor(response.new_cursor);
                if response.store_birthday.is_some() {
                    wtx.set_store_birthday(response.store_birthday.clone());
                }
                Ok((applied, conflicts))
            })?;

            debug!(
                received = entries.len(),
                applied,
                conflicts,
                cursor = response.new_cursor,
                remaining = response.changes_remaining,
                "applied update batch"
            );
            snapshot.updates_applied += applied;
            snapshot.conflicting_count += conflicts;

            if response.changes_remaining == 0 || response.new_cursor == cursor {
                return Ok(());
            }
        }
    }

    fn commit_unsynced(
        &self,
        directory: &Directory,
        token: &AuthToken,
        snapshot: &mut SyncCycleSnapshot,
    ) -> SyncResult<()> {
        let mut attempted: HashSet<Metahandle> = HashSet::new();
        for round in 0.. {
            self.check_cancelled()?;
            let batch: Vec<EntryKernel> = {
                let trans = directory.read()?;
                let table = trans.table();
                table
                    .unsynced_handles()
                    .into_iter()
                    .filter(|mh| !attempted.contains(mh))
                    .filter_map(|mh| table.get(mh))
                    .filter(|entry| !entry.is_root() && entry.is_domain_object)
                    .take(self.config.commit_batch_size)
                    .cloned()
                    .collect()
            };
            if batch.is_empty() {
                return Ok(());
            }
            if round >= self.config.max_commit_batches_per_cycle {
                snapshot.has_more_to_sync = true;
                return Ok(());
            }
            attempted.extend(batch.iter().map(|entry| entry.metahandle));

            let request = CommitRequest {
                client_id: self.context.client_id().to_owned(),
                token: token.clone(),
                entries: batch.iter().map(to_server_entity).collect(),
            };
            let response = self
                .connection
                .observe(self.connection.connection().commit(&request))?;
            self.check_cancelled()?;

            let (committed, conflicts) = directory.write(WriterTag::Syncer, |wtx| {
                let mut committed = 0;
                let mut conflicts = 0;
                for (sent, result) in batch.iter().zip(&response.results) {
                    match result {
                        CommitResult::Success { id, new_version } if id == &sent.id => {
                            record_commit(wtx, sent, *new_version)?;
                            committed += 1;
                        }
                        CommitResult::Success { id, .. } => {
                            warn!(sent = %sent.id, got = %id, "commit result for a different id");
                        }
                        CommitResult::Conflict { id } => {
                            debug!(%id, "commit conflict");
                            conflicts += 1;
                        }
                        CommitResult::TransientError { id } => {
                            debug!(%id, "commit deferred by server");
                        }
                    }
                }
                Ok((committed, conflicts))
            })?;

            debug!(sent = batch.len(), committed, conflicts, "committed batch");
            snapshot.commits += committed;
            snapshot.conflicting_count += conflicts;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateOutcome {
    Applied,
    /// Applied over unsynced local edits.
    Overwrote,
    /// Parent missing or a cycle; left for a later cycle.
    Unapplicable,
    Skipped,
}

/// Applies one server entity inside a syncer transaction.
fn apply_update(
    wtx: &mut WriteTransaction<'_>,
    entity: &ServerEntity,
) -> synctree_core::CoreResult<UpdateOutcome> {
    if entity.id.is_root() {
        return Ok(UpdateOutcome::Skipped);
    }

    let existing = wtx
        .table()
        .get_by_id(&entity.id)
        .map(|e| (e.metahandle, e.server_version, e.is_unsynced));
    if let Some((_, server_version, _)) = existing {
        if entity.version <= server_version {
            return Ok(UpdateOutcome::Skipped);
        }
    } else if entity.is_deleted {
        return Ok(UpdateOutcome::Skipped);
    }

    let table = wtx.table();
    if !entity.is_deleted {
        let parent_ok = table
            .get_by_id(&entity.parent_id)
            .is_some_and(|p| p.is_live() && p.is_dir)
            && !table.is_descendant_or_self(&entity.parent_id, &entity.id);
        if !parent_ok {
            warn!(id = %entity.id, parent = %entity.parent_id, "update cannot be placed");
            return Ok(UpdateOutcome::Unapplicable);
        }
    }
    let predecessor = entity
        .predecessor_id
        .as_ref()
        .filter(|pred| {
            table.get_by_id(pred).is_some_and(|p| {
                p.is_live() && !p.is_root() && p.parent_id == entity.parent_id && p.id != entity.id
            })
        })
        .cloned();

    let (metahandle, overwrote) = match existing {
        Some((metahandle, _, is_unsynced)) => (metahandle, is_unsynced),
        None => (wtx.create_update_item(entity.id.clone())?, false),
    };
    let tag_free = entity.unique_tag.as_ref().map_or(true, |tag| {
        wtx.table()
            .get_by_tag(tag)
            .map_or(true, |owner| owner.metahandle == metahandle)
    });
    if !tag_free {
        warn!(id = %entity.id, "unique tag already taken; ignoring it");
    }

    let mut entry = wtx.entry_mut(metahandle)?;
    if entity.is_deleted {
        entry.put_is_del(true)?;
    } else {
        entry.put_name(&entity.name)?;
        entry.put_is_dir(entity.is_dir)?;
        entry.put_url(&entity.url)?;
        entry.put_favicon(&entity.favicon)?;
        if tag_free {
            entry.put_unique_tag(entity.unique_tag.clone())?;
        }
        entry.put_ordinal(entity.ordinal.clone())?;
        entry.put_is_domain_object(true)?;
        entry.put_parent_id(&entity.parent_id)?;
        entry.put_is_del(false)?;
        entry.put_predecessor(predecessor.as_ref())?;
    }
    entry.put_server_version(entity.version)?;
    entry.put_base_version(entity.version)?;
    entry.put_is_unsynced(false)?;

    if overwrote {
        debug!(id = %entity.id, "server update replaced unsynced local edits");
        Ok(UpdateOutcome::Overwrote)
    } else {
        Ok(UpdateOutcome::Applied)
    }
}

/// Records a successful commit of `sent`.
fn record_commit(
    wtx: &mut WriteTransaction<'_>,
    sent: &EntryKernel,
    new_version: i64,
) -> synctree_core::CoreResult<()> {
    let unchanged = match wtx.entry(sent.metahandle) {
        Some(current) => current == sent,
        None => return Ok(()),
    };
    let mut entry = wtx.entry_mut(sent.metahandle)?;
    entry.put_base_version(new_version)?;
    entry.put_server_version(new_version)?;
    if unchanged {
        entry.clear_unsynced()?;
    } else {
        debug!(id = %sent.id, "entry changed during commit; keeping it unsynced");
    }
    Ok(())
}

fn to_server_entity(entry: &EntryKernel) -> ServerEntity {
    ServerEntity {
        id: entry.id.clone(),
        parent_id: entry.parent_id.clone(),
        predecessor_id: entry.prev_id.clone(),
        name: entry.name.clone(),
        is_dir: entry.is_dir,
        url: entry.url.clone(),
        favicon: entry.favicon.clone(),
        is_deleted: entry.is_del,
        version: entry.base_version,
        unique_tag: entry.unique_tag.clone(),
        ordinal: entry.ordinal.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockServerConnection;
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::thread;
    use synctree_core::{SyncId, WriteNode};

    struct ChannelHandler(Mutex<Sender<SyncerEvent>>);

    impl SyncerEventHandler for ChannelHandler {
        fn handle_syncer_event(&self, event: SyncerEvent) {
            let _ = self.0.lock().send(event);
        }
    }

    struct Harness {
        server: Arc<MockServerConnection>,
        directory: Arc<Directory>,
        syncer: Syncer,
        events: Receiver<SyncerEvent>,
    }

    fn harness(config: SyncConfig) -> Harness {
        let server = Arc::new(MockServerConnection::new());
        let context = Arc::new(SessionContext::new("client-1"));
        let directory = Arc::new(Directory::open_in_memory("alice").unwrap());
        context.attach_directory(Arc::clone(&directory));
        context
            .record_authentication("alice", AuthToken::new("token"))
            .unwrap();
        let connection = Arc::new(ServerConnectionManager::new(server.clone(), "mock://"));
        assert!(connection.check_server_reachable());

        let (tx, events) = mpsc::channel();
        let syncer = Syncer::start(
            config.with_poll_interval(Duration::from_secs(3600)),
            context,
            connection,
            Arc::new(ChannelHandler(Mutex::new(tx))),
        )
        .unwrap();
        Harness {
            server,
            directory,
            syncer,
            events,
        }
    }

    fn next_cycle_end(events: &Receiver<SyncerEvent>) -> SyncCycleSnapshot {
        loop {
            match events.recv_timeout(Duration::from_secs(5)).unwrap() {
                SyncerEvent::CycleEnded(snapshot) => return snapshot,
                SyncerEvent::CycleFailed { message, .. } => panic!("cycle failed: {message}"),
                _ => {}
            }
        }
    }

    fn local_folder(dir: &Directory, title: &str) -> Metahandle {
        dir.write(WriterTag::SyncApi, |wtx| {
            let mut node = WriteNode::init_by_creation(wtx, Metahandle::ROOT, None)?;
            node.set_title(title)?;
            Ok(node.id())
        })
        .unwrap()
    }

    #[test]
    fn nudge_coalescer_keeps_earliest() {
        let now = Instant::now();
        let mut nudges = NudgeCoalescer::new();
        assert!(nudges.request(now, Duration::from_millis(200), NudgeSource::Local));
        for i in 1..10 {
            assert!(!nudges.request(
                now + Duration::from_millis(i),
                Duration::from_millis(200),
                NudgeSource::Local
            ));
        }
        assert!(nudges.request(now, Duration::ZERO, NudgeSource::Notification));

        assert_eq!(nudges.take_due(now), Some(NudgeSource::Notification));
        assert_eq!(nudges.take_due(now + Duration::from_secs(1)), None);
        assert!(nudges.deadline().is_none());
    }

    #[test]
    fn download_then_commit() {
        let h = harness(SyncConfig::new());
        h.server
            .inject_update(ServerEntity::folder("s-1", SyncId::root(), "Remote"));
        let local = local_folder(&h.directory, "Local");

        h.syncer.trigger(SyncTrigger::Poll);
        let snapshot = next_cycle_end(&h.events);
        assert_eq!(snapshot.updates_applied, 1);
        assert_eq!(snapshot.commits, 1);
        assert_eq!(snapshot.unsynced_count, 0);
        assert!(snapshot.is_share_usable);

        let trans = h.directory.read().unwrap();
        assert!(trans.table().get_by_id(&SyncId::from("s-1")).is_some());
        let entry = trans.entry(local).unwrap();
        assert!(!entry.is_unsynced);
        assert_eq!(entry.base_version, 2);
        assert_eq!(h.server.committed().len(), 1);
        drop(trans);
        h.syncer.stop(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn server_wins_over_unsynced_edit() {
        let h = harness(SyncConfig::new());
        h.server
            .inject_update(ServerEntity::folder("s-1", SyncId::root(), "v1"));
        h.syncer.trigger(SyncTrigger::Poll);
        next_cycle_end(&h.events);

        // Local edit and a remote edit of the same entry.
        h.directory
            .write(WriterTag::SyncApi, |wtx| {
                let mh = wtx.table().handle_for_id(&SyncId::from("s-1"));
                WriteNode::init_by_id(wtx, mh)?.set_title("local")
            })
            .unwrap();
        h.server
            .inject_update(ServerEntity::folder("s-1", SyncId::root(), "remote"));

        h.syncer.trigger(SyncTrigger::Poll);
        let snapshot = next_cycle_end(&h.events);
        assert_eq!(snapshot.conflicting_count, 1);

        let trans = h.directory.read().unwrap();
        let entry = trans.entry_by_id(&SyncId::from("s-1")).unwrap();
        assert_eq!(entry.name, "remote");
        assert!(!entry.is_unsynced);
        drop(trans);
        h.syncer.stop(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn orphan_updates_are_not_applied() {
        let h = harness(SyncConfig::new());
        h.server
            .inject_update(ServerEntity::folder("child", "missing-parent", "x"));
        h.syncer.trigger(SyncTrigger::Poll);
        let snapshot = next_cycle_end(&h.events);
        assert_eq!(snapshot.updates_applied, 0);
        assert_eq!(snapshot.conflicting_count, 1);
        assert!(h
            .directory
            .read()
            .unwrap()
            .entry_by_id(&SyncId::from("child"))
            .is_none());
        h.syncer.stop(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn large_commits_continue_in_next_cycle() {
        let h = harness(
            SyncConfig::new()
                .with_commit_batch_size(2)
                .with_max_commit_batches_per_cycle(1),
        );
        for i in 0..3 {
            local_folder(&h.directory, &format!("f{i}"));
        }
        h.syncer.trigger(SyncTrigger::Poll);
        let first = next_cycle_end(&h.events);
        assert_eq!(first.commits, 2);
        assert!(first.has_more_to_sync);

        let second = next_cycle_end(&h.events);
        assert_eq!(second.commits, 1);
        assert!(!second.has_more_to_sync);
        assert_eq!(second.unsynced_count, 0);
        h.syncer.stop(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn failures_back_off_and_count() {
        let h = harness(
            SyncConfig::new().with_retry(
                crate::config::RetryConfig::new(3)
                    .with_initial_delay(Duration::from_millis(10))
                    .with_jitter(false),
            ),
        );
        h.server.fail_next(2);
        h.syncer.trigger(SyncTrigger::Poll);

        let mut failures = Vec::new();
        loop {
            match h.events.recv_timeout(Duration::from_secs(5)).unwrap() {
                SyncerEvent::CycleFailed {
                    consecutive_errors,
                    server_failure,
                    will_retry,
                    ..
                } => {
                    assert!(server_failure && will_retry);
                    failures.push(consecutive_errors);
                }
                SyncerEvent::CycleEnded(_) => break,
                _ => {}
            }
        }
        assert_eq!(failures, vec![1, 2]);
        assert_eq!(h.syncer.stats().failures, 2);
        h.syncer.stop(Duration::from_secs(5)).unwrap();
    }

    fn next_failure(events: &Receiver<SyncerEvent>) -> (u32, bool, bool) {
        loop {
            match events.recv_timeout(Duration::from_secs(5)).unwrap() {
                SyncerEvent::CycleFailed {
                    consecutive_errors,
                    server_failure,
                    will_retry,
                    ..
                } => return (consecutive_errors, server_failure, will_retry),
                SyncerEvent::CycleEnded(_) => panic!("cycle unexpectedly succeeded"),
                _ => {}
            }
        }
    }

    #[test]
    fn store_reset_waits_for_next_trigger() {
        let h = harness(
            SyncConfig::new().with_retry(
                crate::config::RetryConfig::new(5)
                    .with_initial_delay(Duration::from_millis(10))
                    .with_jitter(false),
            ),
        );
        h.syncer.trigger(SyncTrigger::Poll);
        next_cycle_end(&h.events);

        h.server.set_store_birthday("after-reset");
        h.syncer.trigger(SyncTrigger::Poll);
        assert_eq!(next_failure(&h.events), (1, true, false));

        // No backoff retry follows.
        thread::sleep(Duration::from_millis(200));
        assert!(h.events.try_recv().is_err());
        assert_eq!(h.syncer.state(), SyncerState::Idle);
        assert_eq!(h.syncer.stats().failures, 1);

        // An explicit trigger tries again.
        h.syncer.trigger(SyncTrigger::ReachabilityRegained);
        assert_eq!(next_failure(&h.events), (2, true, false));
        h.syncer.stop(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn retries_stop_after_max_attempts() {
        let h = harness(
            SyncConfig::new().with_retry(
                crate::config::RetryConfig::new(2)
                    .with_initial_delay(Duration::from_millis(10))
                    .with_jitter(false),
            ),
        );
        h.server.reject_next(10);
        h.syncer.trigger(SyncTrigger::Poll);
        assert_eq!(next_failure(&h.events), (1, true, true));
        assert_eq!(next_failure(&h.events), (2, true, false));

        thread::sleep(Duration::from_millis(200));
        assert!(h.events.try_recv().is_err());
        assert_eq!(h.syncer.stats().failures, 2);
        h.syncer.stop(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn expired_token_is_reported() {
        let h = harness(SyncConfig::new());
        h.server.expire_token(&AuthToken::new("token"));
        h.syncer.trigger(SyncTrigger::Poll);
        loop {
            if let SyncerEvent::AuthenticationRequired =
                h.events.recv_timeout(Duration::from_secs(5)).unwrap()
            {
                break;
            }
        }
        h.syncer.stop(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn stop_exits_idle_loop() {
        let h = harness(SyncConfig::new());
        h.syncer.stop(Duration::from_secs(5)).unwrap();
        assert_eq!(h.syncer.state(), SyncerState::Stopped);
        // A second stop is harmless.
        h.syncer.stop(Duration::from_secs(5)).unwrap();
    }
}
