//! Change notification pipeline.
//!
//! [`ChangeProcessor`] listens to the session's directory. Local writes that
//! leave dirty entries behind nudge the sync loop; writes by the sync loop are
//! classified, buffered until the transaction completes, and delivered to the
//! observer as one tree-ordered batch.

use crate::context::SessionContext;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use synctree_core::{
    BaseTransaction, CalculateChangesEvent, Directory, DirectoryChangeListener, EntryTable,
    Metahandle, WriterTag,
};
use tracing::{debug, trace, warn};

/// Kind of change delivered to the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// The entry did not exist, or was a tombstone, before.
    Add,
    /// The entry exists in both snapshots and an observed field changed.
    Update,
    /// The entry existed before and is a tombstone now.
    Delete,
}

/// One change delivered to the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChangeRecord {
    /// Changed entry.
    pub id: Metahandle,
    /// What happened to it.
    pub change_type: ChangeType,
    /// Parent or next sibling changed (updates only).
    pub position_changed: bool,
}

/// Why the sync loop is being nudged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NudgeSource {
    /// Local edits are waiting to be committed.
    Local,
    /// A peer announced changes on the server.
    Notification,
}

/// Something that can schedule a sync cycle.
pub trait Nudger: Send + Sync {
    /// Requests a cycle within `delay`. Must not block.
    fn nudge(&self, delay: Duration, source: NudgeSource);
}

/// Buffers the changes of one transaction and orders them for delivery.
#[derive(Debug, Default)]
pub struct ChangeReorderBuffer {
    operations: BTreeMap<Metahandle, (ChangeType, bool)>,
}

impl ChangeReorderBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an addition.
    pub fn push_added(&mut self, id: Metahandle) {
        self.operations.insert(id, (ChangeType::Add, false));
    }

    /// Records a deletion.
    pub fn push_deleted(&mut self, id: Metahandle) {
        self.operations.insert(id, (ChangeType::Delete, false));
    }

    /// Records an update.
    pub fn push_updated(&mut self, id: Metahandle, position_changed: bool) {
        self.operations
            .insert(id, (ChangeType::Update, position_changed));
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Number of buffered changes.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Drops every buffered change.
    pub fn clear(&mut self) {
        self.operations.clear();
    }

    /// Orders the buffered changes against `table`.
    ///
    /// Deletions come first, deepest entries before their ancestors. Then
    /// additions and updates in pre-order, so a parent always precedes its
    /// children and siblings keep their list order.
    pub fn into_tree_order(self, table: &EntryTable) -> Vec<ChangeRecord> {
        let mut deletions = Vec::new();
        let mut others = Vec::new();
        for (id, (change_type, position_changed)) in self.operations {
            if table.get(id).is_none() {
                warn!(%id, "buffered change for unknown entry");
                continue;
            }
            let record = ChangeRecord {
                id,
                change_type,
                position_changed,
            };
            match change_type {
                ChangeType::Delete => deletions.push((table.depth(id), record)),
                ChangeType::Add | ChangeType::Update => others.push((tree_path(table, id), record)),
            }
        }

        deletions.sort_by(|(da, a), (db, b)| db.cmp(da).then(a.id.cmp(&b.id)));
        others.sort_by(|(pa, a), (pb, b)| pa.cmp(pb).then(a.id.cmp(&b.id)));

        deletions
            .into_iter()
            .map(|(_, r)| r)
            .chain(others.into_iter().map(|(_, r)| r))
            .collect()
    }
}

/// Sibling indexes from the root down to `id`.
fn tree_path(table: &EntryTable, id: Metahandle) -> Vec<usize> {
    let mut path = Vec::new();
    let mut current = table.get(id);
    while let Some(kernel) = current {
        if kernel.is_root() || path.len() > table.len() {
            break;
        }
        let index = table
            .child_handles(&kernel.parent_id)
            .iter()
            .position(|h| *h == kernel.metahandle)
            .unwrap_or(usize::MAX);
        path.push(index);
        current = table.get_by_id(&kernel.parent_id);
    }
    path.reverse();
    path
}

/// Directory listener that feeds the sync loop and the observer.
pub struct ChangeProcessor {
    context: Weak<SessionContext>,
    directory: Weak<Directory>,
    nudger: Arc<dyn Nudger>,
    nudge_delay: Duration,
    buffer: Mutex<ChangeReorderBuffer>,
    enabled: AtomicBool,
}

impl ChangeProcessor {
    /// Creates a processor for `directory`.
    pub fn new(
        context: &Arc<SessionContext>,
        directory: &Arc<Directory>,
        nudger: Arc<dyn Nudger>,
        nudge_delay: Duration,
    ) -> Self {
        Self {
            context: Arc::downgrade(context),
            directory: Arc::downgrade(directory),
            nudger,
            nudge_delay,
            buffer: Mutex::new(ChangeReorderBuffer::new()),
            enabled: AtomicBool::new(true),
        }
    }

    /// Stops all further nudges and deliveries and drops buffered changes.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.buffer.lock().clear();
        debug!("change processor disabled");
    }

    /// Whether the processor still delivers changes.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn handle_local_changes(&self, event: &CalculateChangesEvent<'_>) {
        let exists_unsynced = event
            .changed_handles()
            .filter_map(|id| event.current(id))
            .any(|entry| !entry.is_root() && entry.is_domain_object && entry.is_unsynced);
        if exists_unsynced {
            trace!(delay_ms = self.nudge_delay.as_millis() as u64, "nudging for local changes");
            self.nudger.nudge(self.nudge_delay, NudgeSource::Local);
        }
    }

    fn handle_syncer_changes(&self, event: &CalculateChangesEvent<'_>) {
        let mut buffer = self.buffer.lock();
        if !buffer.is_empty() {
            warn!(pending = buffer.len(), "calculating changes with undelivered changes");
        }
        for id in event.changed_handles() {
            let Some(current) = event.current(id) else {
                continue;
            };
            if current.is_root() || !current.is_domain_object {
                continue;
            }
            let existed_before = event.original(id).is_some_and(|o| o.is_live());
            let exists_now = current.is_live();

            match (existed_before, exists_now) {
                (false, true) => buffer.push_added(id),
                (true, false) => buffer.push_deleted(id),
                (true, true) => {
                    if let Some(original) = event.original(id) {
                        if original.observed_fields_differ(current) {
                            buffer.push_updated(id, original.position_differs(current));
                        }
                    }
                }
                (false, false) => {}
            }
        }
    }
}

impl DirectoryChangeListener for ChangeProcessor {
    fn calculate_changes(&self, event: &CalculateChangesEvent<'_>) {
        if !self.is_enabled() {
            return;
        }
        match event.writer() {
            WriterTag::SyncApi => self.handle_local_changes(event),
            WriterTag::Syncer => self.handle_syncer_changes(event),
            WriterTag::Unittest => {}
        }
    }

    fn transaction_complete(&self, writer: WriterTag) {
        if writer != WriterTag::Syncer {
            return;
        }
        let buffer = std::mem::take(&mut *self.buffer.lock());
        if buffer.is_empty() || !self.is_enabled() {
            return;
        }
        let (Some(directory), Some(context)) = (self.directory.upgrade(), self.context.upgrade())
        else {
            return;
        };
        let Some(observer) = context.observer() else {
            return;
        };
        let trans = match directory.read() {
            Ok(trans) => trans,
            Err(e) => {
                debug!(error = %e, "directory gone before changes could be delivered");
                return;
            }
        };
        let changes = buffer.into_tree_order(trans.table());
        if changes.is_empty() || !self.is_enabled() {
            return;
        }
        debug!(count = changes.len(), "delivering applied changes");
        // Observers read through `trans` and must not open their own.
        observer.on_changes_applied(&trans, &changes);
        drop(trans);
        trace!("applied changes delivered");
    }
}

impl fmt::Debug for ChangeProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeProcessor")
            .field("nudge_delay", &self.nudge_delay)
            .field("enabled", &self.is_enabled())
            .field("buffered", &self.buffer.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{AuthError, ObservedEvent, RecordingObserver, SyncObserver};
    use synctree_core::{ReadNode, ReadTransaction, SyncId, WriteNode};

    #[derive(Default)]
    struct CountingNudger(Mutex<Vec<(Duration, NudgeSource)>>);

    impl Nudger for CountingNudger {
        fn nudge(&self, delay: Duration, source: NudgeSource) {
            self.0.lock().push((delay, source));
        }
    }

    struct Fixture {
        context: Arc<SessionContext>,
        directory: Arc<Directory>,
        nudger: Arc<CountingNudger>,
        observer: Arc<RecordingObserver>,
        processor: Arc<ChangeProcessor>,
    }

    fn fixture() -> Fixture {
        let context = Arc::new(SessionContext::new("client"));
        let directory = Arc::new(Directory::open_in_memory("alice").unwrap());
        let nudger = Arc::new(CountingNudger::default());
        let observer = Arc::new(RecordingObserver::new());
        context.set_observer(Some(observer.clone()));
        let processor = Arc::new(ChangeProcessor::new(
            &context,
            &directory,
            nudger.clone(),
            Duration::from_millis(200),
        ));
        directory.set_change_listener(Some(processor.clone()));
        Fixture {
            context,
            directory,
            nudger,
            observer,
            processor,
        }
    }

    fn server_folder(dir: &Directory, id: &str, parent: &str, pred: Option<&str>) -> Metahandle {
        dir.write(WriterTag::Syncer, |wtx| {
            let mh = wtx.create_update_item(SyncId::from(id))?;
            let mut entry = wtx.entry_mut(mh)?;
            entry.put_is_dir(true)?;
            entry.put_is_domain_object(true)?;
            entry.put_name(id)?;
            entry.put_parent_id(&SyncId::from(parent))?;
            entry.put_is_del(false)?;
            entry.put_predecessor(pred.map(SyncId::from).as_ref())?;
            Ok(mh)
        })
        .unwrap()
    }

    #[derive(Default)]
    struct TitleReader(Mutex<Vec<String>>);

    impl SyncObserver for TitleReader {
        fn on_changes_applied(&self, trans: &ReadTransaction<'_>, changes: &[ChangeRecord]) {
            let mut titles = self.0.lock();
            for change in changes {
                if let Ok(node) = ReadNode::by_id(trans, change.id) {
                    titles.push(node.title());
                }
            }
        }

        fn on_sync_cycle_completed(&self) {}

        fn on_auth_error(&self, _error: &AuthError) {}

        fn on_initialization_complete(&self) {}
    }

    fn last_batch(observer: &RecordingObserver) -> Vec<ChangeRecord> {
        observer
            .events()
            .into_iter()
            .rev()
            .find_map(|e| match e {
                ObservedEvent::ChangesApplied(changes) => Some(changes),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn local_edits_nudge() {
        let f = fixture();
        f.directory
            .write(WriterTag::SyncApi, |wtx| {
                WriteNode::init_by_creation(wtx, Metahandle::ROOT, None).map(|_| ())
            })
            .unwrap();
        // Not a domain object, so not worth a cycle.
        f.directory
            .write(WriterTag::SyncApi, |wtx| {
                let mh = wtx.create(&SyncId::root(), "meta")?;
                wtx.entry_mut(mh)?.put_is_unsynced(true).map(|_| ())
            })
            .unwrap();

        let nudges = f.nudger.0.lock().clone();
        assert_eq!(nudges, vec![(Duration::from_millis(200), NudgeSource::Local)]);
        assert_eq!(f.observer.changes_applied_count(), 0);
    }

    #[test]
    fn syncer_changes_are_classified() {
        let f = fixture();
        let a = server_folder(&f.directory, "s-a", "r", None);
        assert_eq!(
            last_batch(&f.observer),
            vec![ChangeRecord {
                id: a,
                change_type: ChangeType::Add,
                position_changed: false
            }]
        );

        f.directory
            .write(WriterTag::Syncer, |wtx| wtx.entry_mut(a)?.put_name("renamed").map(|_| ()))
            .unwrap();
        assert_eq!(
            last_batch(&f.observer),
            vec![ChangeRecord {
                id: a,
                change_type: ChangeType::Update,
                position_changed: false
            }]
        );

        // Version bumps alone are not observed.
        f.directory
            .write(WriterTag::Syncer, |wtx| wtx.entry_mut(a)?.put_server_version(9).map(|_| ()))
            .unwrap();
        assert_eq!(f.observer.changes_applied_count(), 2);

        f.directory
            .write(WriterTag::Syncer, |wtx| wtx.entry_mut(a)?.put_is_del(true).map(|_| ()))
            .unwrap();
        assert_eq!(last_batch(&f.observer)[0].change_type, ChangeType::Delete);
        assert!(f.nudger.0.lock().is_empty());
    }

    #[test]
    fn observer_reads_through_delivered_transaction() {
        let f = fixture();
        let reader = Arc::new(TitleReader::default());
        f.context.set_observer(Some(reader.clone()));

        let a = server_folder(&f.directory, "s-a", "r", None);
        assert_eq!(*reader.0.lock(), vec!["s-a".to_owned()]);

        // The read lock is gone once delivery returns.
        f.directory
            .write(WriterTag::Syncer, |wtx| wtx.entry_mut(a)?.put_name("renamed").map(|_| ()))
            .unwrap();
        assert_eq!(*reader.0.lock(), vec!["s-a".to_owned(), "renamed".to_owned()]);
        assert!(f.directory.read().is_ok());
    }

    #[test]
    fn batch_is_tree_ordered() {
        let f = fixture();
        let (parent, first, second) = f
            .directory
            .write(WriterTag::Syncer, |wtx| {
                let mut add = |id: &str, parent: &str, pred: Option<&str>| {
                    let mh = wtx.create_update_item(SyncId::from(id))?;
                    let mut entry = wtx.entry_mut(mh)?;
                    entry.put_is_dir(true)?;
                    entry.put_is_domain_object(true)?;
                    entry.put_parent_id(&SyncId::from(parent))?;
                    entry.put_is_del(false)?;
                    entry.put_predecessor(pred.map(SyncId::from).as_ref())?;
                    Ok::<_, synctree_core::CoreError>(mh)
                };
                // Children created before their parent is placed.
                let parent = add("p", "r", None)?;
                let second = add("c2", "p", None)?;
                let first = add("c1", "p", None)?;
                Ok((parent, first, second))
            })
            .unwrap();

        let order: Vec<_> = last_batch(&f.observer).iter().map(|r| r.id).collect();
        assert_eq!(order, vec![parent, first, second]);

        f.directory
            .write(WriterTag::Syncer, |wtx| {
                wtx.entry_mut(first)?.put_is_del(true)?;
                wtx.entry_mut(second)?.put_is_del(true)?;
                wtx.entry_mut(parent)?.put_is_del(true).map(|_| ())
            })
            .unwrap();
        let deleted: Vec<_> = last_batch(&f.observer).iter().map(|r| r.id).collect();
        assert_eq!(deleted.last(), Some(&parent));
        assert_eq!(deleted.len(), 3);
    }

    #[test]
    fn moves_flag_position() {
        let f = fixture();
        let a = server_folder(&f.directory, "s-a", "r", None);
        let b = server_folder(&f.directory, "s-b", "r", Some("s-a"));

        f.directory
            .write(WriterTag::Syncer, |wtx| wtx.entry_mut(b)?.put_parent_id(&SyncId::from("s-a")).map(|_| ()))
            .unwrap();
        let batch = last_batch(&f.observer);
        let moved = batch.iter().find(|r| r.id == b).unwrap();
        assert_eq!(moved.change_type, ChangeType::Update);
        assert!(moved.position_changed);
        // a lost its next sibling.
        assert!(batch.iter().any(|r| r.id == a && r.position_changed));
    }

    #[test]
    fn disabled_processor_delivers_nothing() {
        let f = fixture();
        f.processor.disable();
        server_folder(&f.directory, "s-a", "r", None);
        assert_eq!(f.observer.changes_applied_count(), 0);
        drop(f.context);
    }

    #[test]
    fn reorder_buffer_skips_unknown_entries() {
        let table = EntryTable::new();
        let mut buffer = ChangeReorderBuffer::new();
        buffer.push_added(Metahandle::new(42));
        assert_eq!(buffer.len(), 1);
        assert!(buffer.into_tree_order(&table).is_empty());
    }
}
