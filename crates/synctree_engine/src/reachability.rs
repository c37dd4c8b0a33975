//! Network reachability watcher.
//!
//! A backend reports raw network changes; the watcher debounces them on its
//! own thread and tells a [`ReachabilityListener`] to probe the server or
//! mark it unreachable.

use crate::error::SyncResult;
use crate::worker::WorkerThread;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Longest single wait on the backend, so cancellation is noticed quickly.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// A raw network change reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkChange {
    /// The local interface or address table changed; reachability unknown.
    AddressTableChanged,
    /// The platform reports the network as reachable.
    Reachable,
    /// The platform reports the network as gone.
    Unreachable,
}

/// Source of network changes.
pub trait ReachabilityBackend: Send {
    /// Blocks up to `timeout` for the next change.
    fn wait_for_change(&mut self, timeout: Duration) -> Option<NetworkChange>;
}

/// Receives debounced reachability signals on the watcher thread.
pub trait ReachabilityListener: Send + Sync {
    /// The network may be back; probe the server.
    fn on_reachable(&self);
    /// The network is gone; mark the server unreachable without probing.
    fn on_unreachable(&self);
}

/// Backend driven by a [`FakeReachabilityController`].
#[derive(Debug)]
pub struct FakeReachabilityBackend {
    changes: Receiver<NetworkChange>,
}

/// Injects changes into a [`FakeReachabilityBackend`].
#[derive(Debug, Clone)]
pub struct FakeReachabilityController {
    changes: Sender<NetworkChange>,
}

/// Creates a connected fake backend and its controller.
pub fn fake_reachability() -> (FakeReachabilityBackend, FakeReachabilityController) {
    let (changes_tx, changes) = mpsc::channel();
    (
        FakeReachabilityBackend { changes },
        FakeReachabilityController {
            changes: changes_tx,
        },
    )
}

impl ReachabilityBackend for FakeReachabilityBackend {
    fn wait_for_change(&mut self, timeout: Duration) -> Option<NetworkChange> {
        match self.changes.recv_timeout(timeout) {
            Ok(change) => Some(change),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                thread::sleep(timeout);
                None
            }
        }
    }
}

impl FakeReachabilityController {
    /// Injects one change.
    pub fn send(&self, change: NetworkChange) {
        let _ = self.changes.send(change);
    }

    /// Injects an address table change.
    pub fn address_table_changed(&self) {
        self.send(NetworkChange::AddressTableChanged);
    }

    /// Injects a reachable or unreachable report.
    pub fn set_reachable(&self, reachable: bool) {
        self.send(if reachable {
            NetworkChange::Reachable
        } else {
            NetworkChange::Unreachable
        });
    }
}

/// Portable backend that reports an address table change every interval.
#[derive(Debug)]
pub struct IntervalReachabilityBackend {
    interval: Duration,
    next: Instant,
}

impl IntervalReachabilityBackend {
    /// Creates a backend that fires first after `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now() + interval,
        }
    }
}

impl ReachabilityBackend for IntervalReachabilityBackend {
    fn wait_for_change(&mut self, timeout: Duration) -> Option<NetworkChange> {
        let now = Instant::now();
        if now < self.next {
            thread::sleep(timeout.min(self.next - now));
        }
        let now = Instant::now();
        if now >= self.next {
            self.next = now + self.interval;
            Some(NetworkChange::AddressTableChanged)
        } else {
            None
        }
    }
}

/// Runs a backend on a background thread and dispatches debounced changes.
pub struct ReachabilityWatcher {
    cancelled: Arc<AtomicBool>,
    worker: Mutex<Option<WorkerThread>>,
}

impl ReachabilityWatcher {
    /// Starts the watcher thread.
    ///
    /// The listener gets one `on_reachable` right away so the server is
    /// probed at startup. After that, a change opens a debounce window;
    /// changes inside it replace the pending one and the last one wins.
    pub fn start(
        mut backend: Box<dyn ReachabilityBackend>,
        listener: Arc<dyn ReachabilityListener>,
        debounce: Duration,
    ) -> SyncResult<Self> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let worker = {
            let cancelled = Arc::clone(&cancelled);
            WorkerThread::spawn("synctree-reachability", move || {
                watch(backend.as_mut(), listener.as_ref(), debounce, &cancelled);
            })?
        };
        Ok(Self {
            cancelled,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Stops the thread, waiting up to `timeout`.
    pub fn stop(&self, timeout: Duration) -> SyncResult<()> {
        self.cancelled.store(true, Ordering::SeqCst);
        match self.worker.lock().take() {
            Some(worker) => worker.join(timeout),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ReachabilityWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReachabilityWatcher")
            .field("cancelled", &self.cancelled.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

fn watch(
    backend: &mut dyn ReachabilityBackend,
    listener: &dyn ReachabilityListener,
    debounce: Duration,
    cancelled: &AtomicBool,
) {
    info!("reachability watcher started");
    if !cancelled.load(Ordering::SeqCst) {
        listener.on_reachable();
    }

    let mut pending: Option<(Instant, NetworkChange)> = None;
    while !cancelled.load(Ordering::SeqCst) {
        let timeout = match pending {
            Some((at, _)) => at.saturating_duration_since(Instant::now()).min(WAIT_SLICE),
            None => WAIT_SLICE,
        };
        if let Some(change) = backend.wait_for_change(timeout) {
            debug!(?change, "network change");
            pending = Some(match pending {
                Some((at, _)) => (at, change),
                None => (Instant::now() + debounce, change),
            });
        }

        if cancelled.load(Ordering::SeqCst) {
            break;
        }
        if let Some((at, change)) = pending {
            if Instant::now() >= at {
                pending = None;
                dispatch(listener, change);
            }
        }
    }
    info!("reachability watcher exited");
}

fn dispatch(listener: &dyn ReachabilityListener, change: NetworkChange) {
    match change {
        NetworkChange::AddressTableChanged | NetworkChange::Reachable => listener.on_reachable(),
        NetworkChange::Unreachable => listener.on_unreachable(),
    }
}
