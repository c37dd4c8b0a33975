//! Peer notification channel.
//!
//! Tells other clients that something changed, independently of the sync
//! protocol. Sends run on a dedicated thread and are never retried inside a
//! cycle: a failed send leaves the notification pending for the next cycle.

use crate::error::{SyncError, SyncResult};
use crate::worker::WorkerThread;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// External peer signalling service.
pub trait PeerNotifier: Send + Sync {
    /// Signals peers that this client committed changes.
    fn send_notification(&self) -> SyncResult<()>;
    /// Signs out of the service.
    fn logout(&self);
}

/// Counters reported to the status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotificationStats {
    /// The channel thread is running.
    pub enabled: bool,
    /// Successful sends.
    pub sent: u64,
    /// Failed sends.
    pub failed: u64,
}

enum Command {
    Send,
    Logout,
}

#[derive(Default)]
struct Counters {
    pending: AtomicBool,
    sent: AtomicU64,
    failed: AtomicU64,
}

/// Runs a [`PeerNotifier`] on its own thread.
pub struct NotificationChannel {
    commands: Mutex<Option<Sender<Command>>>,
    worker: Mutex<Option<WorkerThread>>,
    counters: Arc<Counters>,
}

impl NotificationChannel {
    /// Starts the channel thread.
    pub fn start(notifier: Arc<dyn PeerNotifier>) -> SyncResult<Self> {
        let (commands_tx, commands) = mpsc::channel::<Command>();
        let counters = Arc::new(Counters::default());
        let worker = {
            let counters = Arc::clone(&counters);
            WorkerThread::spawn("synctree-notifier", move || {
                for command in commands {
                    match command {
                        Command::Send => match notifier.send_notification() {
                            Ok(()) => {
                                counters.sent.fetch_add(1, Ordering::SeqCst);
                                debug!("peer notification sent");
                            }
                            Err(e) => {
                                counters.failed.fetch_add(1, Ordering::SeqCst);
                                counters.pending.store(true, Ordering::SeqCst);
                                warn!(error = %e, "peer notification failed");
                            }
                        },
                        Command::Logout => {
                            notifier.logout();
                            debug!("peer notifier logged out");
                        }
                    }
                }
            })?
        };
        Ok(Self {
            commands: Mutex::new(Some(commands_tx)),
            worker: Mutex::new(Some(worker)),
            counters,
        })
    }

    /// Reports a finished cycle. Queues at most one send attempt.
    pub fn on_cycle_ended(&self, commits: usize) {
        if commits > 0 {
            self.counters.pending.store(true, Ordering::SeqCst);
        }
        if self.counters.pending.swap(false, Ordering::SeqCst) && !self.post(Command::Send) {
            self.counters.pending.store(true, Ordering::SeqCst);
        }
    }

    /// Whether a notification is waiting for the next cycle.
    pub fn is_pending(&self) -> bool {
        self.counters.pending.load(Ordering::SeqCst)
    }

    /// Whether the channel thread accepts commands.
    pub fn is_enabled(&self) -> bool {
        self.commands.lock().is_some()
    }

    /// Current counters.
    pub fn stats(&self) -> NotificationStats {
        NotificationStats {
            enabled: self.is_enabled(),
            sent: self.counters.sent.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
        }
    }

    /// Queues a logout.
    pub fn logout(&self) {
        self.post(Command::Logout);
    }

    /// Closes the command queue and waits up to `timeout` for the thread.
    pub fn shutdown(&self, timeout: Duration) -> SyncResult<()> {
        self.commands.lock().take();
        match self.worker.lock().take() {
            Some(worker) => worker.join(timeout),
            None => Ok(()),
        }
    }

    fn post(&self, command: Command) -> bool {
        match self.commands.lock().as_ref() {
            Some(commands) => commands.send(command).is_ok(),
            None => false,
        }
    }
}

impl fmt::Debug for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationChannel")
            .field("stats", &self.stats())
            .field("pending", &self.is_pending())
            .finish_non_exhaustive()
    }
}

/// A [`PeerNotifier`] for tests.
#[derive(Debug, Default)]
pub struct MockPeerNotifier {
    fail_remaining: AtomicUsize,
    sent: AtomicUsize,
    logged_out: AtomicBool,
}

impl MockPeerNotifier {
    /// Creates a notifier whose sends succeed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `count` sends.
    pub fn fail_next(&self, count: usize) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Successful sends so far.
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    /// Whether `logout` was called.
    pub fn logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }
}

impl PeerNotifier for MockPeerNotifier {
    fn send_notification(&self) -> SyncResult<()> {
        let fail = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(SyncError::transport_retryable("notification refused"));
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn logout(&self) {
        self.logged_out.store(true, Ordering::SeqCst);
    }
}
