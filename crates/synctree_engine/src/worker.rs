//! Named worker threads with a bounded join.

use crate::error::{SyncError, SyncResult};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

/// A background thread that reports when its body returns.
///
/// `std::thread::JoinHandle::join` blocks without limit; shutdown needs to
/// give up on a stuck thread instead.
#[derive(Debug)]
pub(crate) struct WorkerThread {
    name: String,
    handle: Option<JoinHandle<()>>,
    done: Receiver<()>,
}

impl WorkerThread {
    /// Spawns `body` on a thread called `name`.
    pub(crate) fn spawn<F>(name: &str, body: F) -> SyncResult<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (done_tx, done) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                body();
                let _ = done_tx.send(());
            })?;
        debug!(thread = name, "worker started");
        Ok(Self {
            name: name.to_owned(),
            handle: Some(handle),
            done,
        })
    }

    /// Waits up to `timeout` for the thread to finish.
    ///
    /// On timeout the thread is detached and keeps running.
    pub(crate) fn join(mut self, timeout: Duration) -> SyncResult<()> {
        match self.done.recv_timeout(timeout) {
            // A dropped sender without a message means the body panicked.
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let Some(handle) = self.handle.take() else {
                    return Ok(());
                };
                handle
                    .join()
                    .map_err(|_| SyncError::ThreadPanicked(self.name.clone()))?;
                debug!(thread = %self.name, "worker joined");
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => Err(SyncError::ThreadJoinTimeout {
                thread: self.name.clone(),
                timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn join_finished_thread() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let worker = WorkerThread::spawn("quick", move || flag.store(true, Ordering::SeqCst))
            .unwrap();
        worker.join(Duration::from_secs(5)).unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn join_times_out_on_stuck_thread() {
        let release = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&release);
        let worker = WorkerThread::spawn("stuck", move || {
            while !flag.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(5));
            }
        })
        .unwrap();

        let err = worker.join(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, SyncError::ThreadJoinTimeout { ref thread, .. } if thread == "stuck"));
        release.store(true, Ordering::SeqCst);
    }

    #[test]
    fn join_reports_panic() {
        let worker = WorkerThread::spawn("boom", || panic!("worker failure")).unwrap();
        let err = worker.join(Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, SyncError::ThreadPanicked(_)));
    }
}
