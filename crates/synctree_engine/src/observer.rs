//! Callbacks from a sync session to application code.

use crate::auth::AuthFailure;
use crate::changes::ChangeRecord;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use synctree_core::ReadTransaction;

/// Authentication outcome reported to the observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Authentication succeeded; any earlier error is cleared.
    None,
    /// Username, secret or cached token rejected.
    InvalidCredentials,
    /// A captcha must be answered before retrying.
    CaptchaRequired {
        /// Challenge token.
        token: String,
        /// Absolute URL of the challenge.
        url: String,
    },
    /// The authentication service could not be reached.
    ConnectionFailed,
    /// The account is not set up for sync.
    UserNotRegistered,
    /// A different user signed in than the one this session belongs to.
    IdentityMismatch {
        /// User the session belongs to.
        expected: String,
        /// User that signed in.
        actual: String,
    },
    /// The signed-in user's directory could not be opened.
    DirectoryUnavailable(String),
}

impl From<AuthFailure> for AuthError {
    fn from(failure: AuthFailure) -> Self {
        match failure {
            AuthFailure::InvalidCredentials => AuthError::InvalidCredentials,
            AuthFailure::CaptchaRequired { token, url } => AuthError::CaptchaRequired { token, url },
            AuthFailure::ConnectionFailed => AuthError::ConnectionFailed,
            AuthFailure::UserNotRegistered => AuthError::UserNotRegistered,
        }
    }
}

/// Receives session events.
///
/// Callbacks run on engine threads (the sync loop for changes and cycles, the
/// auth worker for auth errors) and must not block for long.
pub trait SyncObserver: Send + Sync {
    /// Server changes were applied. `trans` sees the directory right after the
    /// applying transaction; `changes` are in tree order.
    ///
    /// `trans` holds the directory's read lock for the whole call. Read
    /// through it; opening another transaction on the same directory from
    /// inside the callback can deadlock. Writes must wait until it returns.
    fn on_changes_applied(&self, trans: &ReadTransaction<'_>, changes: &[ChangeRecord]);

    /// A sync cycle finished with nothing left to sync.
    fn on_sync_cycle_completed(&self);

    /// An authentication attempt finished.
    fn on_auth_error(&self, error: &AuthError);

    /// The session became usable. Fires once per session.
    fn on_initialization_complete(&self);
}

/// One callback recorded by [`RecordingObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedEvent {
    /// `on_changes_applied`.
    ChangesApplied(Vec<ChangeRecord>),
    /// `on_sync_cycle_completed`.
    SyncCycleCompleted,
    /// `on_auth_error`.
    AuthError(AuthError),
    /// `on_initialization_complete`.
    InitializationComplete,
}

/// Observer that records every callback, for tests.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
    changed: Condvar,
}

impl RecordingObserver {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events so far.
    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().clone()
    }

    /// Number of events matching `filter`.
    pub fn count(&self, filter: impl Fn(&ObservedEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| filter(e)).count()
    }

    /// Number of `on_changes_applied` calls.
    pub fn changes_applied_count(&self) -> usize {
        self.count(|e| matches!(e, ObservedEvent::ChangesApplied(_)))
    }

    /// Every auth error reported, `None` included.
    pub fn auth_errors(&self) -> Vec<AuthError> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ObservedEvent::AuthError(error) => Some(error.clone()),
                _ => None,
            })
            .collect()
    }

    /// Waits until `condition` holds for the recorded events.
    pub fn wait_for(
        &self,
        condition: impl Fn(&[ObservedEvent]) -> bool,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock();
        while !condition(&events) {
            if self.changed.wait_until(&mut events, deadline).timed_out() {
                return condition(&events);
            }
        }
        true
    }

    fn record(&self, event: ObservedEvent) {
        self.events.lock().push(event);
        self.changed.notify_all();
    }
}

impl SyncObserver for RecordingObserver {
    fn on_changes_applied(&self, _trans: &ReadTransaction<'_>, changes: &[ChangeRecord]) {
        self.record(ObservedEvent::ChangesApplied(changes.to_vec()));
    }

    fn on_sync_cycle_completed(&self) {
        self.record(ObservedEvent::SyncCycleCompleted);
    }

    fn on_auth_error(&self, error: &AuthError) {
        self.record(ObservedEvent::AuthError(error.clone()));
    }

    fn on_initialization_complete(&self) {
        self.record(ObservedEvent::InitializationComplete);
    }
}
