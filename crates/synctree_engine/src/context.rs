//! State shared by the components of one sync session.

use crate::auth::AuthToken;
use crate::error::{SyncError, SyncResult};
use crate::observer::SyncObserver;
use crate::status::StatusAggregator;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use synctree_core::Directory;

#[derive(Default)]
struct Identity {
    username: Option<String>,
    token: Option<AuthToken>,
}

/// Session state handed to every component at construction.
///
/// The validated identity and the initialization flag each sit behind their
/// own mutex; neither lock is held across I/O or callbacks.
pub struct SessionContext {
    client_id: String,
    identity: Mutex<Identity>,
    initialization_complete: Mutex<bool>,
    directory: RwLock<Option<Arc<Directory>>>,
    observer: RwLock<Option<Arc<dyn SyncObserver>>>,
    status: StatusAggregator,
}

impl SessionContext {
    /// Creates an empty session for `client_id`.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            identity: Mutex::new(Identity::default()),
            initialization_complete: Mutex::new(false),
            directory: RwLock::new(None),
            observer: RwLock::new(None),
            status: StatusAggregator::new(),
        }
    }

    /// Identifier sent with server requests.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Records a validated identity and its token.
    ///
    /// The first call fixes the username for the session; later calls must
    /// name the same user and only refresh the token.
    pub fn record_authentication(&self, username: &str, token: AuthToken) -> SyncResult<()> {
        let mut identity = self.identity.lock();
        match &identity.username {
            Some(expected) if expected != username => Err(SyncError::IdentityMismatch {
                expected: expected.clone(),
                actual: username.to_owned(),
            }),
            _ => {
                identity.username = Some(username.to_owned());
                identity.token = Some(token);
                Ok(())
            }
        }
    }

    /// Drops the token after the server rejected it. The username stays.
    pub fn invalidate_token(&self) {
        self.identity.lock().token = None;
    }

    /// The validated username, if any.
    pub fn authenticated_username(&self) -> Option<String> {
        self.identity.lock().username.clone()
    }

    /// The current token, if any.
    pub fn auth_token(&self) -> Option<AuthToken> {
        self.identity.lock().token.clone()
    }

    /// Sets the initialization flag. Returns true only for the call that
    /// actually set it.
    pub fn mark_initialization_complete(&self) -> bool {
        let mut complete = self.initialization_complete.lock();
        !std::mem::replace(&mut *complete, true)
    }

    /// Whether initialization has completed.
    pub fn is_initialization_complete(&self) -> bool {
        *self.initialization_complete.lock()
    }

    /// The session's directory, once one is attached.
    pub fn directory(&self) -> Option<Arc<Directory>> {
        self.directory.read().clone()
    }

    /// Attaches the directory. Returns false if one was already attached.
    pub fn attach_directory(&self, directory: Arc<Directory>) -> bool {
        let mut slot = self.directory.write();
        if slot.is_some() {
            return false;
        }
        *slot = Some(directory);
        true
    }

    /// Detaches and returns the directory.
    pub fn detach_directory(&self) -> Option<Arc<Directory>> {
        self.directory.write().take()
    }

    /// The registered observer.
    pub fn observer(&self) -> Option<Arc<dyn SyncObserver>> {
        self.observer.read().clone()
    }

    /// Replaces the observer.
    pub fn set_observer(&self, observer: Option<Arc<dyn SyncObserver>>) {
        *self.observer.write() = observer;
    }

    /// The status aggregator.
    pub fn status(&self) -> &StatusAggregator {
        &self.status
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("client_id", &self.client_id)
            .field("username", &self.identity.lock().username)
            .field("initialization_complete", &self.is_initialization_complete())
            .field("has_directory", &self.directory.read().is_some())
            .finish_non_exhaustive()
    }
}
