//! The session orchestrator.
//!
//! [`SyncManager`] owns every component of one sync session and wires them
//! together: components report to the manager through events and never call
//! into each other.
//!
//! ## Startup
//!
//! `initialize` opens the settings file, starts the notifier, sync loop and
//! auth worker, then the reachability watcher, and finally queues an
//! authentication attempt. The directory for a user is opened only once that
//! user has been authenticated.
//!
//! ## Shutdown
//!
//! Components stop in a fixed order: change delivery, auth worker, sync
//! loop, notifier, reachability watcher, directories. A sync loop that does
//! not exit within the thread-exit timeout is an error.

use crate::auth::{
    AuthEvent, AuthEventHandler, AuthFailure, AuthRequest, AuthState, AuthToken, AuthWatcher,
    Authenticator, CaptchaAnswer,
};
use crate::changes::{ChangeProcessor, NudgeSource};
use crate::config::SyncConfig;
use crate::connection::ServerConnectionManager;
use crate::context::SessionContext;
use crate::error::{SyncError, SyncResult};
use crate::notifier::{NotificationChannel, PeerNotifier};
use crate::observer::{AuthError, SyncObserver};
use crate::reachability::{
    IntervalReachabilityBackend, ReachabilityBackend, ReachabilityListener, ReachabilityWatcher,
};
use crate::settings::UserSettings;
use crate::status::{Status, StatusSummary};
use crate::syncer::{SyncCycleSnapshot, SyncTrigger, Syncer, SyncerEvent, SyncerEventHandler};
use crate::transport::ServerConnection;
use parking_lot::Mutex;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use synctree_core::{Directory, DirectoryChangeListener, DirectoryManager};
use tracing::{debug, error, info, warn};

/// Token recorded by [`SyncManager::setup_for_test_mode`].
const TEST_MODE_TOKEN: &str = "test-mode";

/// External services a session talks to.
pub struct Collaborators {
    /// Sync server.
    pub server: Arc<dyn ServerConnection>,
    /// Account service.
    pub authenticator: Arc<dyn Authenticator>,
    /// Source of network changes. `None` polls with an
    /// [`IntervalReachabilityBackend`] every `reachability_poll_interval`.
    pub reachability: Option<Box<dyn ReachabilityBackend>>,
    /// Peer signalling service.
    pub notifier: Arc<dyn PeerNotifier>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Where the first authentication attempt gets its credentials.
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// A username and secret supplied by the caller.
    Explicit {
        /// Account name.
        username: String,
        /// Account secret.
        secret: String,
    },
    /// The last user who signed in, with their cached token.
    LastKnownUser,
    /// Wait for an explicit [`SyncManager::authenticate`] call.
    None,
}

impl fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Explicit { username, .. } => f
                .debug_struct("Explicit")
                .field("username", username)
                .finish_non_exhaustive(),
            CredentialSource::LastKnownUser => f.write_str("LastKnownUser"),
            CredentialSource::None => f.write_str("None"),
        }
    }
}

/// Parameters for [`SyncManager::initialize`].
#[derive(Debug, Clone)]
pub struct InitParams {
    /// Name of the client application, for logs.
    pub identity: String,
    /// Folder holding the settings file and one directory per user.
    pub storage_location: PathBuf,
    /// Server endpoint, for logs and status.
    pub server_endpoint: String,
    /// Credentials for the first authentication.
    pub credential_source: CredentialSource,
}

impl InitParams {
    /// Creates parameters that wait for an explicit authentication.
    pub fn new(
        identity: impl Into<String>,
        storage_location: impl Into<PathBuf>,
        server_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            storage_location: storage_location.into(),
            server_endpoint: server_endpoint.into(),
            credential_source: CredentialSource::None,
        }
    }

    /// Sets the credential source.
    pub fn with_credentials(mut self, source: CredentialSource) -> Self {
        self.credential_source = source;
        self
    }
}

/// Components started by `initialize`.
struct Components {
    identity: String,
    settings: UserSettings,
    directories: DirectoryManager,
    connection: Arc<ServerConnectionManager>,
    notifier: NotificationChannel,
    syncer: Syncer,
    auth: AuthWatcher,
    reachability: Mutex<Option<ReachabilityWatcher>>,
    processor: Mutex<Option<Arc<ChangeProcessor>>>,
}

struct ManagerInner {
    config: SyncConfig,
    context: Arc<SessionContext>,
    collaborators: Mutex<Option<Collaborators>>,
    components: Mutex<Option<Arc<Components>>>,
    shut_down: AtomicBool,
    reauth_attempted: AtomicBool,
}

/// Coordinates one sync session.
pub struct SyncManager {
    inner: Arc<ManagerInner>,
}

impl SyncManager {
    /// Creates a manager. Nothing starts until [`initialize`](Self::initialize).
    pub fn new(config: SyncConfig, collaborators: Collaborators) -> Self {
        let context = Arc::new(SessionContext::new(config.client_id.clone()));
        Self {
            inner: Arc::new(ManagerInner {
                config,
                context,
                collaborators: Mutex::new(Some(collaborators)),
                components: Mutex::new(None),
                shut_down: AtomicBool::new(false),
                reauth_attempted: AtomicBool::new(false),
            }),
        }
    }

    /// Starts the session's threads and the first authentication attempt.
    ///
    /// Blocks only to open the settings file. Fails with `AlreadyInitialized`
    /// on a second call and `NotInitialized` after shutdown.
    pub fn initialize(&self, params: InitParams) -> SyncResult<()> {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::SeqCst) {
            return Err(SyncError::NotInitialized);
        }
        let collaborators = inner
            .collaborators
            .lock()
            .take()
            .ok_or(SyncError::AlreadyInitialized)?;
        info!(
            identity = %params.identity,
            storage = %params.storage_location.display(),
            endpoint = %params.server_endpoint,
            "initializing sync manager"
        );

        let settings = UserSettings::open(&params.storage_location)?;
        let directories =
            DirectoryManager::new(&params.storage_location, inner.config.directory.clone());
        let connection = Arc::new(ServerConnectionManager::new(
            collaborators.server,
            params.server_endpoint,
        ));
        let events = Arc::new(ManagerEvents(Arc::downgrade(inner)));
        let timeout = inner.config.thread_exit_timeout;

        let notifier = NotificationChannel::start(collaborators.notifier)?;
        let syncer = match Syncer::start(
            inner.config.clone(),
            Arc::clone(&inner.context),
            Arc::clone(&connection),
            events.clone(),
        ) {
            Ok(syncer) => syncer,
            Err(e) => {
                let _ = notifier.shutdown(timeout);
                return Err(e);
            }
        };
        let auth = match AuthWatcher::start(
            collaborators.authenticator,
            events.clone(),
            inner.config.captcha_url_prefix.clone(),
        ) {
            Ok(auth) => auth,
            Err(e) => {
                let _ = syncer.stop(timeout);
                let _ = notifier.shutdown(timeout);
                return Err(e);
            }
        };

        let components = Arc::new(Components {
            identity: params.identity,
            settings,
            directories,
            connection,
            notifier,
            syncer,
            auth,
            reachability: Mutex::new(None),
            processor: Mutex::new(None),
        });
        *inner.components.lock() = Some(Arc::clone(&components));

        // Started last: its first probe reports back through the components.
        let backend: Box<dyn ReachabilityBackend> = match collaborators.reachability {
            Some(backend) => backend,
            None => Box::new(IntervalReachabilityBackend::new(
                inner.config.reachability_poll_interval,
            )),
        };
        let watcher = ReachabilityWatcher::start(
            backend,
            events,
            inner.config.reachability_debounce,
        )?;
        *components.reachability.lock() = Some(watcher);

        match params.credential_source {
            CredentialSource::Explicit { username, secret } => {
                self.authenticate(&username, &secret, None)?;
            }
            CredentialSource::LastKnownUser => {
                let cached = components.settings.last_known_user().and_then(|username| {
                    components
                        .settings
                        .token_for(&username)
                        .map(|token| (username, token))
                });
                match cached {
                    Some((username, token)) => {
                        info!(user = %username, "authenticating with cached token");
                        components
                            .auth
                            .authenticate(AuthRequest::Token { username, token })?;
                    }
                    None => debug!("no cached credentials"),
                }
            }
            CredentialSource::None => {}
        }
        Ok(())
    }

    /// Authenticates `username`.
    ///
    /// A no-op when the session is already authenticated as `username`. An
    /// empty secret is reported as `InvalidCredentials` without contacting
    /// the account service. Once a user has signed in, any other username
    /// fails with `IdentityMismatch`. The outcome arrives through
    /// [`SyncObserver::on_auth_error`].
    pub fn authenticate(
        &self,
        username: &str,
        secret: &str,
        captcha: Option<CaptchaAnswer>,
    ) -> SyncResult<()> {
        let components = self.inner.components()?;
        let context = &self.inner.context;
        if context.authenticated_username().as_deref() == Some(username)
            && context.auth_token().is_some()
            && components.auth.state().is_authenticated()
        {
            debug!(user = %username, "already authenticated");
            return Ok(());
        }
        if let Some(expected) = context.authenticated_username() {
            if expected != username {
                warn!(session = %expected, user = %username, "sign-in by a different user");
                self.inner.notify_auth_error(&AuthError::IdentityMismatch {
                    expected: expected.clone(),
                    actual: username.to_owned(),
                });
                return Err(SyncError::IdentityMismatch {
                    expected,
                    actual: username.to_owned(),
                });
            }
        }
        if secret.is_empty() {
            warn!(user = %username, "empty secret");
            self.inner.notify_auth_error(&AuthError::InvalidCredentials);
            return Ok(());
        }

        self.inner.reauth_attempted.store(false, Ordering::SeqCst);
        components.auth.authenticate(AuthRequest::Credentials {
            username: username.to_owned(),
            secret: secret.to_owned(),
            captcha,
        })
    }

    /// Records `username` as authenticated without the account service,
    /// opens their directory and marks initialization complete.
    pub fn setup_for_test_mode(&self, username: &str) -> SyncResult<()> {
        let components = self.inner.components()?;
        let context = &self.inner.context;
        context.record_authentication(username, AuthToken::new(TEST_MODE_TOKEN))?;
        let directory = self.inner.open_directory(&components, username)?;
        context.status().set_authenticated(true);
        context
            .status()
            .set_directory_state(directory.initial_sync_ended()?, directory.unsynced_count()?);
        info!(user = %username, "test mode session ready");
        self.inner.maybe_mark_initialization_complete();
        Ok(())
    }

    /// The open directory of the authenticated user.
    pub fn directory(&self) -> Option<Arc<Directory>> {
        self.inner.context.directory()
    }

    /// Registers the observer, replacing any previous one.
    pub fn set_observer(&self, observer: Arc<dyn SyncObserver>) {
        self.inner.context.set_observer(Some(observer));
    }

    /// Removes the observer.
    pub fn remove_observer(&self) {
        self.inner.context.set_observer(None);
    }

    /// The validated username, if any.
    pub fn authenticated_username(&self) -> Option<String> {
        self.inner.context.authenticated_username()
    }

    /// State of the authentication machine.
    pub fn auth_state(&self) -> AuthState {
        match self.inner.components() {
            Ok(components) => components.auth.state(),
            Err(_) => AuthState::Unauthenticated,
        }
    }

    /// One-word session summary.
    pub fn status_summary(&self) -> StatusSummary {
        self.detailed_status().summary
    }

    /// Full session status.
    pub fn detailed_status(&self) -> Status {
        self.inner.refresh_status();
        self.inner.context.status().status()
    }

    /// Persists the directory now.
    pub fn save_changes(&self) -> SyncResult<()> {
        let directory = self.directory().ok_or(SyncError::NotInitialized)?;
        directory.save_changes()?;
        Ok(())
    }

    /// A peer reported a change: sync right away.
    pub fn on_incoming_notification(&self) {
        self.inner.context.status().notification_received();
        if let Ok(components) = self.inner.components() {
            debug!("peer notification received");
            components
                .syncer
                .nudge(Duration::ZERO, NudgeSource::Notification);
        }
    }

    /// Stops every component and closes the directory.
    ///
    /// Safe to call while a sync cycle is running. Once it returns no
    /// observer callback fires. Returns `ThreadJoinTimeout` if the sync loop
    /// did not exit in time; the rest of the shutdown still happens.
    pub fn shutdown(&self) -> SyncResult<()> {
        self.inner.shutdown()
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        if !self.inner.shut_down.load(Ordering::SeqCst) {
            if let Err(e) = self.inner.shutdown() {
                error!(error = %e, "shutdown on drop failed");
            }
        }
    }
}

impl fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let identity = self
            .inner
            .components
            .lock()
            .as_ref()
            .map(|c| c.identity.clone());
        f.debug_struct("SyncManager")
            .field("identity", &identity)
            .field("context", &self.inner.context)
            .field("shut_down", &self.inner.shut_down.load(Ordering::SeqCst))
            .finish()
    }
}

impl ManagerInner {
    fn components(&self) -> SyncResult<Arc<Components>> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SyncError::NotInitialized);
        }
        self.components
            .lock()
            .clone()
            .ok_or(SyncError::NotInitialized)
    }

    fn notify_auth_error(&self, error: &AuthError) {
        if let Some(observer) = self.context.observer() {
            observer.on_auth_error(error);
        }
    }

    fn maybe_mark_initialization_complete(&self) {
        if self.context.mark_initialization_complete() {
            info!("sync session initialized");
            if let Some(observer) = self.context.observer() {
                observer.on_initialization_complete();
            }
        }
    }

    /// Opens the user's directory and installs the change listener.
    fn open_directory(
        &self,
        components: &Components,
        username: &str,
    ) -> SyncResult<Arc<Directory>> {
        if let Some(directory) = self.context.directory() {
            return Ok(directory);
        }
        let directory = components.directories.open(username)?;
        let processor = Arc::new(ChangeProcessor::new(
            &self.context,
            &directory,
            components.syncer.nudger(),
            self.config.nudge_delay,
        ));
        directory.set_change_listener(Some(
            Arc::clone(&processor) as Arc<dyn DirectoryChangeListener>
        ));
        *components.processor.lock() = Some(processor);
        self.context.attach_directory(Arc::clone(&directory));
        info!(user = %username, "directory opened");
        Ok(directory)
    }

    fn refresh_status(&self) {
        let Ok(components) = self.components() else {
            return;
        };
        let stats = components.notifier.stats();
        let status = self.context.status();
        status.set_notifications(stats.enabled, stats.sent, stats.failed);
        if let Some(directory) = self.context.directory() {
            if let (Ok(ended), Ok(unsynced)) =
                (directory.initial_sync_ended(), directory.unsynced_count())
            {
                status.set_directory_state(ended, unsynced);
            }
        }
    }

    fn on_auth_succeeded(&self, username: String, token: AuthToken) {
        let Ok(components) = self.components() else {
            debug!(user = %username, "ignoring authentication after shutdown");
            return;
        };
        if let Err(e) = self.context.record_authentication(&username, token.clone()) {
            error!(error = %e, "authenticated identity does not match the session");
            let error = match e {
                SyncError::IdentityMismatch { expected, actual } => {
                    AuthError::IdentityMismatch { expected, actual }
                }
                other => AuthError::DirectoryUnavailable(other.to_string()),
            };
            self.reject_authentication(&components, &error);
            return;
        }
        if let Err(e) = components.settings.store_credentials(&username, &token) {
            warn!(user = %username, error = %e, "could not cache credentials");
        }
        let directory = match self.open_directory(&components, &username) {
            Ok(directory) => directory,
            Err(e) => {
                error!(user = %username, error = %e, "could not open directory");
                self.reject_authentication(
                    &components,
                    &AuthError::DirectoryUnavailable(e.to_string()),
                );
                return;
            }
        };

        let status = self.context.status();
        status.set_authenticated(true);
        if let (Ok(ended), Ok(unsynced)) =
            (directory.initial_sync_ended(), directory.unsynced_count())
        {
            status.set_directory_state(ended, unsynced);
            if ended {
                self.maybe_mark_initialization_complete();
            }
        }
        self.notify_auth_error(&AuthError::None);
        components.syncer.trigger(SyncTrigger::AuthSucceeded);
    }

    /// An authentication succeeded but the session cannot use it.
    fn reject_authentication(&self, components: &Components, error: &AuthError) {
        components.auth.reset();
        self.context.invalidate_token();
        self.context.status().set_authenticated(false);
        self.notify_auth_error(error);
    }

    fn on_auth_failed(&self, username: &str, failure: AuthFailure) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(components) = self.components() {
            if failure == AuthFailure::InvalidCredentials {
                if let Err(e) = components.settings.clear_token(username) {
                    warn!(user = %username, error = %e, "could not clear cached token");
                }
            }
        }
        self.context.status().set_authenticated(false);
        self.notify_auth_error(&AuthError::from(failure));
    }

    /// The server rejected the token: one automatic retry, then report.
    fn on_authentication_required(&self) {
        let Ok(components) = self.components() else {
            return;
        };
        self.context.status().set_authenticated(false);
        let username = self.context.authenticated_username();
        let cached = username.as_deref().and_then(|u| components.settings.token_for(u));
        if !self.reauth_attempted.swap(true, Ordering::SeqCst) {
            if let (Some(username), Some(token)) = (username, cached) {
                info!(user = %username, "re-authenticating with cached token");
                if components
                    .auth
                    .authenticate(AuthRequest::Token { username, token })
                    .is_ok()
                {
                    return;
                }
            }
        }
        warn!("re-authentication exhausted");
        self.notify_auth_error(&AuthError::InvalidCredentials);
    }

    fn on_cycle_ended(&self, snapshot: &SyncCycleSnapshot) {
        let Ok(components) = self.components() else {
            return;
        };
        self.reauth_attempted.store(false, Ordering::SeqCst);
        let status = self.context.status();
        status.cycle_ended(snapshot);
        if snapshot.is_share_usable {
            self.maybe_mark_initialization_complete();
        }
        if !snapshot.has_more_to_sync {
            if let Some(observer) = self.context.observer() {
                observer.on_sync_cycle_completed();
            }
        }
        components.notifier.on_cycle_ended(snapshot.commits);
        let stats = components.notifier.stats();
        status.set_notifications(stats.enabled, stats.sent, stats.failed);
    }

    fn shutdown(&self) -> SyncResult<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let components = self.components.lock().take();
        let Some(components) = components else {
            self.context.status().invalidate();
            return Ok(());
        };
        info!("shutting down sync manager");
        let timeout = self.config.thread_exit_timeout;
        let mut result = Ok(());

        let processor = components.processor.lock().take();
        if let Some(processor) = &processor {
            processor.disable();
        }

        if let Err(e) = components.auth.shutdown(timeout) {
            warn!(error = %e, "auth worker did not stop");
        }
        debug!("auth worker stopped");

        if let Err(e) = components.syncer.stop(timeout) {
            error!(error = %e, "sync loop did not stop");
            result = Err(e);
        } else {
            debug!("sync loop stopped");
        }

        components.notifier.logout();
        if let Err(e) = components.notifier.shutdown(timeout) {
            warn!(error = %e, "notification channel did not stop");
        }

        let watcher = components.reachability.lock().take();
        if let Some(watcher) = watcher {
            if let Err(e) = watcher.stop(timeout) {
                warn!(error = %e, "reachability watcher did not stop");
            }
        }

        if let Some(directory) = self.context.detach_directory() {
            directory.set_change_listener(None);
        }
        if let Err(e) = components.directories.close_all() {
            error!(error = %e, "closing directories failed");
            if result.is_ok() {
                result = Err(e.into());
            }
        }
        self.context.status().invalidate();
        info!("sync manager shut down");
        result
    }
}

/// Routes component events back to the manager without keeping it alive.
struct ManagerEvents(Weak<ManagerInner>);

impl AuthEventHandler for ManagerEvents {
    fn handle_auth_event(&self, event: AuthEvent) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        match event {
            AuthEvent::AttemptStarted { username } => {
                debug!(user = %username, "authentication started");
            }
            AuthEvent::Succeeded { username, token } => inner.on_auth_succeeded(username, token),
            AuthEvent::Failed { username, failure } => inner.on_auth_failed(&username, failure),
        }
    }
}

impl SyncerEventHandler for ManagerEvents {
    fn handle_syncer_event(&self, event: SyncerEvent) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        match event {
            SyncerEvent::SyncStarted(trigger) => {
                debug!(?trigger, "sync started");
                inner.context.status().cycle_started();
            }
            SyncerEvent::CycleEnded(snapshot) => inner.on_cycle_ended(&snapshot),
            SyncerEvent::CycleFailed {
                consecutive_errors,
                server_failure,
                will_retry,
                ..
            } => inner
                .context
                .status()
                .cycle_failed(consecutive_errors, server_failure, will_retry),
            SyncerEvent::AuthenticationRequired => inner.on_authentication_required(),
        }
    }
}

impl ReachabilityListener for ManagerEvents {
    fn on_reachable(&self) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        let Ok(components) = inner.components() else {
            return;
        };
        let reachable = components.connection.check_server_reachable();
        inner.context.status().set_server_reachable(reachable);
        if reachable {
            inner.context.status().set_server_up(true);
            components.syncer.trigger(SyncTrigger::ReachabilityRegained);
        }
    }

    fn on_unreachable(&self) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        let Ok(components) = inner.components() else {
            return;
        };
        components.connection.set_server_unreachable();
        inner.context.status().set_server_reachable(false);
    }
}
