//! Authentication state machine and its worker thread.
//!
//! Credential validation is delegated to an [`Authenticator`]. The
//! [`AuthWatcher`] runs it off the caller's thread and reports every
//! transition as an [`AuthEvent`].

use crate::error::{SyncError, SyncResult};
use crate::worker::WorkerThread;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// An opaque service token issued by the authenticator.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AuthToken(String);

impl AuthToken {
    /// Wraps a token string.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The token string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(..)")
    }
}

/// Why an authentication attempt failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// Username or secret (or cached token) was rejected.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The validator wants a captcha answer before it accepts credentials.
    #[error("captcha required at {url}")]
    CaptchaRequired {
        /// Challenge token to send back with the answer.
        token: String,
        /// Where the challenge image can be fetched.
        url: String,
    },

    /// The validator could not be reached.
    #[error("connection to the authentication service failed")]
    ConnectionFailed,

    /// The account exists but is not set up for sync.
    #[error("user is not registered for sync")]
    UserNotRegistered,
}

/// Answer to a captcha challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaAnswer {
    /// Challenge token from [`AuthFailure::CaptchaRequired`].
    pub token: String,
    /// The user's answer.
    pub answer: String,
}

/// A request to validate an identity.
#[derive(Clone)]
pub enum AuthRequest {
    /// Explicit username and secret.
    Credentials {
        /// Account name.
        username: String,
        /// Password or equivalent.
        secret: String,
        /// Answer to an earlier captcha challenge.
        captcha: Option<CaptchaAnswer>,
    },
    /// A token cached from an earlier session.
    Token {
        /// Account name the token was issued to.
        username: String,
        /// The cached token.
        token: AuthToken,
    },
}

impl AuthRequest {
    /// The account this request is for.
    #[must_use]
    pub fn username(&self) -> &str {
        match self {
            AuthRequest::Credentials { username, .. } | AuthRequest::Token { username, .. } => {
                username
            }
        }
    }
}

impl fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthRequest::Credentials {
                username, captcha, ..
            } => f
                .debug_struct("Credentials")
                .field("username", username)
                .field("captcha", &captcha.is_some())
                .finish_non_exhaustive(),
            AuthRequest::Token { username, .. } => f
                .debug_struct("Token")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

/// Validates credentials against the account service.
pub trait Authenticator: Send + Sync {
    /// Validates `request`, returning a service token on success.
    ///
    /// May block on the network; it is only called from the auth worker.
    fn authenticate(&self, request: &AuthRequest) -> Result<AuthToken, AuthFailure>;
}

/// State of the authentication machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// No attempt has been made.
    Unauthenticated,
    /// An attempt is in flight.
    Authenticating,
    /// The last attempt succeeded.
    Authenticated {
        /// Validated account name.
        username: String,
    },
    /// The last attempt failed. A new attempt is always allowed.
    Failed(AuthFailure),
}

impl AuthState {
    /// Returns true if authenticated.
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthState::Authenticated { .. })
    }
}

/// Transitions reported by the [`AuthWatcher`].
#[derive(Debug, Clone)]
pub enum AuthEvent {
    /// The worker picked up a request.
    AttemptStarted {
        /// Account being validated.
        username: String,
    },
    /// Validation succeeded.
    Succeeded {
        /// Validated account name.
        username: String,
        /// Token to use with the server.
        token: AuthToken,
    },
    /// Validation failed.
    Failed {
        /// Account that failed.
        username: String,
        /// Reason, with captcha URLs made absolute.
        failure: AuthFailure,
    },
}

/// Receives [`AuthEvent`]s on the auth worker thread.
pub trait AuthEventHandler: Send + Sync {
    /// Handles one event.
    fn handle_auth_event(&self, event: AuthEvent);
}

/// Runs authentication attempts on a dedicated thread.
pub struct AuthWatcher {
    state: Arc<Mutex<AuthState>>,
    requests: Mutex<Option<Sender<AuthRequest>>>,
    worker: Mutex<Option<WorkerThread>>,
    shut_down: Arc<AtomicBool>,
}

impl AuthWatcher {
    /// Starts the worker thread.
    pub fn start(
        authenticator: Arc<dyn Authenticator>,
        handler: Arc<dyn AuthEventHandler>,
        captcha_url_prefix: impl Into<String>,
    ) -> SyncResult<Self> {
        let state = Arc::new(Mutex::new(AuthState::Unauthenticated));
        let shut_down = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<AuthRequest>();
        let prefix = captcha_url_prefix.into();

        let worker = {
            let state = Arc::clone(&state);
            let shut_down = Arc::clone(&shut_down);
            WorkerThread::spawn("synctree-auth", move || {
                for request in rx {
                    if shut_down.load(Ordering::SeqCst) {
                        break;
                    }
                    let username = request.username().to_owned();
                    *state.lock() = AuthState::Authenticating;
                    handler.handle_auth_event(AuthEvent::AttemptStarted {
                        username: username.clone(),
                    });

                    let result = authenticator.authenticate(&request);
                    if shut_down.load(Ordering::SeqCst) {
                        debug!(user = %username, "dropping authentication result after shutdown");
                        break;
                    }

                    match result {
                        Ok(token) => {
                            info!(user = %username, "authentication succeeded");
                            *state.lock() = AuthState::Authenticated {
                                username: username.clone(),
                            };
                            handler.handle_auth_event(AuthEvent::Succeeded { username, token });
                        }
                        Err(failure) => {
                            let failure = absolute_captcha_url(&prefix, failure);
                            warn!(user = %username, reason = %failure, "authentication failed");
                            *state.lock() = AuthState::Failed(failure.clone());
                            handler.handle_auth_event(AuthEvent::Failed { username, failure });
                        }
                    }
                }
            })?
        };

        Ok(Self {
            state,
            requests: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            shut_down,
        })
    }

    /// Queues an authentication attempt.
    pub fn authenticate(&self, request: AuthRequest) -> SyncResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SyncError::NotInitialized);
        }
        let requests = self.requests.lock();
        let sender = requests.as_ref().ok_or(SyncError::NotInitialized)?;
        debug!(user = %request.username(), "queueing authentication");
        sender.send(request).map_err(|_| SyncError::NotInitialized)
    }

    /// Current state.
    pub fn state(&self) -> AuthState {
        self.state.lock().clone()
    }

    /// Drops an authenticated state the session could not accept.
    pub fn reset(&self) {
        *self.state.lock() = AuthState::Unauthenticated;
    }

    /// Stops the worker. An attempt still in flight finishes in the
    /// background but its result is dropped.
    pub fn shutdown(&self, timeout: Duration) -> SyncResult<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        self.requests.lock().take();
        let worker = self.worker.lock().take();
        match worker {
            Some(worker) => worker.join(timeout),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for AuthWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthWatcher")
            .field("state", &*self.state.lock())
            .field("shut_down", &self.shut_down.load(Ordering::SeqCst))
            .finish()
    }
}

/// Prefixes relative captcha URLs.
fn absolute_captcha_url(prefix: &str, failure: AuthFailure) -> AuthFailure {
    match failure {
        AuthFailure::CaptchaRequired { token, url }
            if !url.starts_with("http://") && !url.starts_with("https://") =>
        {
            AuthFailure::CaptchaRequired {
                token,
                url: format!("{prefix}{}", url.trim_start_matches('/')),
            }
        }
        other => other,
    }
}

/// In-memory authenticator for tests.
#[derive(Debug, Default)]
pub struct MockAuthenticator {
    accounts: Mutex<HashMap<String, String>>,
    tokens: Mutex<HashMap<String, String>>,
    scripted: Mutex<VecDeque<AuthFailure>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
}

impl MockAuthenticator {
    /// Creates an authenticator that knows no accounts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an account.
    pub fn with_account(self, username: impl Into<String>, secret: impl Into<String>) -> Self {
        self.accounts.lock().insert(username.into(), secret.into());
        self
    }

    /// Accepts `token` for `username`.
    pub fn add_token(&self, username: impl Into<String>, token: &AuthToken) {
        self.tokens
            .lock()
            .insert(token.as_str().to_owned(), username.into());
    }

    /// Stops accepting `token`.
    pub fn revoke_token(&self, token: &AuthToken) {
        self.tokens.lock().remove(token.as_str());
    }

    /// Makes the next call fail with `failure`.
    pub fn fail_next(&self, failure: AuthFailure) {
        self.scripted.lock().push_back(failure);
    }

    /// Makes every call sleep first.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Number of validation calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Authenticator for MockAuthenticator {
    fn authenticate(&self, request: &AuthRequest) -> Result<AuthToken, AuthFailure> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if let Some(failure) = self.scripted.lock().pop_front() {
            return Err(failure);
        }

        match request {
            AuthRequest::Credentials {
                username, secret, ..
            } => {
                let accounts = self.accounts.lock();
                match accounts.get(username) {
                    None => Err(AuthFailure::UserNotRegistered),
                    Some(expected) if expected != secret => Err(AuthFailure::InvalidCredentials),
                    Some(_) => {
                        let token = AuthToken::new(format!("token-{username}-{call}"));
                        self.add_token(username.clone(), &token);
                        Ok(token)
                    }
                }
            }
            AuthRequest::Token { username, token } => {
                match self.tokens.lock().get(token.as_str()) {
                    Some(owner) if owner == username => Ok(token.clone()),
                    _ => Err(AuthFailure::InvalidCredentials),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::Receiver;

    struct ChannelHandler(Mutex<Sender<AuthEvent>>);

    impl AuthEventHandler for ChannelHandler {
        fn handle_auth_event(&self, event: AuthEvent) {
            let _ = self.0.lock().send(event);
        }
    }

    fn watcher(authenticator: Arc<MockAuthenticator>) -> (AuthWatcher, Receiver<AuthEvent>) {
        let (tx, rx) = mpsc::channel();
        let handler = Arc::new(ChannelHandler(Mutex::new(tx)));
        let watcher = AuthWatcher::start(authenticator, handler, "https://accounts.example.com/")
            .unwrap();
        (watcher, rx)
    }

    fn credentials(username: &str, secret: &str) -> AuthRequest {
        AuthRequest::Credentials {
            username: username.into(),
            secret: secret.into(),
            captcha: None,
        }
    }

    fn next(rx: &Receiver<AuthEvent>) -> AuthEvent {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn successful_attempt() {
        let auth = Arc::new(MockAuthenticator::new().with_account("alice", "pw"));
        let (watcher, rx) = watcher(Arc::clone(&auth));

        watcher.authenticate(credentials("alice", "pw")).unwrap();
        assert!(matches!(next(&rx), AuthEvent::AttemptStarted { .. }));
        let AuthEvent::Succeeded { username, token } = next(&rx) else {
            panic!("expected success");
        };
        assert_eq!(username, "alice");
        assert_eq!(
            watcher.state(),
            AuthState::Authenticated {
                username: "alice".into()
            }
        );

        // The issued token works on its own.
        assert!(auth
            .authenticate(&AuthRequest::Token {
                username: "alice".into(),
                token
            })
            .is_ok());
        watcher.shutdown(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn failure_then_retry() {
        let auth = Arc::new(MockAuthenticator::new().with_account("alice", "pw"));
        let (watcher, rx) = watcher(auth);

        watcher.authenticate(credentials("alice", "wrong")).unwrap();
        next(&rx);
        assert!(matches!(
            next(&rx),
            AuthEvent::Failed {
                failure: AuthFailure::InvalidCredentials,
                ..
            }
        ));
        assert_eq!(watcher.state(), AuthState::Failed(AuthFailure::InvalidCredentials));

        watcher.authenticate(credentials("alice", "pw")).unwrap();
        next(&rx);
        assert!(matches!(next(&rx), AuthEvent::Succeeded { .. }));
        watcher.shutdown(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn captcha_url_made_absolute() {
        let auth = Arc::new(MockAuthenticator::new());
        auth.fail_next(AuthFailure::CaptchaRequired {
            token: "ctok".into(),
            url: "Captcha?ctoken=ctok".into(),
        });
        let (watcher, rx) = watcher(auth);

        watcher.authenticate(credentials("bob", "pw")).unwrap();
        next(&rx);
        let AuthEvent::Failed { failure, .. } = next(&rx) else {
            panic!("expected failure");
        };
        assert_eq!(
            failure,
            AuthFailure::CaptchaRequired {
                token: "ctok".into(),
                url: "https://accounts.example.com/Captcha?ctoken=ctok".into(),
            }
        );
        watcher.shutdown(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn absolute_captcha_url_untouched() {
        let failure = AuthFailure::CaptchaRequired {
            token: "t".into(),
            url: "https://other.example.org/c".into(),
        };
        assert_eq!(absolute_captcha_url("https://x/", failure.clone()), failure);
    }

    #[test]
    fn results_after_shutdown_are_dropped() {
        let auth = Arc::new(MockAuthenticator::new().with_account("alice", "pw"));
        auth.set_delay(Duration::from_millis(100));
        let (watcher, rx) = watcher(auth);

        watcher.authenticate(credentials("alice", "pw")).unwrap();
        assert!(matches!(next(&rx), AuthEvent::AttemptStarted { .. }));
        watcher.shutdown(Duration::from_secs(5)).unwrap();

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(watcher.authenticate(credentials("alice", "pw")).is_err());
    }

    #[test]
    fn token_debug_is_redacted() {
        let token = AuthToken::new("secret-value");
        assert!(!format!("{token:?}").contains("secret-value"));
        let request = credentials("alice", "hunter2");
        assert!(!format!("{request:?}").contains("hunter2"));
    }
}
