//! Configuration for the sync engine.

use rand::Rng;
use std::time::Duration;

/// Prefix for captcha challenge URLs the authenticator reports as relative.
pub const DEFAULT_CAPTCHA_URL_PREFIX: &str = "https://accounts.example.com/";

/// Configuration for a sync session.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Identifier of this client, sent with every server request.
    pub client_id: String,
    /// Delay between a local edit and the sync cycle it triggers.
    pub nudge_delay: Duration,
    /// Interval between periodic sync cycles.
    pub poll_interval: Duration,
    /// Interval of the portable reachability backend.
    pub reachability_poll_interval: Duration,
    /// Window in which network changes are folded together.
    pub reachability_debounce: Duration,
    /// How long shutdown waits for each worker thread.
    pub thread_exit_timeout: Duration,
    /// Maximum number of server updates per download batch.
    pub fetch_batch_size: usize,
    /// Maximum number of entries per commit request.
    pub commit_batch_size: usize,
    /// Commit requests per cycle before the cycle reports more to sync.
    pub max_commit_batches_per_cycle: usize,
    /// Prefix applied to relative captcha URLs.
    pub captcha_url_prefix: String,
    /// Backoff after failed cycles.
    pub retry: RetryConfig,
    /// Configuration for opened directories.
    pub directory: synctree_core::Config,
}

impl SyncConfig {
    /// Creates a configuration with a fresh client id.
    pub fn new() -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            nudge_delay: Duration::from_millis(200),
            poll_interval: Duration::from_secs(60 * 60),
            reachability_poll_interval: Duration::from_secs(60 * 60),
            reachability_debounce: Duration::from_millis(250),
            thread_exit_timeout: Duration::from_secs(60),
            fetch_batch_size: 100,
            commit_batch_size: 25,
            max_commit_batches_per_cycle: 10,
            captcha_url_prefix: DEFAULT_CAPTCHA_URL_PREFIX.to_owned(),
            retry: RetryConfig::default(),
            directory: synctree_core::Config::default(),
        }
    }

    /// Sets the client id.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Sets the nudge delay.
    pub fn with_nudge_delay(mut self, delay: Duration) -> Self {
        self.nudge_delay = delay;
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the reachability poll interval.
    pub fn with_reachability_poll_interval(mut self, interval: Duration) -> Self {
        self.reachability_poll_interval = interval;
        self
    }

    /// Sets the reachability debounce window.
    pub fn with_reachability_debounce(mut self, debounce: Duration) -> Self {
        self.reachability_debounce = debounce;
        self
    }

    /// Sets the thread exit timeout.
    pub fn with_thread_exit_timeout(mut self, timeout: Duration) -> Self {
        self.thread_exit_timeout = timeout;
        self
    }

    /// Sets the download batch size.
    pub fn with_fetch_batch_size(mut self, size: usize) -> Self {
        self.fetch_batch_size = size.max(1);
        self
    }

    /// Sets the commit batch size.
    pub fn with_commit_batch_size(mut self, size: usize) -> Self {
        self.commit_batch_size = size.max(1);
        self
    }

    /// Sets how many commit requests one cycle may make.
    pub fn with_max_commit_batches_per_cycle(mut self, batches: usize) -> Self {
        self.max_commit_batches_per_cycle = batches.max(1);
        self
    }

    /// Sets the captcha URL prefix.
    pub fn with_captcha_url_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.captcha_url_prefix = prefix.into();
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the directory configuration.
    pub fn with_directory_config(mut self, config: synctree_core::Config) -> Self {
        self.directory = config;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Failed attempts in a row after which backoff retries stop; the next
    /// poll or trigger still runs a cycle.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60 * 5),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration that never retries on a backoff.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter && delay_secs > 0.0 {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new()
            .with_client_id("client-1")
            .with_nudge_delay(Duration::from_millis(10))
            .with_fetch_batch_size(50)
            .with_commit_batch_size(0)
            .with_thread_exit_timeout(Duration::from_secs(5));

        assert_eq!(config.client_id, "client-1");
        assert_eq!(config.nudge_delay, Duration::from_millis(10));
        assert_eq!(config.fetch_batch_size, 50);
        assert_eq!(config.commit_batch_size, 1);
        assert_eq!(config.thread_exit_timeout, Duration::from_secs(5));
    }

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.nudge_delay, Duration::from_millis(200));
        assert_eq!(config.thread_exit_timeout, Duration::from_secs(60));
        assert_eq!(config.reachability_poll_interval, Duration::from_secs(3600));
        assert_eq!(config.captcha_url_prefix, DEFAULT_CAPTCHA_URL_PREFIX);
        assert_ne!(SyncConfig::new().client_id, config.client_id);
    }

    #[test]
    fn retry_config_no_retry() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        // First attempt has no delay
        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);

        let delay = config.delay_for_attempt(5);
        assert!(delay <= Duration::from_millis(6250)); // 5s + 25% jitter
    }

    #[test]
    fn retry_delay_without_jitter_is_exact() {
        let config = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(100))
            .with_jitter(false);
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
    }

    proptest::proptest! {
        #[test]
        fn delay_without_jitter_is_monotonic_and_capped(
            initial_ms in 1u64..1_000,
            max_ms in 1u64..60_000,
            attempt in 1u32..40,
        ) {
            let config = RetryConfig::new(50)
                .with_initial_delay(Duration::from_millis(initial_ms))
                .with_max_delay(Duration::from_millis(max_ms))
                .with_jitter(false);
            let here = config.delay_for_attempt(attempt);
            let next = config.delay_for_attempt(attempt + 1);
            proptest::prop_assert!(here <= next);
            proptest::prop_assert!(next <= Duration::from_millis(max_ms));
        }
    }
}
