//! Directory configuration.

/// Configuration for opening a directory.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the directory location if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to persist a snapshot after every write transaction that
    /// changed something. When false, callers persist with `save_changes`.
    pub save_on_commit: bool,

    /// Snapshot format version written by this build.
    pub format_version: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            save_on_commit: true,
            format_version: 1,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the location if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to persist after every write transaction.
    #[must_use]
    pub const fn save_on_commit(mut self, value: bool) -> Self {
        self.save_on_commit = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert!(config.save_on_commit);
        assert_eq!(config.format_version, 1);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new().create_if_missing(false).save_on_commit(false);
        assert!(!config.create_if_missing);
        assert!(!config.save_on_commit);
    }
}
