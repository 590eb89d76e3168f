//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries.

use std::path::PathBuf;

use idelink_config::AppConfig;
use tempfile::TempDir;

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .daemon_binary("cat")
///     .shutdown_timeout_secs(1)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn daemon_binary(mut self, binary: &str) -> Self {
        self.config.daemon.binary = PathBuf::from(binary);
        self
    }

    pub fn daemon_args(mut self, args: &[&str]) -> Self {
        self.config.daemon.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn shutdown_timeout_secs(mut self, secs: u64) -> Self {
        self.config.daemon.shutdown_timeout_secs = secs;
        self
    }

    pub fn wait_for_init(mut self, wait: bool) -> Self {
        self.config.daemon.wait_for_init = wait;
        self
    }

    pub fn project_root(mut self, root: &str) -> Self {
        self.config.project.root = PathBuf::from(root);
        self
    }

    pub fn saved_state_path(mut self, path: &str) -> Self {
        self.config.project.saved_state_path = Some(PathBuf::from(path));
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }

    /// Serialize the config into `idelink.toml` inside a fresh temp
    /// directory. The directory is removed when the returned [`TempDir`]
    /// is dropped.
    pub fn write_temp(self) -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("idelink.toml");
        let content = toml::to_string_pretty(&self.config).expect("failed to serialize config");
        std::fs::write(&path, content).expect("failed to write test config");
        (dir, path)
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
