//! Worker launch configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Error, Result};

/// Name of the worker executable.
pub const WORKER_BINARY_NAME: &str = "mailsync";

/// Value of `IDENTITY_SERVER` when no URL can be resolved.
pub const UNKNOWN_IDENTITY_SERVER: &str = "unknown";

/// Default stdin buffer. Draft bodies can be large and a small pipe buffer
/// stalls the writer instead of failing.
pub const DEFAULT_STDIN_BUFFER: usize = 1024 * 1024; // 1 MB

/// Resolves the identity server URL at spawn time.
pub type IdentityResolver = Arc<dyn Fn() -> Option<String> + Send + Sync>;

const fn default_stdin_buffer() -> usize {
    DEFAULT_STDIN_BUFFER
}

/// How to launch the worker.
#[derive(Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Path of the worker executable.
    pub binary_path: PathBuf,
    /// Directory passed as `CONFIG_DIR_PATH`.
    pub config_dir: PathBuf,
    /// Fixed identity server URL, used when no resolver is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_server: Option<String>,
    /// Pass `--verbose` until this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose_until: Option<DateTime<Utc>>,
    /// Capacity of the buffered stdin writer, in bytes.
    #[serde(default = "default_stdin_buffer")]
    pub stdin_buffer_capacity: usize,
    #[serde(skip)]
    identity_resolver: Option<IdentityResolver>,
}

impl WorkerConfig {
    /// Creates a configuration for the given binary and config directory.
    #[must_use]
    pub fn new(binary_path: impl Into<PathBuf>, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            config_dir: config_dir.into(),
            identity_server: None,
            verbose_until: None,
            stdin_buffer_capacity: DEFAULT_STDIN_BUFFER,
            identity_resolver: None,
        }
    }

    /// Uses the platform config directory and a worker binary next to the
    /// current executable.
    ///
    /// # Errors
    ///
    /// Returns an error if neither location can be determined.
    pub fn from_defaults() -> Result<Self> {
        let config_dir = default_config_dir()
            .ok_or_else(|| Error::Config("no platform config directory".to_string()))?;
        let binary_path = default_binary_path()?;
        Ok(Self::new(binary_path, config_dir))
    }

    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        if config.stdin_buffer_capacity == 0 {
            return Err(Error::Config(
                "stdin_buffer_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(config)
    }

    /// Resolves `IDENTITY_SERVER` through `resolver` at every spawn.
    #[must_use]
    pub fn with_identity_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        self.identity_resolver = Some(Arc::new(resolver));
        self
    }

    /// Enables verbose worker logging until `until`.
    #[must_use]
    pub const fn with_verbose_until(mut self, until: DateTime<Utc>) -> Self {
        self.verbose_until = Some(until);
        self
    }

    /// The identity server URL to export, or `"unknown"`.
    #[must_use]
    pub fn identity_server(&self) -> String {
        self.identity_resolver
            .as_ref()
            .and_then(|resolve| resolve())
            .or_else(|| self.identity_server.clone())
            .unwrap_or_else(|| UNKNOWN_IDENTITY_SERVER.to_string())
    }

    /// Whether verbose logging is enabled at `now`.
    #[must_use]
    pub fn verbose_at(&self, now: DateTime<Utc>) -> bool {
        let verbose = self.verbose_until.is_some_and(|until| now < until);
        if verbose {
            warn!(until = ?self.verbose_until, "verbose worker logging is enabled");
        }
        verbose
    }
}

impl std::fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("binary_path", &self.binary_path)
            .field("config_dir", &self.config_dir)
            .field("identity_server", &self.identity_server)
            .field("verbose_until", &self.verbose_until)
            .field("stdin_buffer_capacity", &self.stdin_buffer_capacity)
            .field("identity_resolver", &self.identity_resolver.is_some())
            .finish()
    }
}

/// `<platform config dir>/mailledger`.
#[must_use]
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("mailledger"))
}

/// The worker binary expected next to the running executable.
///
/// # Errors
///
/// Returns an error if the current executable path is unavailable.
pub fn default_binary_path() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| Error::Config("executable has no parent directory".to_string()))?;
    Ok(dir.join(WORKER_BINARY_NAME))
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_identity_server_fallbacks() {
        let config = WorkerConfig::new("/bin/mailsync", "/tmp/cfg");
        assert_eq!(config.identity_server(), "unknown");

        let mut fixed = config.clone();
        fixed.identity_server = Some("https://id.example.com".into());
        assert_eq!(fixed.identity_server(), "https://id.example.com");

        let resolved = fixed
            .clone()
            .with_identity_resolver(|| Some("https://resolved.example.com".into()));
        assert_eq!(resolved.identity_server(), "https://resolved.example.com");

        let unresolved = fixed.with_identity_resolver(|| None);
        assert_eq!(unresolved.identity_server(), "https://id.example.com");
    }

    #[test]
    fn test_verbose_window() {
        let now = Utc::now();
        let config = WorkerConfig::new("w", "c");
        assert!(!config.verbose_at(now));

        let config = config.with_verbose_until(now + Duration::minutes(5));
        assert!(config.verbose_at(now));
        assert!(!config.verbose_at(now + Duration::minutes(6)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        std::fs::write(
            &path,
            r#"{"binary_path": "/opt/mailsync", "config_dir": "/home/a/.config/mailledger"}"#,
        )
        .unwrap();

        let config = WorkerConfig::load(&path).unwrap();
        assert_eq!(config.binary_path, PathBuf::from("/opt/mailsync"));
        assert_eq!(config.stdin_buffer_capacity, DEFAULT_STDIN_BUFFER);
        assert_eq!(config.identity_server(), "unknown");
    }

    #[test]
    fn test_load_rejects_zero_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        std::fs::write(
            &path,
            r#"{"binary_path": "w", "config_dir": "c", "stdin_buffer_capacity": 0}"#,
        )
        .unwrap();

        let err = WorkerConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("stdin_buffer_capacity"));
    }
}
