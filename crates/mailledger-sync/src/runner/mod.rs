//! Running the worker in one of its modes.
//!
//! `migrate`, `test` and `reset` run to completion and produce a single
//! [`WorkerResponse`]. `sync` streams deltas through a [`SyncSession`].
//!
//! # Example
//!
//! ```ignore
//! use mailledger_sync::{ModeRunner, WorkerConfig};
//!
//! let runner = ModeRunner::new(WorkerConfig::from_defaults()?).with_binding(binding);
//! let response = runner.test().await?;
//! println!("{}", response.response);
//! ```

mod progress;
mod sync;

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use tracing::{debug, info, warn};

pub use progress::{NoIndicator, ProgressHint, StatusIndicator};
pub use sync::{CLOSE_STDIN_BROKEN, CLOSE_WAIT_FAILED, CloseInfo, SyncSession, WorkerEvent};

use crate::account::AccountBinding;
use crate::classify::{Localizer, NoLocalization, classify_with, unknown_error};
use crate::config::WorkerConfig;
use crate::framer::last_line;
use crate::mode::Mode;
use crate::protocol::StatusEnvelope;
use crate::redact::{Secrets, redact};
use crate::supervisor::{Activity, WorkerProcess};
use crate::{Error, Result, WorkerFailure};

/// Result of a successful wait-for-result run.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerResponse {
    /// The parsed last line of output.
    pub response: Value,
    /// Everything the worker wrote to stdout and stderr, unredacted.
    pub buffer: Bytes,
}

/// Launches the worker for one account, or for none.
#[derive(Clone)]
pub struct ModeRunner {
    config: WorkerConfig,
    binding: Option<AccountBinding>,
    localizer: Arc<dyn Localizer>,
}

impl std::fmt::Debug for ModeRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModeRunner")
            .field("config", &self.config)
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

impl ModeRunner {
    /// Creates a runner that is not bound to an account.
    #[must_use]
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            binding: None,
            localizer: Arc::new(NoLocalization),
        }
    }

    /// Binds the runner to an account; the worker receives the handshake.
    #[must_use]
    pub fn with_binding(mut self, binding: AccountBinding) -> Self {
        self.binding = Some(binding);
        self
    }

    /// Uses `localizer` for error messages.
    #[must_use]
    pub fn with_localizer(mut self, localizer: Arc<dyn Localizer>) -> Self {
        self.localizer = localizer;
        self
    }

    /// The launch configuration.
    #[must_use]
    pub const fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// The bound account, if any.
    #[must_use]
    pub const fn binding(&self) -> Option<&AccountBinding> {
        self.binding.as_ref()
    }

    fn secrets(&self) -> Secrets {
        self.binding
            .as_ref()
            .map(|b| b.secrets().clone())
            .unwrap_or_default()
    }

    /// Runs `mode` to completion.
    ///
    /// # Errors
    ///
    /// See [`ModeRunner::run_with`].
    pub async fn run(&self, mode: Mode) -> Result<WorkerResponse> {
        self.run_with(mode, |_| {}).await
    }

    /// Runs `mode` to completion, passing every output chunk to `on_data`.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] for [`Mode::Sync`], which never completes.
    /// - [`Error::Spawn`] if the worker cannot be started.
    /// - [`Error::Worker`] on a non-zero exit or an unparsable last line.
    pub async fn run_with<F>(&self, mode: Mode, mut on_data: F) -> Result<WorkerResponse>
    where
        F: FnMut(&[u8]) + Send,
    {
        if mode.is_streaming() {
            return Err(Error::Config(format!(
                "mode {mode} streams deltas and has no single result"
            )));
        }

        let mut process = WorkerProcess::spawn(&self.config, mode, self.binding.as_ref())?;
        let mut buffer = BytesMut::new();

        while let Some(activity) = process.next_activity().await {
            match activity {
                Activity::Output { data, .. } => {
                    on_data(&data);
                    buffer.extend_from_slice(&data);
                }
                Activity::StdinClosed(e) => {
                    warn!(%mode, err = %e, "worker stdin closed early");
                }
                Activity::Exited(status) => return self.settle(mode, status.code(), buffer),
                Activity::WaitFailed(e) => return Err(Error::Io(e)),
            }
        }

        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "worker ended without an exit status",
        )))
    }

    fn settle(&self, mode: Mode, code: Option<i32>, buffer: BytesMut) -> Result<WorkerResponse> {
        let parsed = last_line(&buffer).and_then(|line| serde_json::from_str::<Value>(&line).ok());

        let status = match (code, parsed) {
            (Some(0), Some(response)) => {
                debug!(%mode, bytes = buffer.len(), "worker finished");
                return Ok(WorkerResponse {
                    response,
                    buffer: buffer.freeze(),
                });
            }
            (_, parsed) => parsed.as_ref().map(StatusEnvelope::from_value),
        };
        let (message, raw_code) = match status {
            Some(StatusEnvelope {
                error: Some(raw),
                error_service,
                ..
            }) => (
                classify_with(self.localizer.as_ref(), &raw, error_service.as_deref()),
                Some(raw),
            ),
            _ => (unknown_error(self.localizer.as_ref(), code), None),
        };
        let failure = WorkerFailure {
            message,
            raw_log: redact(&String::from_utf8_lossy(&buffer), &self.secrets()),
            code: raw_code,
            exit_code: code,
        };
        warn!(%mode, code = ?code, error = %failure.message, "worker failed");
        Err(Error::Worker(failure))
    }

    /// Verifies the bound account's settings.
    ///
    /// # Errors
    ///
    /// See [`ModeRunner::run_with`].
    pub async fn test(&self) -> Result<WorkerResponse> {
        self.run(Mode::Test).await
    }

    /// Drops the local cache of the bound account.
    ///
    /// # Errors
    ///
    /// See [`ModeRunner::run_with`].
    pub async fn reset_cache(&self) -> Result<WorkerResponse> {
        info!(email = self.binding.as_ref().and_then(AccountBinding::email), "resetting cache");
        self.run(Mode::Reset).await
    }

    /// Runs database migrations.
    ///
    /// The first progress marker in the output is shown on `indicator`, which
    /// is closed when the run ends whatever its outcome.
    ///
    /// # Errors
    ///
    /// See [`ModeRunner::run_with`].
    pub async fn migrate(&self, indicator: &mut dyn StatusIndicator) -> Result<WorkerResponse> {
        let mut shown = false;
        let result = self
            .run_with(Mode::Migrate, |chunk| {
                if shown {
                    return;
                }
                if let Some(hint) = ProgressHint::detect(chunk) {
                    shown = true;
                    indicator.show(hint);
                }
            })
            .await;
        indicator.close();

        if let Ok(response) = &result {
            debug!(
                output = %redact(&String::from_utf8_lossy(&response.buffer), &self.secrets()),
                "migration finished"
            );
        }
        result
    }

    /// Starts a streaming `sync` session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Spawn`] if the worker cannot be started.
    pub fn sync(&self) -> Result<SyncSession> {
        SyncSession::start(&self.config, self.binding.as_ref(), self.localizer.clone())
    }
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
    use serde_json::json;

    struct Upper;

    impl Localizer for Upper {
        fn localize(&self, text: &str) -> String {
            text.to_uppercase()
        }
    }

    fn runner() -> ModeRunner {
        let binding = AccountBinding::new(
            json!({"emailAddress": "a@b.c", "settings": {"imap_password": "secretpw"}}),
            json!({}),
        );
        ModeRunner::new(WorkerConfig::new("w", "c")).with_binding(binding)
    }

    #[test]
    fn test_settle_success() {
        let buffer = BytesMut::from(&b"progress\n{\"result\":true}\n"[..]);
        let response = runner().settle(Mode::Test, Some(0), buffer).unwrap();
        assert_eq!(response.response, json!({"result": true}));
        assert_eq!(&response.buffer[..], b"progress\n{\"result\":true}\n");
    }

    #[test]
    fn test_settle_classifies_and_redacts() {
        let buffer = BytesMut::from(
            &b"running migration...\nLOGIN secretpw rejected\n{\"error\":\"ErrorAuthentication\"}\n"[..],
        );
        let err = runner().settle(Mode::Migrate, Some(1), buffer).unwrap_err();
        let failure = err.as_worker_failure().unwrap();
        assert_eq!(
            failure.message,
            "Authentication Error - Check your username and password."
        );
        assert!(!failure.raw_log.contains("secretpw"));
        assert!(failure.raw_log.contains("LOGIN ********* rejected"));
        assert_eq!(failure.code.as_deref(), Some("ErrorAuthentication"));
        assert_eq!(failure.exit_code, Some(1));
    }

    #[test]
    fn test_settle_appends_service() {
        let buffer = BytesMut::from(&b"{\"error\":\"ErrorParse\",\"error_service\":\"smtp\"}"[..]);
        let err = runner().settle(Mode::Test, Some(2), buffer).unwrap_err();
        assert_eq!(err.to_string(), "Parsing Error (SMTP)");
    }

    #[test]
    fn test_settle_unparsable_output() {
        let err = runner()
            .settle(Mode::Test, Some(0), BytesMut::from(&b"garbage"[..]))
            .unwrap_err();
        assert_eq!(err.to_string(), "An unknown error has occurred (mailsync: 0)");

        let err = runner().settle(Mode::Test, None, BytesMut::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "An unknown error has occurred (mailsync: signal)"
        );
    }

    #[test]
    fn test_settle_uses_localizer() {
        let runner = runner().with_localizer(Arc::new(Upper));
        let err = runner
            .settle(Mode::Test, Some(1), BytesMut::from(&b"{\"error\":\"ErrorParse\"}"[..]))
            .unwrap_err();
        assert_eq!(err.to_string(), "PARSING ERROR");
    }

    #[tokio::test]
    async fn test_run_rejects_sync() {
        let err = runner().run(Mode::Sync).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
