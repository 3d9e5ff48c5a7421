//! Worker process supervision.
//!
//! A [`WorkerProcess`] owns exactly one child process and its three pipes.
//! It is created by [`WorkerProcess::spawn`] and driven by repeatedly calling
//! [`WorkerProcess::next_activity`] until the process has exited.
//!
//! ```text
//! Spawning ──first stdout byte──→ HandshakeSent ──→ Running ──→ Exited
//!     │                                                ↑
//!     └──────────── (no account bound) ────────────────┘
//! ```
//!
//! The child is spawned with `kill_on_drop`, so dropping the process on any
//! path (including an error right after spawn) terminates and reaps it.

mod kill;
mod pipes;

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use chrono::Utc;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub use kill::KillSwitch;
pub use pipes::{StdinHandle, StreamKind};

use crate::account::AccountBinding;
use crate::config::WorkerConfig;
use crate::mode::Mode;
use crate::{Error, Result};
use pipes::{Handshake, PipeEvent, pump_output, write_stdin};

/// Something the owner of a [`WorkerProcess`] has to react to.
#[derive(Debug)]
pub enum Activity {
    /// A chunk of output, in arrival order.
    Output {
        /// Pipe it was read from.
        stream: StreamKind,
        /// Raw bytes.
        data: Bytes,
    },
    /// Writing to stdin failed; the worker can no longer receive commands.
    StdinClosed(std::io::Error),
    /// The process exited and both output pipes are drained.
    Exited(ExitStatus),
    /// Waiting for the process failed.
    WaitFailed(std::io::Error),
}

/// One running instance of the worker binary.
#[derive(Debug)]
pub struct WorkerProcess {
    mode: Mode,
    pid: Option<u32>,
    child: Child,
    events: mpsc::UnboundedReceiver<PipeEvent>,
    open_streams: usize,
    stdin: StdinHandle,
    kill: KillSwitch,
    kill_sent: bool,
    handshake_sent: Arc<AtomicBool>,
    finished: bool,
}

impl WorkerProcess {
    /// Launches the worker in `mode`.
    ///
    /// When `binding` is given, `--info <email>` is passed and the account and
    /// identity records are written to stdin once the worker first writes to
    /// stdout. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Spawn`] if the binary cannot be started; nothing is
    /// retried here.
    pub fn spawn(
        config: &WorkerConfig,
        mode: Mode,
        binding: Option<&AccountBinding>,
    ) -> Result<Self> {
        let args = worker_args(config, mode, binding);
        let identity_server = config.identity_server();

        let mut cmd = Command::new(&config.binary_path);
        cmd.args(&args)
            .env("CONFIG_DIR_PATH", &config.config_dir)
            .env("IDENTITY_SERVER", &identity_server)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(%mode, binary = %config.binary_path.display(), ?args, "spawning worker");
        let mut child = cmd.spawn().map_err(|source| {
            error!(%mode, err = %source, "failed to spawn worker");
            Error::Spawn {
                path: config.binary_path.display().to_string(),
                source,
            }
        })?;
        let pid = child.id();

        let stdin = child.stdin.take().ok_or(Error::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(Error::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(Error::MissingPipe("stderr"))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let stdin_handle = StdinHandle::new(stdin_tx);
        let handshake_sent = Arc::new(AtomicBool::new(false));

        let handshake = match binding {
            Some(binding) => Some(Handshake::new(
                Bytes::from(binding.handshake_payload()?),
                stdin_handle.clone(),
                handshake_sent.clone(),
            )),
            None => None,
        };

        tokio::spawn(write_stdin(
            stdin,
            config.stdin_buffer_capacity,
            stdin_rx,
            events_tx.clone(),
            handshake.is_some(),
        ));
        tokio::spawn(pump_output(
            StreamKind::Stdout,
            stdout,
            events_tx.clone(),
            handshake,
        ));
        tokio::spawn(pump_output(StreamKind::Stderr, stderr, events_tx, None));

        info!(%mode, ?pid, email = binding.and_then(AccountBinding::email), "worker started");

        Ok(Self {
            mode,
            pid,
            child,
            events: events_rx,
            open_streams: 2,
            stdin: stdin_handle,
            kill: KillSwitch::new(),
            kill_sent: false,
            handshake_sent,
            finished: false,
        })
    }

    /// Mode this worker was launched in.
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// OS process id, if the process was still running after spawn.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the handshake has been queued for stdin.
    #[must_use]
    pub fn handshake_sent(&self) -> bool {
        self.handshake_sent.load(Ordering::SeqCst)
    }

    /// Handle for writing to stdin.
    #[must_use]
    pub fn stdin(&self) -> StdinHandle {
        self.stdin.clone()
    }

    /// Handle for requesting termination.
    #[must_use]
    pub fn kill_switch(&self) -> KillSwitch {
        self.kill.clone()
    }

    /// Requests termination. Safe to call repeatedly.
    pub fn kill(&self) {
        if self.kill.kill() {
            warn!(mode = %self.mode, pid = ?self.pid, "terminating worker");
        }
    }

    /// Waits for the next thing that happened to the worker.
    ///
    /// Output is returned in arrival order. [`Activity::Exited`] (or
    /// [`Activity::WaitFailed`]) is returned exactly once, after both output
    /// pipes reached EOF; afterwards this returns `None`.
    pub async fn next_activity(&mut self) -> Option<Activity> {
        if self.finished {
            return None;
        }

        loop {
            tokio::select! {
                event = self.events.recv(), if self.open_streams > 0 => match event {
                    Some(PipeEvent::Chunk(stream, data)) => {
                        return Some(Activity::Output { stream, data });
                    }
                    Some(PipeEvent::Eof(_)) => self.open_streams -= 1,
                    Some(PipeEvent::ReadFailed(stream, e)) => {
                        warn!(?stream, err = %e, "reading worker output failed");
                        self.open_streams -= 1;
                    }
                    Some(PipeEvent::StdinClosed(e)) => return Some(Activity::StdinClosed(e)),
                    None => self.open_streams = 0,
                },
                () = self.kill.requested(), if !self.kill_sent => {
                    self.kill_sent = true;
                    if let Err(e) = self.child.start_kill() {
                        warn!(err = %e, "failed to signal worker");
                    }
                }
                status = self.child.wait(), if self.open_streams == 0 => {
                    self.finished = true;
                    return Some(match status {
                        Ok(status) => {
                            debug!(mode = %self.mode, code = ?status.code(), "worker exited");
                            Activity::Exited(status)
                        }
                        Err(e) => {
                            error!(mode = %self.mode, err = %e, "waiting for worker failed");
                            Activity::WaitFailed(e)
                        }
                    });
                }
            }
        }
    }
}

/// Builds `--mode <mode> [--verbose] [--info <email>]`.
fn worker_args(config: &WorkerConfig, mode: Mode, binding: Option<&AccountBinding>) -> Vec<String> {
    let mut args = vec!["--mode".to_string(), mode.as_str().to_string()];
    if config.verbose_at(Utc::now()) {
        args.push("--verbose".to_string());
    }
    if let Some(email) = binding.and_then(AccountBinding::email) {
        args.push("--info".to_string());
        args.push(email.to_string());
    }
    args
}

/// Signal number that terminated the process, if any.
#[cfg(unix)]
#[must_use]
pub fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

/// Signal number that terminated the process, if any.
#[cfg(not(unix))]
#[must_use]
pub const fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_args_without_account() {
        let config = WorkerConfig::new("w", "c");
        assert_eq!(worker_args(&config, Mode::Migrate, None), vec!["--mode", "migrate"]);
    }

    #[test]
    fn test_args_with_account_and_verbose() {
        let config =
            WorkerConfig::new("w", "c").with_verbose_until(Utc::now() + chrono::Duration::hours(1));
        let binding = AccountBinding::new(json!({"emailAddress": "a@b.c"}), json!({}));
        assert_eq!(
            worker_args(&config, Mode::Sync, Some(&binding)),
            vec!["--mode", "sync", "--verbose", "--info", "a@b.c"]
        );
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails_fast() {
        let config = WorkerConfig::new("/nonexistent/mailsync", "/tmp");
        let err = WorkerProcess::spawn(&config, Mode::Test, None).unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
        assert!(err.to_string().contains("/nonexistent/mailsync"));
    }
}
