//! Streaming `sync` sessions.
//!
//! A session forwards framed delta batches while the worker runs and ends
//! with exactly one [`WorkerEvent::Close`]. Commands for the worker are sent
//! with [`SyncSession::send`].

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::account::AccountBinding;
use crate::classify::{Localizer, classify_with, unknown_error};
use crate::config::WorkerConfig;
use crate::framer::{LineFramer, Trailer};
use crate::mode::Mode;
use crate::protocol::{DeltaBatch, StatusEnvelope, WorkerCommand};
use crate::redact::{Secrets, redact};
use crate::supervisor::{
    Activity, KillSwitch, StdinHandle, StreamKind, WorkerProcess, exit_signal,
};
use crate::{Error, Result, WorkerFailure};

/// Close code used when stdin broke while the worker was running.
pub const CLOSE_STDIN_BROKEN: i32 = -2;

/// Close code used when the exit status could not be collected.
pub const CLOSE_WAIT_FAILED: i32 = -1;

/// Bytes of worker stderr kept for the close report.
pub const MAX_STDERR_TAIL: usize = 64 * 1024;

/// Event emitted by a [`SyncSession`].
#[derive(Debug)]
pub enum WorkerEvent {
    /// Complete delta lines, in arrival order. Never empty.
    Deltas(DeltaBatch),
    /// The worker is gone. Always the last event, delivered once.
    Close(CloseInfo),
    /// A runtime error that does not end the session by itself.
    Error(Error),
}

/// How a sync worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// Exit code, or a negative pseudo code (see [`CLOSE_STDIN_BROKEN`]).
    pub code: Option<i32>,
    /// Terminating signal, if any.
    pub signal: Option<i32>,
    /// Classified failure; `None` on a clean exit.
    pub error: Option<WorkerFailure>,
    /// Whether the owner requested termination through the kill switch.
    pub killed: bool,
}

impl CloseInfo {
    /// Whether the worker exited with code 0 and reported no error.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.error.is_none() && matches!(self.code, Some(0))
    }
}

/// Delivers events until the terminal close, then drops everything.
#[derive(Debug)]
struct TerminalGuard {
    tx: mpsc::UnboundedSender<WorkerEvent>,
    cleaned_up: bool,
}

impl TerminalGuard {
    const fn new(tx: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self {
            tx,
            cleaned_up: false,
        }
    }

    fn deltas(&self, batch: DeltaBatch) {
        if !self.cleaned_up && !batch.is_empty() {
            let _ = self.tx.send(WorkerEvent::Deltas(batch));
        }
    }

    fn error(&self, error: Error) {
        if !self.cleaned_up {
            let _ = self.tx.send(WorkerEvent::Error(error));
        }
    }

    fn close(&mut self, info: CloseInfo) -> bool {
        if self.cleaned_up {
            return false;
        }
        self.cleaned_up = true;
        let _ = self.tx.send(WorkerEvent::Close(info));
        true
    }
}

/// Output collected over the lifetime of one sync worker.
struct SessionOutput {
    framer: LineFramer,
    /// Last [`MAX_STDERR_TAIL`] bytes of stderr.
    stderr: BytesMut,
    secrets: Secrets,
    localizer: Arc<dyn Localizer>,
}

impl SessionOutput {
    fn new(secrets: Secrets, localizer: Arc<dyn Localizer>) -> Self {
        Self {
            framer: LineFramer::new(),
            stderr: BytesMut::new(),
            secrets,
            localizer,
        }
    }

    fn push_stderr(&mut self, data: &[u8]) {
        self.stderr.extend_from_slice(data);
        let excess = self.stderr.len().saturating_sub(MAX_STDERR_TAIL);
        if excess > 0 {
            self.stderr.advance(excess);
        }
    }

    fn redacted_stderr(&self) -> String {
        redact(&String::from_utf8_lossy(&self.stderr), &self.secrets)
    }

    /// Builds the close report once the worker has exited.
    ///
    /// Returns a last delta batch if the unterminated tail was not a status
    /// object. A status object with an `error` wins over stderr.
    fn on_exit(
        &mut self,
        code: Option<i32>,
        signal: Option<i32>,
        killed: bool,
    ) -> (Option<DeltaBatch>, CloseInfo) {
        let mut tail = None;
        let mut error = None;

        match self.framer.finish() {
            Some(Trailer::Status(StatusEnvelope {
                error: Some(raw),
                error_service,
                log,
            })) => {
                let log = log.map_or_else(
                    || self.redacted_stderr(),
                    |log| redact(&log, &self.secrets),
                );
                error = Some(WorkerFailure {
                    message: classify_with(
                        self.localizer.as_ref(),
                        &raw,
                        error_service.as_deref(),
                    ),
                    raw_log: log,
                    code: Some(raw),
                    exit_code: code,
                });
            }
            Some(Trailer::Delta(line)) => tail = Some(vec![line]),
            Some(Trailer::Status(_)) | None => {}
        }

        if error.is_none() && !self.stderr.is_empty() {
            let raw_log = self.redacted_stderr();
            error = Some(WorkerFailure {
                message: raw_log.trim().to_string(),
                raw_log,
                code: None,
                exit_code: code,
            });
        }

        if error.is_none() && code != Some(0) && !killed {
            error = Some(WorkerFailure {
                message: unknown_error(self.localizer.as_ref(), code),
                raw_log: String::new(),
                code: None,
                exit_code: code,
            });
        }

        (
            tail,
            CloseInfo {
                code,
                signal,
                error,
                killed,
            },
        )
    }

    fn stdin_broken(&self, cause: &std::io::Error, signal: Option<i32>) -> CloseInfo {
        CloseInfo {
            code: Some(CLOSE_STDIN_BROKEN),
            signal,
            error: Some(WorkerFailure {
                message: format!("Worker stdin closed: {cause}"),
                raw_log: self.redacted_stderr(),
                code: None,
                exit_code: None,
            }),
            killed: false,
        }
    }
}

/// A running `sync` worker.
///
/// Dropping the session kills the worker.
#[derive(Debug)]
pub struct SyncSession {
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    stdin: StdinHandle,
    kill: KillSwitch,
    pid: Option<u32>,
}

impl SyncSession {
    pub(crate) fn start(
        config: &WorkerConfig,
        binding: Option<&AccountBinding>,
        localizer: Arc<dyn Localizer>,
    ) -> Result<Self> {
        let process = WorkerProcess::spawn(config, Mode::Sync, binding)?;
        let (tx, rx) = mpsc::unbounded_channel();

        let session = Self {
            events: rx,
            stdin: process.stdin(),
            kill: process.kill_switch(),
            pid: process.pid(),
        };

        let secrets = binding.map(|b| b.secrets().clone()).unwrap_or_default();
        let output = SessionOutput::new(secrets, localizer);
        tokio::spawn(drive(process, TerminalGuard::new(tx), output));

        Ok(session)
    }

    /// Waits for the next event. Returns `None` after [`WorkerEvent::Close`].
    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        self.events.recv().await
    }

    /// Sends a command to the worker.
    ///
    /// A closed stdin is not reported here: the worker is killed and the
    /// session closes with code [`CLOSE_STDIN_BROKEN`].
    ///
    /// # Errors
    ///
    /// Returns an error only if the command cannot be serialized.
    pub fn send(&self, command: &WorkerCommand) -> Result<()> {
        let line = command.to_line()?;
        if let Err(e) = self.stdin.write_line(line) {
            warn!(pid = ?self.pid, err = %e, "cannot send command, terminating worker");
            self.kill();
        }
        Ok(())
    }

    /// Requests termination. Safe to call repeatedly.
    pub fn kill(&self) {
        if self.kill.kill() {
            info!(pid = ?self.pid, "terminating sync worker");
        }
    }

    /// Handle for requesting termination from elsewhere.
    #[must_use]
    pub fn kill_switch(&self) -> KillSwitch {
        self.kill.clone()
    }

    /// OS process id of the worker.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.kill.kill();
    }
}

async fn drive(mut process: WorkerProcess, mut guard: TerminalGuard, mut output: SessionOutput) {
    let kill = process.kill_switch();
    let mut stdin_failure: Option<std::io::Error> = None;

    while let Some(activity) = process.next_activity().await {
        match activity {
            Activity::Output {
                stream: StreamKind::Stdout,
                data,
            } => guard.deltas(output.framer.push(&data)),
            Activity::Output {
                stream: StreamKind::Stderr,
                data,
            } => output.push_stderr(&data),
            Activity::StdinClosed(e) => {
                warn!(pid = ?process.pid(), err = %e, "sync worker stdin closed");
                process.kill();
                stdin_failure.get_or_insert(e);
            }
            Activity::WaitFailed(e) => {
                let failure = WorkerFailure {
                    message: format!("Waiting for worker failed: {e}"),
                    raw_log: output.redacted_stderr(),
                    code: None,
                    exit_code: None,
                };
                guard.error(Error::Io(e));
                guard.close(CloseInfo {
                    code: Some(CLOSE_WAIT_FAILED),
                    signal: None,
                    error: Some(failure),
                    killed: kill.is_requested(),
                });
            }
            Activity::Exited(status) => {
                let signal = exit_signal(&status);
                let info = if let Some(cause) = stdin_failure.take() {
                    output.stdin_broken(&cause, signal)
                } else {
                    let killed = kill.is_requested();
                    let (tail, info) = output.on_exit(status.code(), signal, killed);
                    if let Some(tail) = tail {
                        guard.deltas(tail);
                    }
                    info
                };
                debug!(
                    code = ?info.code,
                    signal = ?info.signal,
                    killed = info.killed,
                    "sync worker closed"
                );
                guard.close(info);
            }
        }
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
    use crate::classify::NoLocalization;

    fn output_with(stdout: &[u8], stderr: &[u8]) -> (SessionOutput, Vec<DeltaBatch>) {
        let secrets = Secrets {
            imap_password: Some("hunter2".into()),
            ..Secrets::default()
        };
        let mut output = SessionOutput::new(secrets, Arc::new(NoLocalization));
        let batch = output.framer.push(stdout);
        output.push_stderr(stderr);
        (output, vec![batch])
    }

    #[test]
    fn test_guard_delivers_one_close() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut guard = TerminalGuard::new(tx);
        let info = CloseInfo {
            code: Some(0),
            signal: None,
            error: None,
            killed: false,
        };

        assert!(guard.close(info.clone()));
        assert!(!guard.close(info));
        guard.deltas(vec!["late".into()]);

        assert!(matches!(rx.try_recv(), Ok(WorkerEvent::Close(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_guard_skips_empty_batches() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let guard = TerminalGuard::new(tx);
        guard.deltas(Vec::new());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_clean_exit() {
        let (mut output, batches) = output_with(b"[\"d1\"]\n", b"");
        assert_eq!(batches, vec![vec!["[\"d1\"]".to_string()]]);

        let (tail, info) = output.on_exit(Some(0), None, false);
        assert_eq!(tail, None);
        assert!(info.is_success());
    }

    #[test]
    fn test_status_trailer_is_classified_not_emitted() {
        let (mut output, _) = output_with(
            b"[\"d1\"]\n{\"error\":\"ErrorConnection\",\"error_service\":\"imap\",\"log\":\"pw hunter2\"}",
            b"noise",
        );

        let (tail, info) = output.on_exit(Some(1), None, false);
        assert_eq!(tail, None);
        let error = info.error.unwrap();
        assert_eq!(
            error.message,
            "Connection Error - Unable to connect to the server / port you provided. (IMAP)"
        );
        assert_eq!(error.raw_log, "pw *********");
        assert_eq!(error.code.as_deref(), Some("ErrorConnection"));
        assert_eq!(error.exit_code, Some(1));
    }

    #[test]
    fn test_unterminated_delta_is_flushed() {
        let (mut output, _) = output_with(b"[\"tail\"]", b"");
        let (tail, info) = output.on_exit(Some(0), None, false);
        assert_eq!(tail, Some(vec!["[\"tail\"]".to_string()]));
        assert!(info.error.is_none());
    }

    #[test]
    fn test_stderr_becomes_redacted_error() {
        let (mut output, _) = output_with(b"", b"login failed for hunter2\n");
        let (_, info) = output.on_exit(Some(1), None, false);
        let error = info.error.unwrap();
        assert_eq!(error.message, "login failed for *********");
        assert!(!error.raw_log.contains("hunter2"));
    }

    #[test]
    fn test_nonzero_without_details_is_unknown() {
        let (mut output, _) = output_with(b"", b"");
        let (_, info) = output.on_exit(Some(3), None, false);
        assert_eq!(
            info.error.unwrap().message,
            "An unknown error has occurred (mailsync: 3)"
        );
    }

    #[test]
    fn test_requested_kill_is_not_an_error() {
        let (mut output, _) = output_with(b"", b"");
        let (_, info) = output.on_exit(None, Some(9), true);
        assert!(info.error.is_none());
        assert!(info.killed);
        assert!(!info.is_success());
    }

    #[test]
    fn test_stderr_keeps_only_the_tail() {
        let (mut output, _) = output_with(b"", b"");
        for _ in 0..100 {
            output.push_stderr(&[b'a'; 4096]);
        }
        output.push_stderr(b"final error\n");
        assert_eq!(output.stderr.len(), MAX_STDERR_TAIL);
        assert!(output.stderr.starts_with(b"aaaa"));
        assert!(output.stderr.ends_with(b"afinal error\n"));

        let (_, info) = output.on_exit(Some(1), None, false);
        let error = info.error.unwrap();
        assert_eq!(error.raw_log.len(), MAX_STDERR_TAIL);
        assert!(error.message.ends_with("final error"));
    }

    #[test]
    fn test_stdin_broken_close() {
        let (output, _) = output_with(b"", b"");
        let cause = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed");
        let info = output.stdin_broken(&cause, Some(9));
        assert_eq!(info.code, Some(CLOSE_STDIN_BROKEN));
        assert!(info.error.unwrap().message.contains("closed"));
    }
}
