//! Keeps one account's sync worker alive.
//!
//! [`SyncBridge`] runs `sync` in a loop. A worker that exits is relaunched
//! after a backoff delay; the delay resets once a fresh worker delivers its
//! first deltas. Workers that keep crashing are given up on (see
//! [`CrashTracker`]). Workers we terminated ourselves, or that got `SIGTERM`,
//! are not restarted.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::{BackoffConfig, BackoffScheduler};
use crate::crash::{CrashTracker, is_auth_failure};
use crate::protocol::{DeltaBatch, WorkerCommand};
use crate::runner::{CloseInfo, ModeRunner, SyncSession, WorkerEvent};
use crate::supervisor::KillSwitch;
use crate::{Error, Result, WorkerFailure};

/// Signal number of `SIGTERM`.
const SIGTERM: i32 = 15;

/// Crash-history key used when the runner has no account id or email.
const DEFAULT_KEY: &str = "default";

/// Event emitted by a running [`SyncBridge`].
#[derive(Debug)]
pub enum BridgeEvent {
    /// Deltas from the current worker.
    Deltas(DeltaBatch),
    /// A spawn or runtime error. The bridge keeps going.
    Error(Error),
    /// The worker ended and will be relaunched after `delay`.
    Restarting {
        /// Time until the next launch.
        delay: Duration,
        /// How the previous worker ended, if it was started at all.
        close: Option<CloseInfo>,
    },
    /// Too many crashes; the bridge gave up.
    Failed {
        /// Whether the last error looks like rejected credentials.
        auth_failure: bool,
        /// How the last worker ended, if it was started at all.
        close: Option<CloseInfo>,
    },
    /// The bridge stopped on request or because the worker was terminated.
    Stopped,
}

/// Restart loop around [`ModeRunner::sync`].
#[derive(Debug)]
pub struct SyncBridge {
    runner: ModeRunner,
    key: String,
    backoff: BackoffScheduler,
    crashes: CrashTracker,
}

impl SyncBridge {
    /// Creates a bridge with the default backoff.
    #[must_use]
    pub fn new(runner: ModeRunner) -> Self {
        let key = runner
            .binding()
            .and_then(|b| b.id().or_else(|| b.email()))
            .unwrap_or(DEFAULT_KEY)
            .to_string();
        Self {
            runner,
            key,
            backoff: BackoffScheduler::new(BackoffConfig::default()),
            crashes: CrashTracker::new(),
        }
    }

    /// Uses `config` for the restart delay.
    #[must_use]
    pub fn with_backoff(mut self, config: BackoffConfig) -> Self {
        self.backoff = BackoffScheduler::new(config);
        self
    }

    /// Key under which crashes are recorded.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Spawns the loop on the current runtime.
    #[must_use]
    pub fn start(self) -> (BridgeHandle, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let shutdown = KillSwitch::new();

        let task = tokio::spawn(self.run(events_tx, commands_rx, shutdown.clone()));
        let handle = BridgeHandle {
            shutdown,
            commands: commands_tx,
            task: Some(task),
        };
        (handle, events_rx)
    }

    async fn run(
        mut self,
        events: mpsc::UnboundedSender<BridgeEvent>,
        mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
        shutdown: KillSwitch,
    ) {
        info!(account = %self.key, "sync bridge started");
        let mut commands_open = true;

        while !shutdown.is_requested() {
            let close = match self.runner.sync() {
                Ok(session) => {
                    let outcome = self
                        .drive_session(
                            session,
                            &events,
                            &mut commands,
                            &mut commands_open,
                            &shutdown,
                        )
                        .await;
                    match outcome {
                        SessionOutcome::Closed(info) => Some(info),
                        SessionOutcome::Stop => break,
                    }
                }
                Err(e) => {
                    error!(account = %self.key, err = %e, "failed to start sync worker");
                    if events.send(BridgeEvent::Error(e)).is_err() {
                        break;
                    }
                    None
                }
            };

            if shutdown.is_requested() || close.as_ref().is_some_and(Self::terminated) {
                break;
            }

            if self.crashes.record_crash(&self.key) {
                let auth_failure = close
                    .as_ref()
                    .and_then(|c| c.error.as_ref())
                    .is_some_and(looks_like_auth_failure);
                error!(account = %self.key, auth_failure, "giving up on sync worker");
                let _ = events.send(BridgeEvent::Failed {
                    auth_failure,
                    close,
                });
                return;
            }

            let delay = self.backoff.next_delay();
            warn!(
                account = %self.key,
                ?delay,
                code = ?close.as_ref().and_then(|c| c.code),
                "sync worker exited, restarting"
            );
            if events.send(BridgeEvent::Restarting { delay, close }).is_err() {
                break;
            }
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = shutdown.requested() => break,
            }
        }

        info!(account = %self.key, "sync bridge stopped");
        let _ = events.send(BridgeEvent::Stopped);
    }

    async fn drive_session(
        &mut self,
        mut session: SyncSession,
        events: &mpsc::UnboundedSender<BridgeEvent>,
        commands: &mut mpsc::UnboundedReceiver<WorkerCommand>,
        commands_open: &mut bool,
        shutdown: &KillSwitch,
    ) -> SessionOutcome {
        let mut seen_deltas = false;

        loop {
            tokio::select! {
                event = session.next_event() => match event {
                    Some(WorkerEvent::Deltas(batch)) => {
                        if !seen_deltas {
                            seen_deltas = true;
                            self.backoff.reset();
                        }
                        if events.send(BridgeEvent::Deltas(batch)).is_err() {
                            session.kill();
                            return SessionOutcome::Stop;
                        }
                    }
                    Some(WorkerEvent::Error(e)) => {
                        warn!(account = %self.key, err = %e, "sync worker error");
                        let _ = events.send(BridgeEvent::Error(e));
                    }
                    Some(WorkerEvent::Close(info)) => return SessionOutcome::Closed(info),
                    None => return SessionOutcome::Stop,
                },
                command = commands.recv(), if *commands_open => match command {
                    Some(command) => {
                        if let Err(e) = session.send(&command) {
                            warn!(account = %self.key, err = %e, "dropping unserializable command");
                        }
                    }
                    None => *commands_open = false,
                },
                () = shutdown.requested(), if !session.kill_switch().is_requested() => {
                    debug!(account = %self.key, "shutdown requested");
                    session.kill();
                }
            }
        }
    }

    /// Whether the worker was stopped on purpose.
    const fn terminated(close: &CloseInfo) -> bool {
        close.killed || matches!(close.signal, Some(SIGTERM))
    }
}

enum SessionOutcome {
    Closed(CloseInfo),
    Stop,
}

fn looks_like_auth_failure(failure: &WorkerFailure) -> bool {
    failure.code.as_deref().is_some_and(is_auth_failure)
        || is_auth_failure(&failure.message)
        || is_auth_failure(&failure.raw_log)
}

/// Controls a running [`SyncBridge`].
///
/// Dropping the handle shuts the bridge down.
#[derive(Debug)]
pub struct BridgeHandle {
    shutdown: KillSwitch,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    task: Option<JoinHandle<()>>,
}

impl BridgeHandle {
    /// Sends a command to the current worker.
    ///
    /// Commands sent while no worker is running are delivered to the next one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StdinClosed`] if the bridge has stopped.
    pub fn send(&self, command: WorkerCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::StdinClosed)
    }

    /// Kills the current worker and stops restarting it.
    pub fn shutdown(&self) {
        self.shutdown.kill();
    }

    /// Waits for the bridge loop to finish.
    pub async fn stopped(mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(err = %e, "sync bridge task failed");
            }
        }
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        self.shutdown.kill();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::account::AccountBinding;
    use crate::config::WorkerConfig;
    use serde_json::json;

    fn close(killed: bool, signal: Option<i32>) -> CloseInfo {
        CloseInfo {
            code: None,
            signal,
            error: None,
            killed,
        }
    }

    #[test]
    fn test_terminated() {
        assert!(SyncBridge::terminated(&close(true, Some(9))));
        assert!(SyncBridge::terminated(&close(false, Some(SIGTERM))));
        assert!(!SyncBridge::terminated(&close(false, Some(11))));
        assert!(!SyncBridge::terminated(&close(false, None)));
    }

    #[test]
    fn test_key_prefers_account_id() {
        let config = WorkerConfig::new("w", "c");
        let binding =
            AccountBinding::new(json!({"id": "acc1", "emailAddress": "a@b.c"}), json!({}));
        let bridge = SyncBridge::new(ModeRunner::new(config.clone()).with_binding(binding));
        assert_eq!(bridge.key(), "acc1");

        let bridge = SyncBridge::new(ModeRunner::new(config));
        assert_eq!(bridge.key(), DEFAULT_KEY);
    }

    #[test]
    fn test_auth_failure_from_code() {
        let failure = WorkerFailure {
            message: "Authentication Error - Check your username and password.".into(),
            raw_log: String::new(),
            code: Some("ErrorAuthentication".into()),
            exit_code: Some(1),
        };
        assert!(looks_like_auth_failure(&failure));

        let failure = WorkerFailure {
            message: "boom".into(),
            raw_log: "HTTP Response Code: 401".into(),
            code: None,
            exit_code: Some(1),
        };
        assert!(looks_like_auth_failure(&failure));
    }

    #[tokio::test]
    async fn test_spawn_failures_give_up() {
        let config = WorkerConfig::new("/nonexistent/mailsync", "/tmp");
        let bridge = SyncBridge::new(ModeRunner::new(config)).with_backoff(BackoffConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: false,
            ..BackoffConfig::default()
        });
        let (handle, mut events) = bridge.start();

        let mut errors = 0;
        let mut restarts = 0;
        loop {
            match events.recv().await.unwrap() {
                BridgeEvent::Error(Error::Spawn { .. }) => errors += 1,
                BridgeEvent::Restarting { close: None, .. } => restarts += 1,
                BridgeEvent::Failed {
                    auth_failure,
                    close: None,
                } => {
                    assert!(!auth_failure);
                    break;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(errors, 5);
        assert_eq!(restarts, 4);
        handle.stopped().await;
    }
}
