//! Integration tests against scripted workers.
//!
//! Each test writes a small `/bin/sh` script in place of the real worker
//! binary and drives it through the public API.

#![cfg(unix)]
#![allow(clippy::unwrap_used)]

use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;

use mailledger_sync::{
    AccountBinding, BackoffConfig, BridgeEvent, CloseInfo, Error, Mode, ModeRunner, ProgressHint,
    StatusIndicator, SyncBridge, SyncSession, WorkerCommand, WorkerConfig, WorkerEvent,
};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Writes `body` as an executable worker script.
fn worker(body: &str) -> (TempDir, WorkerConfig) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mailsync");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let config = WorkerConfig::new(path, dir.path().join("config"));
    (dir, config)
}

fn binding() -> AccountBinding {
    AccountBinding::new(
        json!({
            "id": "acc1",
            "emailAddress": "user@example.com",
            "settings": {"imap_password": "secretpw"},
        }),
        json!({"token": "identity"}),
    )
}

/// Collects session events until the terminal close.
async fn collect(mut session: SyncSession) -> (Vec<Vec<String>>, Vec<CloseInfo>) {
    let mut batches = Vec::new();
    let mut closes = Vec::new();
    tokio::time::timeout(TIMEOUT, async {
        while let Some(event) = session.next_event().await {
            match event {
                WorkerEvent::Deltas(batch) => batches.push(batch),
                WorkerEvent::Close(info) => closes.push(info),
                WorkerEvent::Error(e) => panic!("unexpected error event: {e}"),
            }
        }
    })
    .await
    .unwrap();
    (batches, closes)
}

#[derive(Default)]
struct RecordingIndicator {
    shown: Vec<ProgressHint>,
    closed: usize,
}

impl StatusIndicator for RecordingIndicator {
    fn show(&mut self, hint: ProgressHint) {
        self.shown.push(hint);
    }

    fn close(&mut self) {
        self.closed += 1;
    }
}

#[tokio::test]
async fn test_mode_resolves_last_line() {
    let (_dir, config) = worker(r#"echo '{"result":true}'"#);

    let response = ModeRunner::new(config).test().await.unwrap();

    assert_eq!(response.response, json!({"result": true}));
    assert_eq!(&response.buffer[..], b"{\"result\":true}\n");
}

#[tokio::test]
async fn test_arguments_and_environment() {
    let (dir, config) = worker(
        r#"echo "{\"args\":\"$*\",\"config\":\"$CONFIG_DIR_PATH\",\"identity\":\"$IDENTITY_SERVER\"}""#,
    );
    let config = config.with_identity_resolver(|| Some("https://id.example.com".into()));

    let response = ModeRunner::new(config).run(Mode::Reset).await.unwrap();

    assert_eq!(response.response["args"], "--mode reset");
    assert_eq!(
        response.response["config"],
        dir.path().join("config").display().to_string()
    );
    assert_eq!(response.response["identity"], "https://id.example.com");
}

#[tokio::test]
async fn test_migrate_failure_is_classified_and_redacted() {
    let (_dir, config) = worker(
        r#"echo "running migration..."
read -r account
echo "LOGIN rejected: $account" >&2
sleep 0.1
echo '{"error":"ErrorAuthentication"}'
exit 1"#,
    );
    let runner = ModeRunner::new(config).with_binding(binding());
    let mut indicator = RecordingIndicator::default();

    let err = tokio::time::timeout(TIMEOUT, runner.migrate(&mut indicator))
        .await
        .unwrap()
        .unwrap_err();

    let failure = err.as_worker_failure().unwrap();
    assert_eq!(
        failure.message,
        "Authentication Error - Check your username and password."
    );
    assert!(failure.raw_log.contains("LOGIN rejected"));
    assert!(failure.raw_log.contains("*********"));
    assert!(!failure.raw_log.contains("secretpw"));
    assert_eq!(failure.exit_code, Some(1));

    assert_eq!(indicator.shown, vec![ProgressHint::Migration]);
    assert_eq!(indicator.closed, 1);
}

#[tokio::test]
async fn test_run_missing_binary_fails_immediately() {
    let config = WorkerConfig::new("/nonexistent/dir/mailsync", "/tmp");
    let err = ModeRunner::new(config).test().await.unwrap_err();
    assert!(matches!(err, Error::Spawn { .. }));
}

#[tokio::test]
async fn test_sync_split_line_is_framed() {
    let (_dir, config) = worker(
        r#"printf '["d1"]\n["d2"'
sleep 0.2
printf ']\n'"#,
    );

    let session = ModeRunner::new(config).sync().unwrap();
    let (batches, closes) = collect(session).await;

    assert_eq!(batches[0], vec!["[\"d1\"]"]);
    assert_eq!(batches.concat(), vec!["[\"d1\"]", "[\"d2\"]"]);
    assert_eq!(closes.len(), 1);
    assert!(closes[0].is_success());
}

#[tokio::test]
async fn test_sync_trailing_status_becomes_close_error() {
    let (_dir, config) = worker(
        r#"printf '["d1"]\n{"error":"ErrorParse","error_service":"imap"}'
exit 1"#,
    );

    let session = ModeRunner::new(config).sync().unwrap();
    let (batches, closes) = collect(session).await;

    assert_eq!(batches.concat(), vec!["[\"d1\"]"]);
    let close = &closes[0];
    assert_eq!(close.code, Some(1));
    assert_eq!(
        close.error.as_ref().unwrap().message,
        "Parsing Error (IMAP)"
    );
}

#[tokio::test]
async fn test_sync_handshake_is_first_stdin_data() {
    let (_dir, config) = worker(
        r#"echo '["ready"]'
read -r account
read -r identity
echo "$account"
echo "$identity""#,
    );

    let session = ModeRunner::new(config)
        .with_binding(binding())
        .sync()
        .unwrap();
    let (batches, closes) = collect(session).await;

    let lines = batches.concat();
    assert_eq!(lines.len(), 3);
    let account: Value = serde_json::from_str(&lines[1]).unwrap();
    let identity: Value = serde_json::from_str(&lines[2]).unwrap();
    assert_eq!(account["emailAddress"], "user@example.com");
    assert_eq!(identity, json!({"token": "identity"}));
    assert!(closes[0].is_success());
}

#[tokio::test]
async fn test_sync_command_reaches_worker() {
    let (_dir, config) = worker(
        r#"echo '["ready"]'
read -r command
echo "$command""#,
    );

    let mut session = ModeRunner::new(config).sync().unwrap();
    let first = tokio::time::timeout(TIMEOUT, session.next_event())
        .await
        .unwrap();
    assert!(matches!(first, Some(WorkerEvent::Deltas(_))));

    session.send(&WorkerCommand::WakeWorkers).unwrap();
    let (batches, closes) = collect(session).await;

    assert_eq!(batches.concat(), vec!["{\"type\":\"wake-workers\"}"]);
    assert!(closes[0].is_success());
}

#[tokio::test]
async fn test_double_kill_closes_once() {
    let (_dir, config) = worker(
        r#"echo '["started"]'
exec sleep 30"#,
    );

    let mut session = ModeRunner::new(config).sync().unwrap();
    let first = tokio::time::timeout(TIMEOUT, session.next_event())
        .await
        .unwrap();
    assert!(matches!(first, Some(WorkerEvent::Deltas(_))));

    session.kill();
    session.kill();
    let (_, closes) = collect(session).await;

    assert_eq!(closes.len(), 1);
    assert!(closes[0].killed);
    assert!(closes[0].error.is_none());
    assert_eq!(closes[0].signal, Some(9));
}

#[tokio::test]
async fn test_bridge_gives_up_after_repeated_crashes() {
    let (_dir, config) = worker(
        r#"echo 'Response Code: 401' >&2
exit 1"#,
    );
    let bridge = SyncBridge::new(ModeRunner::new(config).with_binding(binding())).with_backoff(
        BackoffConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
            ..BackoffConfig::default()
        },
    );
    let (handle, mut events) = bridge.start();

    let mut restarts = 0;
    let failed = tokio::time::timeout(TIMEOUT, async {
        loop {
            match events.recv().await.unwrap() {
                BridgeEvent::Restarting { .. } => restarts += 1,
                BridgeEvent::Failed {
                    auth_failure,
                    close,
                } => break (auth_failure, close),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(restarts, 4);
    assert!(failed.0);
    assert_eq!(failed.1.unwrap().code, Some(1));
    handle.stopped().await;
}

#[tokio::test]
async fn test_bridge_shutdown_does_not_restart() {
    let (_dir, config) = worker(
        r#"echo '["hello"]'
exec sleep 30"#,
    );
    let (handle, mut events) = SyncBridge::new(ModeRunner::new(config)).start();

    let first = tokio::time::timeout(TIMEOUT, events.recv()).await.unwrap();
    assert!(matches!(first, Some(BridgeEvent::Deltas(_))));

    handle.shutdown();
    let next = tokio::time::timeout(TIMEOUT, events.recv()).await.unwrap();
    assert!(matches!(next, Some(BridgeEvent::Stopped)));
    handle.stopped().await;
}
