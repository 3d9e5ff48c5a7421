//! Command line front end for the sync worker.
//!
//! Runs one of the single-result modes and prints the worker's response, or
//! keeps a `sync` worker alive for one account and prints each delta line.
//! In `sync`, every line read from stdin is forwarded to the worker as a
//! command.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mailledger_sync::{
    AccountBinding, BridgeEvent, Error, ModeRunner, ProgressHint, StatusIndicator, SyncBridge,
    WorkerCommand, WorkerConfig, WorkerResponse,
};

#[derive(Parser)]
#[command(
    name = "mailledger-syncd",
    version,
    about = "Run the MailLedger sync worker"
)]
struct Cli {
    #[command(flatten)]
    worker: WorkerArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct WorkerArgs {
    /// JSON worker configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Worker binary, overriding the configuration.
    #[arg(long, global = true)]
    binary: Option<PathBuf>,

    /// Directory exported as `CONFIG_DIR_PATH`, overriding the configuration.
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Account record (JSON file) to bind the worker to.
    #[arg(short, long, global = true)]
    account: Option<PathBuf>,

    /// Identity record (JSON file) sent along with the account.
    #[arg(short, long, global = true, requires = "account")]
    identity: Option<PathBuf>,

    /// Pass `--verbose` to the worker for this many minutes.
    #[arg(long, global = true)]
    verbose_minutes: Option<i64>,
}

#[derive(Subcommand)]
enum Command {
    /// Verify the account settings.
    Test,
    /// Run database migrations.
    Migrate,
    /// Drop the local cache of the account.
    Reset,
    /// Keep a sync worker running and print its deltas.
    Sync,
}

/// Reports migration progress on the log.
struct LogIndicator;

impl StatusIndicator for LogIndicator {
    fn show(&mut self, hint: ProgressHint) {
        match hint {
            ProgressHint::Migration => info!("Upgrading the mail database, this may take a while"),
            ProgressHint::Vacuum => info!("Optimizing the mail database, this may take a while"),
        }
    }

    fn close(&mut self) {}
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailledger_sync=info,mailledger_syncd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(err) = run(Cli::parse()).await {
        error!("{err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let runner = build_runner(&cli.worker)?;

    match cli.command {
        Command::Test => print_response(runner.test().await),
        Command::Migrate => print_response(runner.migrate(&mut LogIndicator).await),
        Command::Reset => print_response(runner.reset_cache().await),
        Command::Sync => run_sync(runner).await,
    }
}

fn build_runner(args: &WorkerArgs) -> Result<ModeRunner> {
    let mut config = match &args.config {
        Some(path) => WorkerConfig::load(path)
            .with_context(|| format!("load configuration {}", path.display()))?,
        None => WorkerConfig::from_defaults().context("determine default configuration")?,
    };
    if let Some(binary) = &args.binary {
        config.binary_path.clone_from(binary);
    }
    if let Some(dir) = &args.config_dir {
        config.config_dir.clone_from(dir);
    }
    if let Some(minutes) = args.verbose_minutes {
        config = config.with_verbose_until(verbose_until(chrono::Utc::now(), minutes)?);
    }

    let mut runner = ModeRunner::new(config);
    if let Some(account) = &args.account {
        let account = read_json(account)?;
        let identity = match &args.identity {
            Some(path) => read_json(path)?,
            None => Value::Null,
        };
        runner = runner.with_binding(AccountBinding::new(account, identity));
    }
    Ok(runner)
}

fn verbose_until(now: DateTime<Utc>, minutes: i64) -> Result<DateTime<Utc>> {
    chrono::Duration::try_minutes(minutes)
        .and_then(|span| now.checked_add_signed(span))
        .with_context(|| format!("--verbose-minutes {minutes} is out of range"))
}

fn read_json(path: &Path) -> Result<Value> {
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

fn print_response(result: mailledger_sync::Result<WorkerResponse>) -> Result<()> {
    match result {
        Ok(response) => {
            println!("{}", response.response);
            Ok(())
        }
        Err(Error::Worker(failure)) => {
            if !failure.raw_log.is_empty() {
                eprintln!("{}", failure.raw_log.trim_end());
            }
            bail!("{}", failure.message)
        }
        Err(e) => Err(e).context("run worker"),
    }
}

async fn run_sync(runner: ModeRunner) -> Result<()> {
    let (handle, mut events) = SyncBridge::new(runner).start();
    let mut commands = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(BridgeEvent::Deltas(batch)) => {
                    for line in batch {
                        println!("{line}");
                    }
                }
                Some(BridgeEvent::Error(e)) => warn!(err = %e, "sync worker error"),
                Some(BridgeEvent::Restarting { delay, .. }) => {
                    info!(?delay, "sync worker will be restarted");
                }
                Some(BridgeEvent::Failed { auth_failure, close }) => {
                    let message = close
                        .and_then(|c| c.error)
                        .map_or_else(|| "no error reported".to_string(), |f| f.message);
                    if auth_failure {
                        bail!("sync stopped, the server rejected the credentials: {message}");
                    }
                    bail!("sync stopped after repeated crashes: {message}");
                }
                Some(BridgeEvent::Stopped) | None => break,
            },
            line = commands.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match serde_json::from_str::<Value>(&line) {
                    Ok(value) => handle.send(WorkerCommand::Raw(value))?,
                    Err(e) => warn!(err = %e, "ignoring command that is not JSON"),
                },
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(err = %e, "reading commands failed");
                    stdin_open = false;
                }
            },
            result = tokio::signal::ctrl_c() => {
                result.context("listen for ctrl-c")?;
                info!("shutting down");
                handle.shutdown();
            }
        }
    }

    handle.stopped().await;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_until_adds_minutes() {
        let now = Utc::now();
        let until = verbose_until(now, 30).unwrap();
        assert_eq!(until - now, chrono::Duration::minutes(30));
    }

    #[test]
    fn test_verbose_until_out_of_range() {
        let err = verbose_until(Utc::now(), i64::MAX).unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert!(verbose_until(Utc::now(), 200_000_000_000).is_err());
    }
}
