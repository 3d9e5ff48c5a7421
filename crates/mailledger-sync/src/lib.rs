//! # mailledger-sync
//!
//! Supervisor and line-delimited JSON bridge for the native mail sync worker.
//!
//! The worker binary does the actual IMAP/SMTP work. This crate launches it,
//! hands it the account it should work on, frames what it prints, and turns
//! its failures into classified, redacted errors.
//!
//! ## Features
//!
//! - **Process supervision**: one owned child per [`WorkerProcess`], handshake
//!   on first output, idempotent [`KillSwitch`]
//! - **Framing**: newline-delimited JSON over a growable byte buffer
//! - **Errors**: worker codes mapped to user messages, secrets masked in logs
//! - **Modes**: single-result `migrate` / `test` / `reset`, streaming `sync`
//! - **Restarts**: [`SyncBridge`] with backoff and crash tracking
//!
//! ## Example
//!
//! ```ignore
//! use mailledger_sync::{AccountBinding, ModeRunner, WorkerConfig, WorkerEvent};
//!
//! let runner = ModeRunner::new(WorkerConfig::from_defaults()?)
//!     .with_binding(AccountBinding::new(account, identity));
//!
//! let mut session = runner.sync()?;
//! while let Some(event) = session.next_event().await {
//!     match event {
//!         WorkerEvent::Deltas(batch) => apply(batch),
//!         WorkerEvent::Close(info) => println!("worker exited: {:?}", info.code),
//!         WorkerEvent::Error(e) => eprintln!("{e}"),
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod account;
pub mod backoff;
pub mod bridge;
pub mod classify;
pub mod config;
pub mod crash;
pub mod error;
pub mod framer;
pub mod mode;
pub mod protocol;
pub mod redact;
pub mod runner;
pub mod supervisor;

pub use account::AccountBinding;
pub use backoff::{BackoffConfig, BackoffPolicy, BackoffScheduler, ExponentialBackoff};
pub use bridge::{BridgeEvent, BridgeHandle, SyncBridge};
pub use classify::{ErrorCategory, ErrorCode, Localizer, NoLocalization, classify};
pub use config::WorkerConfig;
pub use crash::CrashTracker;
pub use error::{Error, Result, WorkerFailure};
pub use framer::{LineFramer, Trailer};
pub use mode::Mode;
pub use protocol::{DeltaBatch, StatusEnvelope, WorkerCommand};
pub use redact::{Secrets, redact};
pub use runner::{
    CloseInfo, ModeRunner, NoIndicator, ProgressHint, StatusIndicator, SyncSession, WorkerEvent,
    WorkerResponse,
};
pub use supervisor::{Activity, KillSwitch, StdinHandle, StreamKind, WorkerProcess};
