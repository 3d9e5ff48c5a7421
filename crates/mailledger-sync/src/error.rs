//! Error types for the sync bridge.

use thiserror::Error;

/// A worker run that ended in failure.
///
/// `message` is the classified, human-readable text. `raw_log` is the worker
/// output with every known secret masked, so it is safe to show or upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    /// Classified message (see [`crate::classify`]).
    pub message: String,
    /// Redacted worker output.
    pub raw_log: String,
    /// Raw error code from the status line, e.g. `ErrorAuthentication`.
    pub code: Option<String>,
    /// Exit code of the worker, if it exited normally.
    pub exit_code: Option<i32>,
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Errors that can occur while supervising a worker.
#[derive(Debug, Error)]
pub enum Error {
    /// The worker binary could not be launched.
    #[error("Failed to spawn worker {path}: {source}")]
    Spawn {
        /// Path of the binary we tried to run.
        path: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// I/O error on one of the worker pipes.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The worker finished unsuccessfully.
    #[error("{0}")]
    Worker(WorkerFailure),

    /// The worker's stdin can no longer be written.
    #[error("Worker stdin is closed")]
    StdinClosed,

    /// A pipe was not available after spawn.
    #[error("Worker {0} was not piped")]
    MissingPipe(&'static str),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns the worker failure, if this error is one.
    #[must_use]
    pub const fn as_worker_failure(&self) -> Option<&WorkerFailure> {
        match self {
            Self::Worker(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
