//! Error types for the assist runner.

use std::time::Duration;

use uuid::Uuid;

use crate::retry::AttemptFailure;

/// Top-level error type for the runner.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Rate limit error: {0}")]
    RateLimit(#[from] RateLimitError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Retry error: {0}")]
    Retry(#[from] RetryError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to install logging: {0}")]
    Logging(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while decoding the assistant's output stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Stream ended without a result event after {events} events")]
    Incomplete { events: u64 },

    #[error("IO error while reading stream: {0}")]
    Io(#[from] std::io::Error),
}

/// Assistant process errors.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to launch {program}: {reason}")]
    Launch { program: String, reason: String },

    #[error("Process output unavailable: {0}")]
    MissingStdout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Invalid job: {reason}")]
    Invalid { reason: String },

    #[error("Session {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Session {id} was cancelled")]
    Cancelled { id: Uuid },

    #[error("Coordinator is shutting down")]
    ShuttingDown,
}

/// Resource lock errors.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Resource busy: {repository}@{branch} still held by {holder:?} after {waited:?}")]
    Timeout {
        repository: String,
        branch: String,
        waited: Duration,
        holder: Option<Uuid>,
    },
}

/// Rate limiter errors.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("Rate limit denied, retry after {retry_after:?}")]
    Denied { retry_after: Duration },
}

/// Workspace cache errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Failed to materialize {repository}@{reference}: {reason}")]
    Materialize {
        repository: String,
        reference: String,
        reason: String,
    },

    #[error("Materialization of {repository}@{reference} timed out after {timeout:?}")]
    Timeout {
        repository: String,
        reference: String,
        timeout: Duration,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminal errors from the retry executor.
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("Gave up after {attempts} attempts: {}", summarize(history))]
    Exhausted {
        attempts: u32,
        history: Vec<AttemptFailure>,
    },

    #[error("Attempt {attempt} failed with a non-retryable error: {failure}")]
    NonRetryable {
        attempt: u32,
        failure: AttemptFailure,
        history: Vec<AttemptFailure>,
    },

    #[error("Cancelled during attempt {attempt}")]
    Cancelled {
        attempt: u32,
        history: Vec<AttemptFailure>,
    },

    #[error("No rate budget for a retry after attempt {attempt}, retry after {retry_after:?}")]
    RateLimited {
        attempt: u32,
        retry_after: Duration,
        history: Vec<AttemptFailure>,
    },
}

impl RetryError {
    /// Failures recorded before the executor stopped.
    pub fn history(&self) -> &[AttemptFailure] {
        match self {
            Self::Exhausted { history, .. }
            | Self::NonRetryable { history, .. }
            | Self::Cancelled { history, .. }
            | Self::RateLimited { history, .. } => history,
        }
    }

    /// Number of attempts that were started.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } => *attempts,
            Self::NonRetryable { attempt, .. }
            | Self::Cancelled { attempt, .. }
            | Self::RateLimited { attempt, .. } => *attempt,
        }
    }
}

fn summarize(history: &[AttemptFailure]) -> String {
    history
        .iter()
        .enumerate()
        .map(|(i, f)| format!("#{} {}", i + 1, f))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for the runner.
pub type Result<T> = std::result::Result<T, Error>;
