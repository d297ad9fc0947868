//! Outbound job reports.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, JobError, RateLimitError, RetryError};
use crate::retry::{AttemptFailure, RunSuccess};
use crate::stream::StreamEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    Failed,
}

/// What the assistant produced.
#[derive(Debug, Clone, Serialize)]
pub struct ResultPayload {
    pub text: Option<String>,
    pub subtype: Option<String>,
    /// The assistant's own conversation id.
    pub assistant_session: Option<String>,
    pub total_cost_usd: Option<f64>,
    pub num_turns: Option<u64>,
}

/// Category of a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalErrorKind {
    InvalidJob,
    ResourceBusy,
    RateLimited,
    RetriesExhausted,
    AssistantRejected,
    WorkspaceUnavailable,
    Cancelled,
    Internal,
}

/// Structured failure carried by a failed report.
#[derive(Debug, Clone, Serialize)]
pub struct TerminalError {
    pub kind: TerminalErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    /// Per-attempt failures, oldest first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<AttemptFailure>,
}

impl TerminalError {
    pub fn new(kind: TerminalErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after_ms: None,
            history: Vec::new(),
        }
    }
}

impl From<&Error> for TerminalError {
    fn from(error: &Error) -> Self {
        let message = error.to_string();
        match error {
            Error::Job(JobError::Invalid { .. }) => Self::new(TerminalErrorKind::InvalidJob, message),
            Error::Job(JobError::Cancelled { .. } | JobError::ShuttingDown) => {
                Self::new(TerminalErrorKind::Cancelled, message)
            }
            Error::Lock(_) => Self::new(TerminalErrorKind::ResourceBusy, message),
            Error::RateLimit(RateLimitError::Denied { retry_after }) => Self {
                retry_after_ms: Some(retry_after.as_millis() as u64),
                ..Self::new(TerminalErrorKind::RateLimited, message)
            },
            Error::Cache(_) => Self::new(TerminalErrorKind::WorkspaceUnavailable, message),
            Error::Retry(retry) => {
                let kind = match retry {
                    RetryError::Exhausted { .. } => TerminalErrorKind::RetriesExhausted,
                    RetryError::NonRetryable { .. } => TerminalErrorKind::AssistantRejected,
                    RetryError::Cancelled { .. } => TerminalErrorKind::Cancelled,
                    RetryError::RateLimited { .. } => TerminalErrorKind::RateLimited,
                };
                let mut history = retry.history().to_vec();
                if let RetryError::NonRetryable { failure, .. } = retry {
                    history.push(failure.clone());
                }
                let retry_after_ms = match retry {
                    RetryError::RateLimited { retry_after, .. } => Some(retry_after.as_millis() as u64),
                    _ => None,
                };
                Self {
                    retry_after_ms,
                    history,
                    ..Self::new(kind, message)
                }
            }
            _ => Self::new(TerminalErrorKind::Internal, message),
        }
    }
}

/// Final outcome of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub idempotency_key: String,
    pub session_id: Uuid,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TerminalError>,
    /// Attempts started.
    pub attempts: u32,
    pub latency_ms: u64,
    pub completed_at: DateTime<Utc>,
    /// Events of the successful attempt.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transcript: Vec<StreamEvent>,
}

impl JobReport {
    pub fn success(idempotency_key: &str, session_id: Uuid, run: RunSuccess, latency_ms: u64) -> Self {
        let result = ResultPayload {
            text: run.result.result.clone(),
            subtype: run.result.subtype.clone(),
            assistant_session: run.result.session_id.clone(),
            total_cost_usd: run.result.total_cost_usd,
            num_turns: run.result.num_turns,
        };
        Self {
            idempotency_key: idempotency_key.to_string(),
            session_id,
            status: JobStatus::Succeeded,
            result: Some(result),
            error: None,
            attempts: run.attempts,
            latency_ms,
            completed_at: Utc::now(),
            transcript: run.events,
        }
    }

    pub fn failure(
        idempotency_key: &str,
        session_id: Uuid,
        error: TerminalError,
        attempts: u32,
        latency_ms: u64,
    ) -> Self {
        Self {
            idempotency_key: idempotency_key.to_string(),
            session_id,
            status: JobStatus::Failed,
            result: None,
            error: Some(error),
            attempts,
            latency_ms,
            completed_at: Utc::now(),
            transcript: Vec::new(),
        }
    }

    /// Report for a job refused before it got a session.
    pub fn rejected(idempotency_key: &str, error: &Error) -> Self {
        Self::failure(idempotency_key, Uuid::nil(), error.into(), 0, 0)
    }

    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Succeeded
    }

    pub fn error_kind(&self) -> Option<TerminalErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}
