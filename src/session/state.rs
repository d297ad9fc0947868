//! Session state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::{Job, Operation};
use crate::error::JobError;

/// Lifecycle of one job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Accepted, not yet contending for anything.
    Queued,
    /// Waiting for the (repository, branch) lock.
    LockWait,
    /// Holding the lock, waiting for rate budget.
    RateWait,
    /// Assistant attempts in progress.
    Running,
    Succeeded,
    Failed,
}

impl SessionState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, target),
            (Queued, LockWait) | (Queued, Failed) |
            (LockWait, RateWait) | (LockWait, Failed) |
            (RateWait, Running) | (RateWait, Failed) |
            (Running, Succeeded) | (Running, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::LockWait => "lock_wait",
            Self::RateWait => "rate_wait",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: SessionState,
    pub to: SessionState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Live bookkeeping for one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub idempotency_key: String,
    pub operation: Operation,
    pub repository: String,
    pub branch: String,
    pub state: SessionState,
    /// Attempts started so far.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    /// When the session started running.
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub transitions: Vec<StateTransition>,
}

impl SessionRecord {
    pub fn new(session_id: Uuid, job: &Job) -> Self {
        Self {
            session_id,
            idempotency_key: job.idempotency_key.clone(),
            operation: job.operation,
            repository: job.repository.clone(),
            branch: job.branch.clone(),
            state: SessionState::Queued,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: SessionState,
        reason: Option<String>,
    ) -> Result<(), JobError> {
        if !self.state.can_transition_to(new_state) {
            return Err(JobError::InvalidTransition {
                id: self.session_id,
                state: self.state.to_string(),
                target: new_state.to_string(),
            });
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        });
        self.state = new_state;

        match new_state {
            SessionState::Running if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            SessionState::Succeeded | SessionState::Failed => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }

        Ok(())
    }
}

/// Counts of live sessions per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub total: usize,
    pub queued: usize,
    pub lock_wait: usize,
    pub rate_wait: usize,
    pub running: usize,
}
