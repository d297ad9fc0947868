//! Inbound job requests.

use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::process::FilePermissions;

/// What a job does to its repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Read-only analysis.
    Index,
    /// May edit files in the workspace.
    Modify,
}

impl Operation {
    pub fn permissions(&self) -> FilePermissions {
        match self {
            Self::Index => FilePermissions::ReadOnly,
            Self::Modify => FilePermissions::FullAccess,
        }
    }

    /// Whether a run leaves the cached workspace out of date.
    pub fn mutates(&self) -> bool {
        matches!(self, Self::Modify)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index => write!(f, "index"),
            Self::Modify => write!(f, "modify"),
        }
    }
}

/// A unit of work submitted by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub operation: Operation,
    pub repository: String,
    pub branch: String,
    pub prompt: String,
    pub idempotency_key: String,
}

impl Job {
    pub fn new(
        operation: Operation,
        repository: impl Into<String>,
        branch: impl Into<String>,
        prompt: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            repository: repository.into(),
            branch: branch.into(),
            prompt: prompt.into(),
            idempotency_key: idempotency_key.into(),
        }
    }

    /// Reject jobs that could never run.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.idempotency_key.trim().is_empty() {
            return Err(invalid("idempotency_key must not be empty"));
        }
        if self.repository.trim().is_empty() {
            return Err(invalid("repository must not be empty"));
        }
        if self.repository.starts_with('-') {
            return Err(invalid(&format!(
                "repository '{}' must not start with '-'",
                self.repository
            )));
        }
        if self.repository.chars().any(char::is_control) {
            return Err(invalid("repository must not contain control characters"));
        }
        if self.prompt.trim().is_empty() {
            return Err(invalid("prompt must not be empty"));
        }
        validate_branch(&self.branch)
    }
}

/// Simplified `git check-ref-format` rules.
fn validate_branch(branch: &str) -> Result<(), JobError> {
    if branch.is_empty() {
        return Err(invalid("branch must not be empty"));
    }
    if branch.starts_with('-') || branch.starts_with('/') || branch.ends_with('/') {
        return Err(invalid(&format!("branch '{branch}' has a leading '-' or stray '/'")));
    }
    if branch.contains("..") || branch.contains("@{") || branch.ends_with(".lock") {
        return Err(invalid(&format!("branch '{branch}' is not a valid ref name")));
    }
    if let Some(c) = branch
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(*c))
    {
        return Err(invalid(&format!("branch '{branch}' contains {c:?}")));
    }
    Ok(())
}

fn invalid(reason: &str) -> JobError {
    JobError::Invalid {
        reason: reason.to_string(),
    }
}
