//! Assistant process abstraction.
//!
//! A launcher turns a `LaunchRequest` into a running process: a stdout pipe
//! carrying line-delimited JSON plus a future that resolves to the exit status.
//! Dropping an `AssistantProcess` kills the underlying process (best-effort).

pub mod cli;
pub mod scripted;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::error::ProcessError;

pub use cli::CliAssistant;
pub use scripted::{ScriptedLauncher, ScriptedRun};

/// Tool access granted to the assistant for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilePermissions {
    ReadOnly,
    FullAccess,
}

impl FilePermissions {
    /// Tool names passed to `--allowedTools`.
    pub fn allowed_tools(&self) -> &'static [&'static str] {
        match self {
            Self::ReadOnly => &[
                "Read",
                "LS",
                "Glob",
                "Grep",
                "WebFetch",
                "WebSearch",
                "Bash",
                "TodoRead",
                "Agent",
            ],
            Self::FullAccess => &[
                "Read",
                "LS",
                "Glob",
                "Grep",
                "Write",
                "Edit",
                "MultiEdit",
                "Bash",
                "NotebookRead",
                "NotebookEdit",
                "TodoRead",
                "TodoWrite",
                "WebFetch",
                "WebSearch",
                "Agent",
            ],
        }
    }
}

/// Everything a launcher needs for one attempt.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub session_id: Uuid,
    pub attempt: u32,
    pub workdir: PathBuf,
    pub prompt: String,
    pub permissions: FilePermissions,
}

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
    /// Captured (truncated) stderr.
    pub stderr: String,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Resolves once the process has exited.
pub type ExitFuture = Pin<Box<dyn Future<Output = Result<ProcessExit, ProcessError>> + Send>>;

/// A running assistant process.
pub struct AssistantProcess {
    /// Line-delimited JSON output.
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// Exit status; dropping it kills the process.
    pub exit: ExitFuture,
    /// OS process id, when there is one.
    pub pid: Option<u32>,
}

impl std::fmt::Debug for AssistantProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssistantProcess")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Starts assistant processes.
#[async_trait]
pub trait AssistantLauncher: Send + Sync {
    /// Name used in logs and launch errors.
    fn name(&self) -> &str;

    /// Start one process for `request`.
    async fn launch(&self, request: &LaunchRequest) -> Result<AssistantProcess, ProcessError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_access_is_a_superset_of_read_only() {
        let full = FilePermissions::FullAccess.allowed_tools();
        for tool in FilePermissions::ReadOnly.allowed_tools() {
            assert!(full.contains(tool), "{tool} missing from full access");
        }
        assert!(!FilePermissions::ReadOnly.allowed_tools().contains(&"Write"));
        assert!(full.contains(&"Edit"));
    }

    #[test]
    fn exit_success_requires_zero_code() {
        let ok = ProcessExit {
            code: Some(0),
            stderr: String::new(),
        };
        let signalled = ProcessExit {
            code: None,
            stderr: String::new(),
        };
        assert!(ok.success());
        assert!(!signalled.success());
    }
}
