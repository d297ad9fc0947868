//! Launches the assistant CLI as a child process.
//!
//! Provides:
//! - Working directory isolation (the materialized workspace)
//! - Streaming stdout for the decoder
//! - Bounded stderr capture
//! - Kill-on-drop so cancelled sessions don't leak processes

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use super::{AssistantLauncher, AssistantProcess, LaunchRequest, ProcessExit};
use crate::config::AssistantConfig;
use crate::error::ProcessError;

/// Maximum stderr kept per process (64KB).
const MAX_STDERR_SIZE: usize = 64 * 1024;

/// Assistant launcher backed by the real CLI.
#[derive(Debug, Clone)]
pub struct CliAssistant {
    program: String,
    extra_args: Vec<String>,
}

impl CliAssistant {
    pub fn new(config: &AssistantConfig) -> Self {
        Self {
            program: config.program.clone(),
            extra_args: config.extra_args.clone(),
        }
    }

    /// Arguments for one invocation, excluding the program itself.
    pub fn command_args(&self, request: &LaunchRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            request.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--allowedTools".to_string(),
            request.permissions.allowed_tools().join(","),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl AssistantLauncher for CliAssistant {
    fn name(&self) -> &str {
        &self.program
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<AssistantProcess, ProcessError> {
        let mut command = Command::new(&self.program);
        command
            .args(self.command_args(request))
            .current_dir(&request.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| ProcessError::Launch {
            program: self.program.clone(),
            reason: e.to_string(),
        })?;

        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProcessError::MissingStdout(self.program.clone()))?;

        // Drained concurrently so a chatty stderr can't fill the pipe and stall the child.
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(drain_capped(err, MAX_STDERR_SIZE)));

        tracing::debug!(
            session_id = %request.session_id,
            attempt = request.attempt,
            pid = ?pid,
            workdir = %request.workdir.display(),
            "Launched assistant process"
        );

        let exit = Box::pin(async move {
            let status = child.wait().await?;
            let stderr = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            Ok::<_, ProcessError>(ProcessExit {
                code: status.code(),
                stderr,
            })
        });

        Ok(AssistantProcess {
            stdout: Box::new(stdout),
            exit,
            pid,
        })
    }
}

/// Read `reader` to the end, keeping at most `cap` bytes.
async fn drain_capped<R>(mut reader: R, cap: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&kept).trim().to_string()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use uuid::Uuid;

    use super::*;
    use crate::process::FilePermissions;

    fn request(permissions: FilePermissions) -> LaunchRequest {
        LaunchRequest {
            session_id: Uuid::new_v4(),
            attempt: 1,
            workdir: PathBuf::from("."),
            prompt: "index the repo".to_string(),
            permissions,
        }
    }

    #[test]
    fn args_request_stream_json_and_tool_list() {
        let cli = CliAssistant::new(&AssistantConfig {
            program: "claude".into(),
            extra_args: vec!["--model".into(), "sonnet".into()],
        });
        let args = cli.command_args(&request(FilePermissions::ReadOnly));

        assert_eq!(&args[..2], &["-p", "index the repo"]);
        let fmt = args.iter().position(|a| a == "--output-format").unwrap();
        assert_eq!(args[fmt + 1], "stream-json");
        let tools = args.iter().position(|a| a == "--allowedTools").unwrap();
        assert!(!args[tools + 1].contains("Write"));
        assert_eq!(&args[args.len() - 2..], &["--model", "sonnet"]);
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_error() {
        let cli = CliAssistant::new(&AssistantConfig {
            program: "definitely-not-an-installed-assistant".into(),
            extra_args: vec![],
        });
        let err = cli
            .launch(&request(FilePermissions::FullAccess))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Launch { .. }));
    }

    #[tokio::test]
    async fn stderr_capture_is_capped() {
        let data = vec![b'x'; 10_000];
        let kept = drain_capped(std::io::Cursor::new(data), 100).await;
        assert_eq!(kept.len(), 100);
    }
}
