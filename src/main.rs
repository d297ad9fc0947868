use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use assist_runner::cache::GitMaterializer;
use assist_runner::process::CliAssistant;
use assist_runner::{Job, JobReport, RunnerConfig, SessionCoordinator, logging};

/// How long in-flight sessions get to wind down after Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RunnerConfig::from_env()?;
    let _log_guard = logging::init(&config.logging)?;

    eprintln!("🛠  Assist Runner v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Assistant: {}", config.assistant.program);
    eprintln!("   Workspaces: {}", config.cache.root.display());
    eprintln!("   Parallel sessions: {}", config.max_parallel_sessions);
    eprintln!("   Reading jobs as JSON lines from stdin.\n");

    let launcher = Arc::new(CliAssistant::new(&config.assistant));
    let materializer = Arc::new(GitMaterializer::new(
        config.cache.root.clone(),
        config.cache.materialize_timeout,
    ));
    let coordinator = SessionCoordinator::new(config, launcher, materializer);

    // Reports are written by a single task so lines never interleave.
    let (report_tx, mut report_rx) = mpsc::unbounded_channel::<JobReport>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(report) = report_rx.recv().await {
            match serde_json::to_string(&report) {
                Ok(line) => {
                    let written = async {
                        stdout.write_all(line.as_bytes()).await?;
                        stdout.write_all(b"\n").await?;
                        stdout.flush().await
                    };
                    if let Err(e) = written.await {
                        tracing::error!("Failed to write report: {}", e);
                        break;
                    }
                }
                Err(e) => tracing::error!("Failed to serialize report: {}", e),
            }
        }
    });

    let mut waiters = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted, shutting down");
                interrupted = true;
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let job: Job = match serde_json::from_str(line) {
                        Ok(job) => job,
                        Err(e) => {
                            tracing::warn!("Ignoring unparsable job line: {}", e);
                            continue;
                        }
                    };
                    match coordinator.submit(job.clone()).await {
                        Ok(handle) => {
                            let tx = report_tx.clone();
                            waiters.spawn(async move {
                                let _ = tx.send(handle.wait().await);
                            });
                        }
                        Err(e) => {
                            tracing::warn!(idempotency_key = %job.idempotency_key, "Job refused: {}", e);
                            let _ = report_tx.send(JobReport::rejected(&job.idempotency_key, &e));
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    }

    if interrupted {
        let remaining = coordinator.shutdown(SHUTDOWN_GRACE).await;
        if remaining > 0 {
            eprintln!("{remaining} sessions did not stop in time");
        }
    }

    while waiters.join_next().await.is_some() {}
    drop(report_tx);
    let _ = writer.await;

    Ok(())
}
