//! Scripted assistant for tests and dry runs.
//!
//! Each launch pops the next `ScriptedRun`; the last one repeats once the
//! script is exhausted. Output is written through an in-memory pipe, so the
//! decoder sees the same chunked byte stream a real process would produce.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::io::AsyncWriteExt;

use super::{AssistantLauncher, AssistantProcess, FilePermissions, LaunchRequest, ProcessExit};
use crate::error::ProcessError;

/// In-memory pipe capacity.
const PIPE_CAPACITY: usize = 4 * 1024;

/// One scripted process invocation.
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    /// Write `chunks` to stdout (waiting `chunk_delay` before each) then exit.
    Output {
        chunks: Vec<String>,
        chunk_delay: Duration,
        exit_code: i32,
        stderr: String,
    },
    /// Fail to start.
    LaunchFailure(String),
}

impl ScriptedRun {
    /// A run that emits the given lines, one chunk per line.
    pub fn lines(lines: &[&str], exit_code: i32) -> Self {
        Self::Output {
            chunks: lines.iter().map(|l| format!("{l}\n")).collect(),
            chunk_delay: Duration::ZERO,
            exit_code,
            stderr: String::new(),
        }
    }

    /// A run that initializes, answers, and exits cleanly.
    pub fn success(result: &str) -> Self {
        let system = json!({"type": "system", "subtype": "init", "session_id": "scripted"});
        let outcome = json!({
            "type": "result",
            "subtype": "success",
            "is_error": false,
            "result": result,
            "session_id": "scripted",
        });
        Self::lines(&[&system.to_string(), &outcome.to_string()], 0)
    }

    /// A run that prints some output and dies without a result.
    pub fn crash(exit_code: i32, stderr: &str) -> Self {
        let system = json!({"type": "system", "subtype": "init", "session_id": "scripted"});
        Self::Output {
            chunks: vec![format!("{system}\n")],
            chunk_delay: Duration::ZERO,
            exit_code,
            stderr: stderr.to_string(),
        }
    }

    /// A run whose result reports an assistant-side error.
    pub fn error_result(subtype: &str, message: &str) -> Self {
        let outcome = json!({
            "type": "result",
            "subtype": subtype,
            "is_error": true,
            "result": message,
            "session_id": "scripted",
        });
        Self::lines(&[&outcome.to_string()], 1)
    }

    /// A run whose result says the provider is throttling for `retry_after_secs`.
    pub fn throttled(retry_after_secs: f64) -> Self {
        let outcome = json!({
            "type": "result",
            "subtype": "error",
            "is_error": true,
            "result": "429 Too Many Requests",
            "retry_after": retry_after_secs,
            "session_id": "scripted",
        });
        Self::lines(&[&outcome.to_string()], 1)
    }

    /// Wait `delay` before each chunk.
    pub fn with_delay(self, delay: Duration) -> Self {
        match self {
            Self::Output {
                chunks,
                exit_code,
                stderr,
                ..
            } => Self::Output {
                chunks,
                chunk_delay: delay,
                exit_code,
                stderr,
            },
            other => other,
        }
    }
}

/// A launch seen by the scripted assistant.
#[derive(Debug, Clone)]
pub struct LaunchRecord {
    pub session_id: uuid::Uuid,
    pub attempt: u32,
    pub workdir: PathBuf,
    pub prompt: String,
    pub permissions: FilePermissions,
}

#[derive(Debug, Default)]
struct Occupancy {
    active: usize,
    max_active: usize,
    /// (active, max) per working directory.
    per_dir: HashMap<PathBuf, (usize, usize)>,
}

/// Released when a scripted process stops producing output.
struct ActiveGuard {
    occupancy: Arc<Mutex<Occupancy>>,
    workdir: PathBuf,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut occ = self.occupancy.lock();
        occ.active = occ.active.saturating_sub(1);
        if let Some((active, _)) = occ.per_dir.get_mut(&self.workdir) {
            *active = active.saturating_sub(1);
        }
    }
}

/// Launcher that replays a script instead of spawning processes.
pub struct ScriptedLauncher {
    script: Mutex<VecDeque<ScriptedRun>>,
    last: Mutex<Option<ScriptedRun>>,
    launches: AtomicUsize,
    records: Mutex<Vec<LaunchRecord>>,
    occupancy: Arc<Mutex<Occupancy>>,
}

impl ScriptedLauncher {
    pub fn new(script: Vec<ScriptedRun>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            launches: AtomicUsize::new(0),
            records: Mutex::new(Vec::new()),
            occupancy: Arc::new(Mutex::new(Occupancy::default())),
        }
    }

    /// A launcher that replays `run` for every launch.
    pub fn always(run: ScriptedRun) -> Self {
        Self::new(vec![run])
    }

    /// Total launch calls, including failed ones.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<LaunchRecord> {
        self.records.lock().clone()
    }

    /// Highest number of processes producing output at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.occupancy.lock().max_active
    }

    /// Highest number of processes producing output in `workdir` at once.
    pub fn max_concurrent_in(&self, workdir: &std::path::Path) -> usize {
        self.occupancy
            .lock()
            .per_dir
            .get(workdir)
            .map(|(_, max)| *max)
            .unwrap_or(0)
    }

    fn next_run(&self) -> Option<ScriptedRun> {
        let next = self.script.lock().pop_front();
        let mut last = self.last.lock();
        match next {
            Some(run) => {
                *last = Some(run.clone());
                Some(run)
            }
            None => last.clone(),
        }
    }

    fn occupy(&self, workdir: &std::path::Path) -> ActiveGuard {
        let mut occ = self.occupancy.lock();
        occ.active += 1;
        occ.max_active = occ.max_active.max(occ.active);
        let entry = occ.per_dir.entry(workdir.to_path_buf()).or_insert((0, 0));
        entry.0 += 1;
        entry.1 = entry.1.max(entry.0);
        ActiveGuard {
            occupancy: Arc::clone(&self.occupancy),
            workdir: workdir.to_path_buf(),
        }
    }
}

#[async_trait]
impl AssistantLauncher for ScriptedLauncher {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<AssistantProcess, ProcessError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.records.lock().push(LaunchRecord {
            session_id: request.session_id,
            attempt: request.attempt,
            workdir: request.workdir.clone(),
            prompt: request.prompt.clone(),
            permissions: request.permissions,
        });

        let run = self.next_run().ok_or_else(|| ProcessError::Launch {
            program: "scripted".to_string(),
            reason: "script is empty".to_string(),
        })?;

        let (chunks, chunk_delay, exit_code, stderr) = match run {
            ScriptedRun::LaunchFailure(reason) => {
                return Err(ProcessError::Launch {
                    program: "scripted".to_string(),
                    reason,
                });
            }
            ScriptedRun::Output {
                chunks,
                chunk_delay,
                exit_code,
                stderr,
            } => (chunks, chunk_delay, exit_code, stderr),
        };

        let guard = self.occupy(&request.workdir);
        let (mut tx, rx) = tokio::io::duplex(PIPE_CAPACITY);
        let writer = tokio::spawn(async move {
            for chunk in chunks {
                if !chunk_delay.is_zero() {
                    tokio::time::sleep(chunk_delay).await;
                }
                if tx.write_all(chunk.as_bytes()).await.is_err() {
                    break;
                }
            }
            // Released in the same poll that completes the last write.
            drop(guard);
        });

        let exit = Box::pin(async move {
            let _ = writer.await;
            Ok::<_, ProcessError>(ProcessExit {
                code: Some(exit_code),
                stderr,
            })
        });

        Ok(AssistantProcess {
            stdout: Box::new(rx),
            exit,
            pid: None,
        })
    }
}
