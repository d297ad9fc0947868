//! Session coordinator: runs jobs concurrently on top of the lock manager,
//! rate limiter, workspace cache, and retry executor.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, Semaphore, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::job::Job;
use super::report::{JobReport, TerminalError, TerminalErrorKind};
use super::state::{SessionRecord, SessionState, SessionSummary};
use crate::cache::{CodebaseCache, Materializer};
use crate::config::RunnerConfig;
use crate::error::{Error, JobError, Result};
use crate::locks::ResourceLockManager;
use crate::process::{AssistantLauncher, LaunchRequest};
use crate::rate_limit::{RateLimiter, Reservation};
use crate::retry::{RetryExecutor, RunSuccess};

/// Handle to a submitted job.
#[derive(Debug)]
pub struct JobHandle {
    session_id: Uuid,
    idempotency_key: String,
    duplicate: bool,
    cancel: Option<CancellationToken>,
    outcome: watch::Receiver<Option<JobReport>>,
}

impl JobHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    /// Whether this submission matched an earlier one with the same key.
    pub fn is_duplicate(&self) -> bool {
        self.duplicate
    }

    /// Ask the session to stop. No effect once it has finished.
    pub fn cancel(&self) {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
    }

    /// Wait for the terminal report.
    pub async fn wait(mut self) -> JobReport {
        loop {
            let current = self.outcome.borrow_and_update().clone();
            if let Some(report) = current {
                return report;
            }
            if self.outcome.changed().await.is_err() {
                let last = self.outcome.borrow().clone();
                return last.unwrap_or_else(|| {
                    JobReport::failure(
                        &self.idempotency_key,
                        self.session_id,
                        TerminalError::new(
                            TerminalErrorKind::Internal,
                            "session ended without reporting",
                        ),
                        0,
                        0,
                    )
                });
            }
        }
    }
}

struct LiveSession {
    record: SessionRecord,
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<JobReport>>,
}

/// Remembers terminal reports by idempotency key.
struct Ledger {
    completed: HashMap<String, JobReport>,
    order: VecDeque<String>,
    capacity: usize,
    in_flight: HashMap<String, Uuid>,
}

impl Ledger {
    fn new(capacity: usize) -> Self {
        Self {
            completed: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            in_flight: HashMap::new(),
        }
    }

    fn record(&mut self, report: JobReport) {
        let key = report.idempotency_key.clone();
        if self.completed.insert(key.clone(), report).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.completed.remove(&oldest);
            }
        }
    }
}

struct Inner {
    config: RunnerConfig,
    locks: ResourceLockManager,
    cache: CodebaseCache,
    limiter: Arc<RateLimiter>,
    executor: RetryExecutor,
    run_slots: Arc<Semaphore>,
    sessions: RwLock<HashMap<Uuid, LiveSession>>,
    ledger: Mutex<Ledger>,
    shutdown: CancellationToken,
    idle: Notify,
}

/// Accepts jobs and runs each as an independent session task.
#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

impl SessionCoordinator {
    pub fn new(
        config: RunnerConfig,
        launcher: Arc<dyn AssistantLauncher>,
        materializer: Arc<dyn Materializer>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::from_config(&config.rate));
        let executor = RetryExecutor::new(
            launcher,
            Arc::clone(&limiter),
            config.retry.clone(),
            config.rate.cost_per_attempt,
            config.rate.wait,
        );
        let cache = CodebaseCache::new(&config.cache, materializer);
        let run_slots = Arc::new(Semaphore::new(config.max_parallel_sessions.max(1)));
        let ledger = Mutex::new(Ledger::new(config.idempotency_capacity));

        Self {
            inner: Arc::new(Inner {
                config,
                locks: ResourceLockManager::new(),
                cache,
                limiter,
                executor,
                run_slots,
                sessions: RwLock::new(HashMap::new()),
                ledger,
                shutdown: CancellationToken::new(),
                idle: Notify::new(),
            }),
        }
    }

    /// Validate `job` and start a session for it.
    ///
    /// A key with a recorded terminal report returns that report without
    /// running anything; a key that is still running attaches to the
    /// existing session.
    pub async fn submit(&self, job: Job) -> Result<JobHandle> {
        job.validate()?;
        let cost = self.inner.config.rate.cost_per_attempt;
        if cost > self.inner.limiter.limit() {
            return Err(JobError::Invalid {
                reason: format!(
                    "attempt cost {cost} can never fit a rate budget of {}",
                    self.inner.limiter.limit()
                ),
            }
            .into());
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(JobError::ShuttingDown.into());
        }

        let mut ledger = self.inner.ledger.lock();
        if let Some(report) = ledger.completed.get(&job.idempotency_key) {
            info!(
                idempotency_key = %job.idempotency_key,
                session_id = %report.session_id,
                "Duplicate job already finished, returning recorded report"
            );
            let (_tx, rx) = watch::channel(Some(report.clone()));
            return Ok(JobHandle {
                session_id: report.session_id,
                idempotency_key: job.idempotency_key,
                duplicate: true,
                cancel: None,
                outcome: rx,
            });
        }
        if let Some(session_id) = ledger.in_flight.get(&job.idempotency_key).copied()
            && let Some(live) = self.inner.sessions.read().get(&session_id)
        {
            info!(
                idempotency_key = %job.idempotency_key,
                %session_id,
                "Duplicate job still running, attaching"
            );
            return Ok(JobHandle {
                session_id,
                idempotency_key: job.idempotency_key,
                duplicate: true,
                cancel: Some(live.cancel.clone()),
                outcome: live.outcome.clone(),
            });
        }

        let session_id = Uuid::new_v4();
        let cancel = self.inner.shutdown.child_token();
        let (tx, rx) = watch::channel(None);
        ledger
            .in_flight
            .insert(job.idempotency_key.clone(), session_id);
        self.inner.sessions.write().insert(
            session_id,
            LiveSession {
                record: SessionRecord::new(session_id, &job),
                cancel: cancel.clone(),
                outcome: rx.clone(),
            },
        );
        drop(ledger);

        info!(
            %session_id,
            idempotency_key = %job.idempotency_key,
            operation = %job.operation,
            repository = %job.repository,
            branch = %job.branch,
            "Job accepted"
        );

        let handle = JobHandle {
            session_id,
            idempotency_key: job.idempotency_key.clone(),
            duplicate: false,
            cancel: Some(cancel.clone()),
            outcome: rx,
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let report = inner.run_session(session_id, &job, &cancel).await;
            inner.finish(session_id, &job, report.clone());
            tx.send_replace(Some(report));
        });

        Ok(handle)
    }

    /// Cancel a live session. Returns false if it is unknown or finished.
    pub fn cancel(&self, session_id: Uuid) -> bool {
        match self.inner.sessions.read().get(&session_id) {
            Some(live) if live.record.state.is_active() => {
                info!(%session_id, "Cancelling session");
                live.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Snapshot of a live session.
    pub fn status(&self, session_id: Uuid) -> Option<SessionRecord> {
        self.inner
            .sessions
            .read()
            .get(&session_id)
            .map(|live| live.record.clone())
    }

    /// Recorded terminal report for `idempotency_key`, if any.
    pub fn report(&self, idempotency_key: &str) -> Option<JobReport> {
        self.inner.ledger.lock().completed.get(idempotency_key).cloned()
    }

    pub fn active_sessions(&self) -> Vec<Uuid> {
        self.inner
            .sessions
            .read()
            .values()
            .filter(|live| live.record.state.is_active())
            .map(|live| live.record.session_id)
            .collect()
    }

    pub fn summary(&self) -> SessionSummary {
        let sessions = self.inner.sessions.read();
        let mut summary = SessionSummary::default();
        for live in sessions.values() {
            match live.record.state {
                SessionState::Queued => summary.queued += 1,
                SessionState::LockWait => summary.lock_wait += 1,
                SessionState::RateWait => summary.rate_wait += 1,
                SessionState::Running => summary.running += 1,
                SessionState::Succeeded | SessionState::Failed => {}
            }
        }
        summary.total = sessions.len();
        summary
    }

    pub fn locks(&self) -> &ResourceLockManager {
        &self.inner.locks
    }

    pub fn cache(&self) -> &CodebaseCache {
        &self.inner.cache
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    /// Stop accepting jobs, cancel every live session, and wait up to
    /// `grace` for them to finish. Returns the number still running.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        info!("Shutting down session coordinator");
        self.inner.shutdown.cancel();
        let deadline = Instant::now() + grace;
        loop {
            let idle = self.inner.idle.notified();
            let remaining = self.inner.sessions.read().len();
            if remaining == 0 {
                return 0;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                let remaining = self.inner.sessions.read().len();
                warn!(remaining, "Sessions still running after shutdown grace period");
                return remaining;
            }
        }
    }
}

impl Inner {
    async fn run_session(&self, session_id: Uuid, job: &Job, cancel: &CancellationToken) -> JobReport {
        let started = Instant::now();
        let outcome = self.drive(session_id, job, cancel).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(run) => {
                self.transition(session_id, SessionState::Succeeded, None);
                info!(
                    %session_id,
                    idempotency_key = %job.idempotency_key,
                    attempts = run.attempts,
                    latency_ms,
                    assistant_session = run.result.session_id.as_deref().unwrap_or("-"),
                    status = "succeeded",
                    "Job finished"
                );
                JobReport::success(&job.idempotency_key, session_id, run, latency_ms)
            }
            Err(error) => {
                self.transition(session_id, SessionState::Failed, Some(error.to_string()));
                let attempts = match &error {
                    Error::Retry(retry) => retry.attempts(),
                    _ => self.attempts(session_id),
                };
                let terminal = TerminalError::from(&error);
                warn!(
                    %session_id,
                    idempotency_key = %job.idempotency_key,
                    attempts,
                    latency_ms,
                    kind = ?terminal.kind,
                    error = %error,
                    status = "failed",
                    "Job finished"
                );
                JobReport::failure(&job.idempotency_key, session_id, terminal, attempts, latency_ms)
            }
        }
    }

    /// Lock, reserve, check out a workspace, run, clean up. Every resource is
    /// released on every path out of here.
    async fn drive(
        &self,
        session_id: Uuid,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<RunSuccess> {
        let cancelled = || Error::from(JobError::Cancelled { id: session_id });

        self.transition(session_id, SessionState::LockWait, None);
        let lock = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            lock = self.locks.acquire(&job.repository, &job.branch, session_id, self.config.lock_timeout) => lock?,
        };

        self.transition(session_id, SessionState::RateWait, None);
        let reservation = self.reserve(session_id, cancel).await?;

        self.transition(session_id, SessionState::Running, None);
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            permit = Arc::clone(&self.run_slots).acquire_owned() => {
                permit.map_err(|_| Error::from(JobError::ShuttingDown))?
            }
        };
        let workspace = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            workspace = self.cache.acquire(&job.repository, &job.branch) => workspace?,
        };

        let request = LaunchRequest {
            session_id,
            attempt: 1,
            workdir: workspace.path().to_path_buf(),
            prompt: job.prompt.clone(),
            permissions: job.operation.permissions(),
        };
        let note_attempt = |attempt: u32| self.note_attempt(session_id, attempt);
        let outcome = self
            .executor
            .run(request, Some(reservation), cancel, &note_attempt)
            .await;

        // The workspace may have been edited even if the run failed.
        if job.operation.mutates() && self.attempts(session_id) > 0 {
            self.cache.invalidate(&job.repository, &job.branch).await;
        }
        self.cache.release(workspace).await;
        drop(permit);
        self.locks.release(lock);

        outcome.map_err(Error::from)
    }

    async fn reserve(&self, session_id: Uuid, cancel: &CancellationToken) -> Result<Reservation> {
        let rate = &self.config.rate;
        match self.limiter.acquire(rate.cost_per_attempt, rate.wait, cancel).await {
            Some(Ok(reservation)) => Ok(reservation),
            Some(Err(e)) => {
                debug!(%session_id, error = %e, "Rate budget refused");
                Err(e.into())
            }
            None => Err(JobError::Cancelled { id: session_id }.into()),
        }
    }

    fn transition(&self, session_id: Uuid, state: SessionState, reason: Option<String>) {
        let mut sessions = self.sessions.write();
        if let Some(live) = sessions.get_mut(&session_id) {
            match live.record.transition_to(state, reason) {
                Ok(()) => debug!(%session_id, %state, "Session state changed"),
                Err(e) => warn!(%session_id, error = %e, "Ignoring invalid session transition"),
            }
        }
    }

    fn note_attempt(&self, session_id: Uuid, attempt: u32) {
        if let Some(live) = self.sessions.write().get_mut(&session_id) {
            live.record.attempts = attempt;
        }
    }

    fn attempts(&self, session_id: Uuid) -> u32 {
        self.sessions
            .read()
            .get(&session_id)
            .map(|live| live.record.attempts)
            .unwrap_or(0)
    }

    /// Move a finished session out of the live table and record its report.
    fn finish(&self, session_id: Uuid, job: &Job, report: JobReport) {
        let mut ledger = self.ledger.lock();
        ledger.in_flight.remove(&job.idempotency_key);
        if is_final(&report) {
            ledger.record(report);
        }
        let mut sessions = self.sessions.write();
        sessions.remove(&session_id);
        if sessions.is_empty() {
            self.idle.notify_waiters();
        }
    }
}

/// Whether a report settles its idempotency key. Cancelled, busy and
/// rate-limited jobs may be redelivered and should run again.
fn is_final(report: &JobReport) -> bool {
    !matches!(
        report.error_kind(),
        Some(
            TerminalErrorKind::Cancelled
                | TerminalErrorKind::ResourceBusy
                | TerminalErrorKind::RateLimited
        )
    )
}
