//! Runs one assistant invocation to completion, retrying transient failures.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::AttemptFailure;
use crate::config::{RateWaitPolicy, RetryConfig};
use crate::error::{RateLimitError, RetryError, StreamError};
use crate::process::{AssistantLauncher, ExitFuture, LaunchRequest};
use crate::rate_limit::{RateLimiter, Reservation};
use crate::stream::{EventKind, ResultEvent, StreamEvent, decode_reader};

/// How long a process gets to exit on its own after its result was read.
const REAP_GRACE: Duration = Duration::from_secs(30);

/// How long to wait for an exit status once stdout has closed.
const EXIT_WAIT: Duration = Duration::from_secs(10);

/// Characters of assistant text included in log lines.
const PREVIEW_CHARS: usize = 120;

/// A successful invocation.
#[derive(Debug, Clone)]
pub struct RunSuccess {
    /// The final result event.
    pub result: ResultEvent,
    /// Every event of the successful attempt, in emission order.
    pub events: Vec<StreamEvent>,
    /// Attempts used, including the successful one.
    pub attempts: u32,
    /// Failures of the earlier attempts.
    pub history: Vec<AttemptFailure>,
}

enum AttemptOutcome {
    Succeeded {
        result: ResultEvent,
        events: Vec<StreamEvent>,
    },
    Failed(AttemptFailure),
    Cancelled,
}

/// Retry loop around an [`AssistantLauncher`].
pub struct RetryExecutor {
    launcher: Arc<dyn AssistantLauncher>,
    limiter: Arc<RateLimiter>,
    config: RetryConfig,
    cost_per_attempt: u64,
    rate_wait: RateWaitPolicy,
}

impl RetryExecutor {
    pub fn new(
        launcher: Arc<dyn AssistantLauncher>,
        limiter: Arc<RateLimiter>,
        config: RetryConfig,
        cost_per_attempt: u64,
        rate_wait: RateWaitPolicy,
    ) -> Self {
        Self {
            launcher,
            limiter,
            config,
            cost_per_attempt,
            rate_wait,
        }
    }

    /// Run `request` until it succeeds, fails permanently, runs out of
    /// attempts, or `cancel` fires.
    ///
    /// `first` is the rate budget already reserved for attempt 1; when absent
    /// the executor reserves it itself. Every later attempt reserves its own
    /// budget under the configured `RateWaitPolicy`. `on_attempt` is called
    /// with the attempt number right before each launch. Nothing is launched
    /// or committed once `cancel` has fired.
    pub async fn run(
        &self,
        mut request: LaunchRequest,
        first: Option<Reservation>,
        cancel: &CancellationToken,
        on_attempt: &(dyn Fn(u32) + Send + Sync),
    ) -> Result<RunSuccess, RetryError> {
        let mut history: Vec<AttemptFailure> = Vec::new();
        let mut reservation = first;
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.retry_delay(attempt - 1);
                debug!(
                    session_id = %request.session_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Backing off before retry"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(RetryError::Cancelled { attempt: attempt - 1, history });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let budget = match reservation.take() {
                Some(r) => r,
                None => match self
                    .limiter
                    .acquire(self.cost_per_attempt, self.rate_wait, cancel)
                    .await
                {
                    Some(Ok(r)) => r,
                    Some(Err(RateLimitError::Denied { retry_after })) => {
                        warn!(
                            session_id = %request.session_id,
                            attempt,
                            retry_after_ms = retry_after.as_millis() as u64,
                            "No rate budget for retry"
                        );
                        return Err(RetryError::RateLimited {
                            attempt: attempt - 1,
                            retry_after,
                            history,
                        });
                    }
                    None => {
                        return Err(RetryError::Cancelled {
                            attempt: attempt - 1,
                            history,
                        });
                    }
                },
            };

            // The unused reservation is refunded on drop.
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled {
                    attempt: attempt - 1,
                    history,
                });
            }

            request.attempt = attempt;
            on_attempt(attempt);
            budget.commit();

            match self.attempt(&request, cancel).await {
                AttemptOutcome::Succeeded { result, events } => {
                    info!(
                        session_id = %request.session_id,
                        launcher = self.launcher.name(),
                        attempt,
                        events = events.len(),
                        cost_usd = ?result.total_cost_usd,
                        "Assistant run succeeded"
                    );
                    return Ok(RunSuccess {
                        result,
                        events,
                        attempts: attempt,
                        history,
                    });
                }
                AttemptOutcome::Cancelled => {
                    info!(session_id = %request.session_id, attempt, "Assistant run cancelled");
                    return Err(RetryError::Cancelled { attempt, history });
                }
                AttemptOutcome::Failed(failure) => {
                    warn!(
                        session_id = %request.session_id,
                        attempt,
                        max_attempts,
                        error = %failure,
                        "Assistant attempt failed"
                    );
                    if let AttemptFailure::RateLimited {
                        retry_after_ms: Some(ms),
                        ..
                    } = &failure
                    {
                        self.limiter.note_throttled(Duration::from_millis(*ms));
                    }
                    if !failure.is_retryable() {
                        return Err(RetryError::NonRetryable {
                            attempt,
                            failure,
                            history,
                        });
                    }
                    history.push(failure);
                }
            }
        }

        Err(RetryError::Exhausted {
            attempts: max_attempts,
            history,
        })
    }

    /// Backoff delay before retry `n`, never shorter than the limiter's hint.
    fn retry_delay(&self, n: u32) -> Duration {
        let delay = self.config.backoff.delay(n);
        match self.limiter.backoff_hint() {
            Some(hint) => delay.max(hint),
            None => delay,
        }
    }

    async fn attempt(&self, request: &LaunchRequest, cancel: &CancellationToken) -> AttemptOutcome {
        let process = match self.launcher.launch(request).await {
            Ok(process) => process,
            Err(e) => {
                warn!(
                    session_id = %request.session_id,
                    launcher = self.launcher.name(),
                    attempt = request.attempt,
                    error = %e,
                    "Failed to launch assistant"
                );
                return AttemptOutcome::Failed(AttemptFailure::Launch {
                    reason: e.to_string(),
                });
            }
        };
        let mut exit = process.exit;
        let mut stream = decode_reader(process.stdout, self.config.malformed_buffer_limit);
        let mut collected: Vec<StreamEvent> = Vec::new();
        let mut malformed = 0usize;

        let deadline = tokio::time::sleep(self.config.attempt_timeout);
        tokio::pin!(deadline);

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return AttemptOutcome::Cancelled,
                _ = &mut deadline => {
                    return AttemptOutcome::Failed(AttemptFailure::Timeout {
                        after_ms: self.config.attempt_timeout.as_millis() as u64,
                    });
                }
                item = stream.next() => item,
            };

            match item {
                Some(Ok(event)) => {
                    log_event(request, &event);
                    match &event.kind {
                        EventKind::Malformed(_) => {
                            malformed += 1;
                            if malformed > self.config.malformed_tolerance {
                                return AttemptOutcome::Failed(AttemptFailure::TooManyMalformed {
                                    count: malformed,
                                });
                            }
                        }
                        EventKind::Result(result) => {
                            let result = result.clone();
                            collected.push(event);
                            reap_in_background(exit, request);
                            if result.is_error {
                                return AttemptOutcome::Failed(AttemptFailure::from_error_result(
                                    &result,
                                ));
                            }
                            return AttemptOutcome::Succeeded {
                                result,
                                events: collected,
                            };
                        }
                        _ => {}
                    }
                    collected.push(event);
                }
                Some(Err(StreamError::Incomplete { events })) => {
                    return self.ended_without_result(&mut exit, events, cancel).await;
                }
                Some(Err(StreamError::Io(e))) => {
                    return AttemptOutcome::Failed(AttemptFailure::Io {
                        reason: e.to_string(),
                    });
                }
                None => {
                    let seen = collected.len() as u64;
                    return self.ended_without_result(&mut exit, seen, cancel).await;
                }
            }
        }
    }

    /// Stdout closed before a result: a non-zero exit is a crash, otherwise
    /// the stream was cut short.
    async fn ended_without_result(
        &self,
        exit: &mut ExitFuture,
        events: u64,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => return AttemptOutcome::Cancelled,
            status = tokio::time::timeout(EXIT_WAIT, exit) => status,
        };
        match status {
            Ok(Ok(status)) if !status.success() => AttemptOutcome::Failed(AttemptFailure::Crash {
                code: status.code,
                stderr: status.stderr,
            }),
            Ok(Err(e)) => AttemptOutcome::Failed(AttemptFailure::Crash {
                code: None,
                stderr: e.to_string(),
            }),
            _ => AttemptOutcome::Failed(AttemptFailure::IncompleteStream { events }),
        }
    }
}

/// Let the process finish on its own; dropping the future after the grace
/// period kills it.
fn reap_in_background(exit: ExitFuture, request: &LaunchRequest) {
    let session_id = request.session_id;
    let attempt = request.attempt;
    tokio::spawn(async move {
        match tokio::time::timeout(REAP_GRACE, exit).await {
            Ok(Ok(status)) if !status.success() => {
                warn!(%session_id, attempt, code = ?status.code, "Assistant exited non-zero after its result");
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(%session_id, attempt, error = %e, "Failed to reap assistant process"),
            Err(_) => warn!(%session_id, attempt, "Assistant still running after its result, killing it"),
        }
    });
}

fn log_event(request: &LaunchRequest, event: &StreamEvent) {
    let session_id = request.session_id;
    let attempt = request.attempt;
    let assistant_session = event.session_id().unwrap_or("-");
    match &event.kind {
        EventKind::System(system) => info!(
            %session_id,
            assistant_session,
            attempt,
            seq = event.seq,
            subtype = system.subtype.as_deref().unwrap_or("-"),
            "Assistant system event"
        ),
        EventKind::Assistant(message) => {
            let preview: String = message
                .text()
                .unwrap_or_default()
                .chars()
                .take(PREVIEW_CHARS)
                .collect();
            info!(
                %session_id,
                assistant_session,
                attempt,
                seq = event.seq,
                %preview,
                "Assistant message"
            );
        }
        EventKind::Result(result) => info!(
            %session_id,
            assistant_session,
            attempt,
            seq = event.seq,
            is_error = result.is_error,
            turns = ?result.num_turns,
            "Assistant result"
        ),
        EventKind::Unknown { tag, .. } => {
            debug!(
                %session_id,
                assistant_session,
                attempt,
                seq = event.seq,
                tag = ?tag,
                "Unrecognized assistant event"
            )
        }
        EventKind::Malformed(malformed) => warn!(
            %session_id,
            assistant_session,
            attempt,
            seq = event.seq,
            reason = %malformed.reason,
            bytes = malformed.raw.len(),
            "Malformed assistant output"
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use uuid::Uuid;

    use super::*;
    use crate::process::{FilePermissions, ScriptedLauncher, ScriptedRun};
    use crate::retry::BackoffPolicy;

    fn config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            backoff: BackoffPolicy::none(),
            attempt_timeout: Duration::from_secs(5),
            malformed_buffer_limit: 1024,
            malformed_tolerance: 2,
        }
    }

    fn queue(max_wait: Duration) -> RateWaitPolicy {
        RateWaitPolicy::Queue { max_wait }
    }

    fn executor(launcher: Arc<ScriptedLauncher>, max_attempts: u32) -> RetryExecutor {
        RetryExecutor::new(
            launcher,
            Arc::new(RateLimiter::new(100, Duration::from_secs(60))),
            config(max_attempts),
            1,
            queue(Duration::from_secs(60)),
        )
    }

    fn request() -> LaunchRequest {
        LaunchRequest {
            session_id: Uuid::new_v4(),
            attempt: 0,
            workdir: PathBuf::from("/tmp/ws"),
            prompt: "summarize".into(),
            permissions: FilePermissions::ReadOnly,
        }
    }

    fn noop(_: u32) {}

    #[tokio::test]
    async fn first_success_returns_transcript() {
        let launcher = Arc::new(ScriptedLauncher::always(ScriptedRun::success("done")));
        let outcome = executor(launcher.clone(), 3)
            .run(request(), None, &CancellationToken::new(), &noop)
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.result.result.as_deref(), Some("done"));
        assert_eq!(outcome.events.len(), 2);
        assert!(outcome.events.last().unwrap().is_result());
        assert!(outcome.history.is_empty());
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test]
    async fn crashes_are_retried_until_success() {
        let launcher = Arc::new(ScriptedLauncher::new(vec![
            ScriptedRun::crash(1, "segfault"),
            ScriptedRun::crash(1, "segfault"),
            ScriptedRun::success("third time"),
        ]));
        let seen = parking_lot::Mutex::new(Vec::new());
        let observe = |n: u32| seen.lock().push(n);

        let outcome = executor(launcher.clone(), 3)
            .run(request(), None, &CancellationToken::new(), &observe)
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.history.len(), 2);
        assert!(matches!(
            outcome.history[0],
            AttemptFailure::Crash { code: Some(1), .. }
        ));
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        let attempts: Vec<u32> = launcher.records().iter().map(|r| r.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn exhaustion_reports_every_failure() {
        let launcher = Arc::new(ScriptedLauncher::new(vec![
            ScriptedRun::LaunchFailure("missing".into()),
            ScriptedRun::crash(2, "oom"),
            ScriptedRun::lines(&[r#"{"type":"system","subtype":"init"}"#], 0),
        ]));
        let err = executor(launcher, 3)
            .run(request(), None, &CancellationToken::new(), &noop)
            .await
            .unwrap_err();

        match err {
            RetryError::Exhausted { attempts, history } => {
                assert_eq!(attempts, 3);
                assert!(matches!(history[0], AttemptFailure::Launch { .. }));
                assert!(matches!(history[1], AttemptFailure::Crash { code: Some(2), .. }));
                assert_eq!(history[2], AttemptFailure::IncompleteStream { events: 1 });
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejection_stops_immediately() {
        let launcher = Arc::new(ScriptedLauncher::always(ScriptedRun::error_result(
            "error_max_turns",
            "Reached max turns",
        )));
        let err = executor(launcher.clone(), 3)
            .run(request(), None, &CancellationToken::new(), &noop)
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::NonRetryable { attempt: 1, .. }));
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test]
    async fn internal_errors_are_retried() {
        let launcher = Arc::new(ScriptedLauncher::new(vec![
            ScriptedRun::error_result("error_during_execution", "tool loop crashed"),
            ScriptedRun::success("recovered"),
        ]));
        let outcome = executor(launcher, 3)
            .run(request(), None, &CancellationToken::new(), &noop)
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 2);
        assert!(matches!(
            outcome.history[0],
            AttemptFailure::InternalError { .. }
        ));
    }

    #[tokio::test]
    async fn too_many_malformed_lines_fail_the_attempt() {
        let garbage = ScriptedRun::lines(&["}{", "not json", "<<>>", "]]"], 0);
        let launcher = Arc::new(ScriptedLauncher::new(vec![
            garbage,
            ScriptedRun::success("clean"),
        ]));
        let outcome = executor(launcher, 2)
            .run(request(), None, &CancellationToken::new(), &noop)
            .await
            .unwrap();
        assert_eq!(
            outcome.history,
            vec![AttemptFailure::TooManyMalformed { count: 3 }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out() {
        let slow = ScriptedRun::success("late").with_delay(Duration::from_secs(60));
        let launcher = Arc::new(ScriptedLauncher::always(slow));
        let err = executor(launcher, 1)
            .run(request(), None, &CancellationToken::new(), &noop)
            .await
            .unwrap_err();
        match err {
            RetryError::Exhausted { history, .. } => {
                assert_eq!(history, vec![AttemptFailure::Timeout { after_ms: 5000 }]);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_a_running_attempt() {
        let slow = ScriptedRun::success("never").with_delay(Duration::from_secs(3));
        let launcher = Arc::new(ScriptedLauncher::always(slow));
        let exec = executor(launcher, 3);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = exec.run(request(), None, &cancel, &noop).await.unwrap_err();
        assert!(matches!(err, RetryError::Cancelled { attempt: 1, .. }));
    }

    #[tokio::test]
    async fn each_attempt_consumes_rate_budget() {
        let launcher = Arc::new(ScriptedLauncher::new(vec![
            ScriptedRun::crash(1, ""),
            ScriptedRun::success("ok"),
        ]));
        let limiter = Arc::new(RateLimiter::new(10, Duration::from_secs(60)));
        let exec = RetryExecutor::new(
            launcher,
            limiter.clone(),
            config(3),
            2,
            queue(Duration::from_secs(60)),
        );

        exec.run(request(), None, &CancellationToken::new(), &noop)
            .await
            .unwrap();
        assert_eq!(limiter.remaining(), 6);
    }

    #[tokio::test]
    async fn cancelled_before_start_launches_nothing() {
        let launcher = Arc::new(ScriptedLauncher::always(ScriptedRun::success("ok")));
        let limiter = Arc::new(RateLimiter::new(10, Duration::from_secs(60)));
        let exec = RetryExecutor::new(
            launcher.clone(),
            limiter.clone(),
            config(3),
            1,
            queue(Duration::from_secs(60)),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let first = match limiter.check_and_reserve(1) {
            crate::rate_limit::RateDecision::Allowed(r) => r,
            other => panic!("expected budget, got {other:?}"),
        };
        let err = exec
            .run(request(), Some(first), &cancel, &noop)
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::Cancelled { attempt: 0, .. }));
        assert_eq!(launcher.launches(), 0);
        assert_eq!(limiter.remaining(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn provider_back_off_sets_the_retry_delay() {
        let launcher = Arc::new(ScriptedLauncher::new(vec![
            ScriptedRun::throttled(20.0),
            ScriptedRun::success("after the pause"),
        ]));
        let started = tokio::time::Instant::now();
        let outcome = executor(launcher, 3)
            .run(request(), None, &CancellationToken::new(), &noop)
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 2);
        assert!(started.elapsed() >= Duration::from_secs(20));
        assert!(matches!(
            outcome.history[0],
            AttemptFailure::RateLimited {
                retry_after_ms: Some(20_000),
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn absurd_provider_back_off_is_bounded() {
        let launcher = Arc::new(ScriptedLauncher::new(vec![
            ScriptedRun::throttled(1e9),
            ScriptedRun::success("eventually"),
        ]));
        let limiter = Arc::new(RateLimiter::new(100, Duration::from_secs(60)));
        let exec = RetryExecutor::new(
            launcher,
            limiter,
            config(3),
            1,
            queue(Duration::from_secs(300)),
        );
        let started = tokio::time::Instant::now();
        let outcome = exec
            .run(request(), None, &CancellationToken::new(), &noop)
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 2);
        assert!(started.elapsed() <= Duration::from_secs(61));
    }

    #[tokio::test]
    async fn retry_without_budget_fails_under_reject_policy() {
        let launcher = Arc::new(ScriptedLauncher::always(ScriptedRun::crash(1, "boom")));
        let limiter = Arc::new(RateLimiter::new(1, Duration::from_secs(60)));
        let exec = RetryExecutor::new(
            launcher.clone(),
            limiter,
            config(3),
            1,
            RateWaitPolicy::Reject,
        );
        let err = exec
            .run(request(), None, &CancellationToken::new(), &noop)
            .await
            .unwrap_err();

        match err {
            RetryError::RateLimited {
                attempt, history, ..
            } => {
                assert_eq!(attempt, 1);
                assert_eq!(history.len(), 1);
            }
            other => panic!("expected rate denial, got {other:?}"),
        }
        assert_eq!(launcher.launches(), 1);
    }
}
