//! Fixed-window rate limiter with refundable reservations.
//!
//! Budget is reserved atomically with `check_and_reserve`. A reservation
//! that is dropped without being committed gives its budget back, as long as
//! the window it was taken from is still current.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{RateConfig, RateWaitPolicy};
use crate::error::RateLimitError;

/// Smallest `retry_after` handed out, so callers never spin.
const MIN_RETRY_AFTER: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct Window {
    id: u64,
    started: Instant,
    used: u64,
    throttled_until: Option<Instant>,
}

impl Window {
    fn roll(&mut self, now: Instant, length: Duration) {
        if now.saturating_duration_since(self.started) >= length {
            self.id += 1;
            self.started = now;
            self.used = 0;
        }
    }
}

/// Outcome of `check_and_reserve`.
#[derive(Debug)]
pub enum RateDecision {
    Allowed(Reservation),
    Denied { retry_after: Duration },
}

/// Budget taken from the current window.
#[derive(Debug)]
pub struct Reservation {
    cost: u64,
    window_id: u64,
    window: Arc<Mutex<Window>>,
    committed: bool,
}

impl Reservation {
    /// Keep the budget spent; call right before launching.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut window = self.window.lock();
        if window.id == self.window_id {
            window.used = window.used.saturating_sub(self.cost);
            debug!(cost = self.cost, "Refunded unused rate budget");
        }
    }
}

/// Shared limiter for assistant invocations.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u64,
    length: Duration,
    window: Arc<Mutex<Window>>,
}

impl RateLimiter {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            length: window,
            window: Arc::new(Mutex::new(Window {
                id: 0,
                started: Instant::now(),
                used: 0,
                throttled_until: None,
            })),
        }
    }

    pub fn from_config(config: &RateConfig) -> Self {
        Self::new(config.limit, config.window)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Reserve `cost` units if the current window has room.
    ///
    /// A cost larger than the whole limit is always denied.
    pub fn check_and_reserve(&self, cost: u64) -> RateDecision {
        let now = Instant::now();
        let mut window = self.window.lock();
        window.roll(now, self.length);

        if let Some(until) = window.throttled_until {
            if until > now {
                return RateDecision::Denied {
                    retry_after: (until - now).max(MIN_RETRY_AFTER),
                };
            }
            window.throttled_until = None;
        }

        if cost > self.limit {
            warn!(cost, limit = self.limit, "Requested cost exceeds the rate limit");
            return RateDecision::Denied {
                retry_after: self.length,
            };
        }

        if window.used + cost > self.limit {
            let resets_at = window.started + self.length;
            return RateDecision::Denied {
                retry_after: resets_at.saturating_duration_since(now).max(MIN_RETRY_AFTER),
            };
        }

        window.used += cost;
        RateDecision::Allowed(Reservation {
            cost,
            window_id: window.id,
            window: Arc::clone(&self.window),
            committed: false,
        })
    }

    /// Record that the provider pushed back; no budget is handed out for
    /// `retry_after`, capped at one window.
    pub fn note_throttled(&self, retry_after: Duration) {
        let retry_after = if retry_after > self.length {
            warn!(
                requested_ms = retry_after.as_millis() as u64,
                window_ms = self.length.as_millis() as u64,
                "Provider back-off longer than the rate window, capping it"
            );
            self.length
        } else {
            retry_after
        };
        let until = Instant::now() + retry_after;
        let mut window = self.window.lock();
        if window.throttled_until.is_none_or(|current| current < until) {
            window.throttled_until = Some(until);
        }
        debug!(retry_after_ms = retry_after.as_millis() as u64, "Provider throttled");
    }

    /// Remaining provider back-off, if any.
    pub fn backoff_hint(&self) -> Option<Duration> {
        let now = Instant::now();
        let window = self.window.lock();
        window
            .throttled_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Reserve `cost`, waiting for budget as long as `policy` allows.
    ///
    /// Returns `None` once `cancel` fires; a cancelled caller never holds
    /// budget.
    pub async fn acquire(
        &self,
        cost: u64,
        policy: RateWaitPolicy,
        cancel: &CancellationToken,
    ) -> Option<Result<Reservation, RateLimitError>> {
        let max_wait = match policy {
            RateWaitPolicy::Queue { max_wait } => max_wait,
            RateWaitPolicy::Reject => Duration::ZERO,
        };
        let mut waited = Duration::ZERO;
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            let retry_after = match self.check_and_reserve(cost) {
                RateDecision::Allowed(reservation) => return Some(Ok(reservation)),
                RateDecision::Denied { retry_after } => retry_after,
            };
            if cost > self.limit || waited + retry_after > max_wait {
                return Some(Err(RateLimitError::Denied { retry_after }));
            }
            debug!(
                retry_after_ms = retry_after.as_millis() as u64,
                waited_ms = waited.as_millis() as u64,
                "Waiting for rate budget"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(retry_after) => waited += retry_after,
            }
        }
    }

    /// Budget left in the current window.
    pub fn remaining(&self) -> u64 {
        let mut window = self.window.lock();
        window.roll(Instant::now(), self.length);
        self.limit.saturating_sub(window.used)
    }
}
