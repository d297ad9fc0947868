//! Retry policy for assistant invocations.
//!
//! - `backoff`: exponential delay schedule with jitter
//! - `failure`: per-attempt failure taxonomy and result classification
//! - `executor`: the retry loop itself

pub mod backoff;
pub mod executor;
pub mod failure;

pub use backoff::BackoffPolicy;
pub use executor::{RetryExecutor, RunSuccess};
pub use failure::AttemptFailure;
