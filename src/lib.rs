//! Assist runner: resilient multi-session orchestration of an AI coding
//! assistant CLI.

pub mod cache;
pub mod config;
pub mod error;
pub mod locks;
pub mod logging;
pub mod process;
pub mod rate_limit;
pub mod retry;
pub mod session;
pub mod stream;

pub use config::RunnerConfig;
pub use error::{Error, Result};
pub use session::{Job, JobHandle, JobReport, Operation, SessionCoordinator};
