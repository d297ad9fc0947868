//! Job sessions.
//!
//! - `job`: inbound job requests and validation
//! - `state`: per-session state machine and bookkeeping
//! - `report`: terminal reports and structured errors
//! - `coordinator`: runs sessions concurrently

pub mod coordinator;
pub mod job;
pub mod report;
pub mod state;

pub use coordinator::{JobHandle, SessionCoordinator};
pub use job::{Job, Operation};
pub use report::{JobReport, JobStatus, ResultPayload, TerminalError, TerminalErrorKind};
pub use state::{SessionRecord, SessionState, SessionSummary, StateTransition};
