//! Assistant output decoding.
//!
//! - `event`: typed events (System, Assistant, Result, Unknown, Malformed)
//! - `decoder`: incremental line decoder with truncation recovery
//! - `reader`: async adapter from a pipe to an event stream

pub mod decoder;
pub mod event;
pub mod reader;

pub use decoder::{DEFAULT_BUFFER_LIMIT, StreamDecoder};
pub use event::{AssistantEvent, EventKind, MalformedEvent, ResultEvent, StreamEvent, SystemEvent};
pub use reader::{EventStream, decode_reader};
