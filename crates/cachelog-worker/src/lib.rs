//! External log worker invocation for cachelog
//!
//! The worker is a separate executable that does the actual counting,
//! processing and removal of cache log lines. This crate launches it, follows
//! its progress file, and turns its exit status and JSON output into a typed
//! result. It never touches job state; the jobs crate maps results onto
//! transitions.

mod error;
mod invoker;
mod output;
mod request;

pub use error::WorkerError;
pub use invoker::{ProgressSink, Worker, WorkerInvoker, invoke_with_progress};
pub use output::{WorkerOutput, parse_document, parse_progress};
pub use request::{Subcommand, WorkerRequest};

// Re-export types used in our public API
pub use cachelog_types::{ServiceCounts, WorkerProgress};
