//! Job orchestration for cachelog
//!
//! This crate drives the external log worker: one single-flight processing
//! pass with a persisted log position, any number of per-service removals
//! keyed by operation id, and a read-only status view over both. Work runs on
//! spawned tokio tasks; callers get control back as soon as a job is
//! registered and poll for the outcome.

mod config;
mod error;
mod manager;
mod position;
mod processing;
mod removal;
mod reporter;

#[cfg(test)]
mod testing;

pub use config::ManagerConfig;
pub use error::{JobError, StoreError};
pub use manager::LogManager;
pub use position::{FilePositionStore, MemoryPositionStore, PositionStore};
pub use processing::ProcessingJob;
pub use removal::RemovalJobRegistry;
pub use reporter::StatusReporter;

// Re-export types used in our public API
pub use cachelog_types::{
    LogInfo, OperationId, ProcessingState, ProcessingStatus, RemovalReport, RemovalState,
    RemovalStatus, ServiceCounts, StatusOverview, WorkerProgress,
};
pub use cachelog_worker::{Worker, WorkerError, WorkerInvoker};
