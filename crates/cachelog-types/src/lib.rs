//! Shared types for cachelog
//!
//! This crate contains the job states, identifiers and status snapshots used
//! across the cachelog crates. Everything here is plain data: the crates that
//! own the jobs decide when these values change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Per-service line counts, keyed by service name
pub type ServiceCounts = BTreeMap<String, u64>;

// ============================================================================
// Job States
// ============================================================================

/// State of the log processing pass
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
}

impl ProcessingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether the last run has finished (successfully or not)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a single service removal
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalState {
    /// Accepted, worker not launched yet
    #[default]
    Started,
    Running,
    Completed,
    Failed,
}

impl RemovalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RemovalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Identifiers
// ============================================================================

/// Opaque handle returned when a removal is started
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    /// Generate a fresh, unique identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for OperationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OperationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Worker Progress
// ============================================================================

/// Incremental progress reported by the worker.
///
/// Every field is optional because the worker decides what it reports; the
/// values are passed through to status pollers untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerProgress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent_complete: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lines_processed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lines_removed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_processed: Option<u64>,

    // Reported by processing passes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_lines: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lines_parsed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries_saved: Option<u64>,
}

impl WorkerProgress {
    /// True when the worker reported nothing we recognise
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

// ============================================================================
// Status Snapshots
// ============================================================================

/// Location of the cache logs and whether it is present on disk
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogInfo {
    pub path: PathBuf,
    pub exists: bool,
}

/// Point-in-time view of the processing job
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProcessingStatus {
    pub state: ProcessingState,
    pub position: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<WorkerProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_counts: Option<ServiceCounts>,
}

/// Point-in-time view of one removal job
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RemovalStatus {
    pub operation_id: OperationId,
    pub service: String,
    pub state: RemovalState,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<WorkerProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lines_removed: Option<u64>,
    pub error: Option<String>,
}

/// Result of a removal status lookup. Not finding a job is a normal answer.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RemovalReport {
    Found(RemovalStatus),
    NotFound { operation_id: Option<OperationId> },
}

impl RemovalReport {
    pub fn status(&self) -> Option<&RemovalStatus> {
        match self {
            Self::Found(status) => Some(status),
            Self::NotFound { .. } => None,
        }
    }
}

/// Everything a poller may want in one call
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusOverview {
    pub processing: ProcessingStatus,
    pub removals: Vec<RemovalStatus>,
}
