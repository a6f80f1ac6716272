use cachelog_types::{OperationId, ProcessingStatus, RemovalReport, StatusOverview};

use crate::processing::ProcessingJob;
use crate::removal::RemovalJobRegistry;

/// Read-only view over the jobs, shaped for pollers.
///
/// Lookups never fail: a missing removal is reported as
/// [`RemovalReport::NotFound`].
#[derive(Clone, Debug)]
pub struct StatusReporter {
    processing: ProcessingJob,
    removals: RemovalJobRegistry,
}

impl StatusReporter {
    pub fn new(processing: ProcessingJob, removals: RemovalJobRegistry) -> Self {
        Self {
            processing,
            removals,
        }
    }

    pub fn processing(&self) -> ProcessingStatus {
        self.processing.status()
    }

    /// Status of `operation_id`, or of the most recent removal when `None`
    pub fn removal(&self, operation_id: Option<&OperationId>) -> RemovalReport {
        let id = match operation_id {
            Some(id) => id.clone(),
            None => match self.removals.latest_id() {
                Some(id) => id,
                None => return RemovalReport::NotFound { operation_id: None },
            },
        };

        match self.removals.get(&id) {
            Ok(status) => RemovalReport::Found(status),
            Err(_) => RemovalReport::NotFound {
                operation_id: Some(id),
            },
        }
    }

    pub fn overview(&self) -> StatusOverview {
        StatusOverview {
            processing: self.processing.status(),
            removals: self.removals.list(),
        }
    }
}
