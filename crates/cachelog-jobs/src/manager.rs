use std::sync::Arc;

use cachelog_types::{
    LogInfo, OperationId, ProcessingStatus, RemovalReport, ServiceCounts, StatusOverview,
};
use cachelog_worker::{Worker, WorkerRequest};

use crate::config::ManagerConfig;
use crate::error::JobError;
use crate::position::{FilePositionStore, PositionStore};
use crate::processing::ProcessingJob;
use crate::removal::RemovalJobRegistry;
use crate::reporter::StatusReporter;

/// Entry point for the outer boundary (HTTP handlers, CLI).
///
/// Owns one processing job, the removal registry, and a status reporter
/// over both. Cheap to clone; clones share the same jobs.
#[derive(Clone)]
pub struct LogManager {
    config: ManagerConfig,
    worker: Arc<dyn Worker>,
    processing: ProcessingJob,
    removals: RemovalJobRegistry,
    reporter: StatusReporter,
}

impl LogManager {
    /// Build a manager that runs the configured worker executable and
    /// persists the position to the configured state file
    pub fn from_config(config: ManagerConfig) -> Result<Self, JobError> {
        let worker = Arc::new(config.invoker());
        let store = Arc::new(FilePositionStore::new(&config.state_file));
        Self::new(config, worker, store)
    }

    pub fn new(
        config: ManagerConfig,
        worker: Arc<dyn Worker>,
        store: Arc<dyn PositionStore>,
    ) -> Result<Self, JobError> {
        let processing = ProcessingJob::new(worker.clone(), store, &config.logs_dir)?
            .with_datasource(config.datasource.clone());
        let removals =
            RemovalJobRegistry::new(worker.clone(), &config.logs_dir, config.removal_retention())
                .with_unobserved_retention(config.removal_unobserved_retention())
                .with_datasource(config.datasource.clone());
        let reporter = StatusReporter::new(processing.clone(), removals.clone());

        Ok(Self {
            config,
            worker,
            processing,
            removals,
            reporter,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn reporter(&self) -> &StatusReporter {
        &self.reporter
    }

    pub async fn log_info(&self) -> LogInfo {
        let path = self.config.logs_dir.clone();
        let exists = match tokio::fs::try_exists(&path).await {
            Ok(exists) => exists,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "could not check logs directory");
                false
            }
        };
        LogInfo { path, exists }
    }

    /// Lines per service, as counted by the worker.
    ///
    /// A worker that runs but reports something other than a
    /// `service_counts` object yields an empty map, not an error. Launch
    /// failures, non-zero exits and timeouts are still errors.
    pub async fn service_counts(&self) -> Result<ServiceCounts, JobError> {
        let request = WorkerRequest::count(&self.config.logs_dir)
            .with_datasource(self.config.datasource.as_deref());
        let output = match self.worker.invoke(request, None).await {
            Ok(output) => output,
            Err(e) if e.is_malformed_output() => {
                tracing::warn!(error = %e, "worker returned unreadable service counts");
                return Ok(ServiceCounts::new());
            }
            Err(e) => return Err(e.into()),
        };

        match output.service_counts() {
            Some(counts) => {
                tracing::debug!(services = counts.len(), "counted services");
                Ok(counts)
            }
            None => {
                tracing::warn!(
                    output = %serde_json::Value::Object(output.document().clone()),
                    "worker output has no service_counts object"
                );
                Ok(ServiceCounts::new())
            }
        }
    }

    pub fn reset_log_position(&self) {
        self.processing.reset_position();
    }

    pub fn start_processing(&self) -> Result<ProcessingStatus, JobError> {
        self.processing.start()
    }

    pub fn processing_status(&self) -> ProcessingStatus {
        self.reporter.processing()
    }

    pub fn start_service_removal(&self, service: &str) -> Result<OperationId, JobError> {
        self.removals.start(service)
    }

    /// Status of a removal; `None` asks for the most recent one
    pub fn removal_status(&self, operation_id: Option<&OperationId>) -> RemovalReport {
        self.reporter.removal(operation_id)
    }

    pub fn status_overview(&self) -> StatusOverview {
        self.reporter.overview()
    }
}

impl std::fmt::Debug for LogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogManager")
            .field("config", &self.config)
            .field("processing", &self.processing)
            .field("removals", &self.removals)
            .finish()
    }
}
