use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cachelog_types::{ProcessingState, ProcessingStatus, ServiceCounts, WorkerProgress};
use cachelog_worker::{Worker, WorkerError, WorkerOutput, WorkerRequest, invoke_with_progress};

use crate::error::JobError;
use crate::position::PositionStore;

/// Mutable part of the processing job, guarded by one mutex
#[derive(Debug, Default)]
struct ProcessingInner {
    state: ProcessingState,
    position: u64,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    progress: Option<WorkerProgress>,
    last_counts: Option<ServiceCounts>,

    /// Position was reset while a run was in flight
    reset_pending: bool,
}

impl ProcessingInner {
    fn snapshot(&self) -> ProcessingStatus {
        ProcessingStatus {
            state: self.state,
            position: self.position,
            started_at: self.started_at,
            finished_at: self.finished_at,
            last_error: self.last_error.clone(),
            progress: self.progress.clone(),
            last_counts: self.last_counts.clone(),
        }
    }
}

/// Single-flight log processing pass.
///
/// Cloning yields another handle to the same job. Only one run can be in
/// flight; [`ProcessingJob::start`] checks and claims the slot in a single
/// critical section.
#[derive(Clone)]
pub struct ProcessingJob {
    inner: Arc<Mutex<ProcessingInner>>,
    worker: Arc<dyn Worker>,
    store: Arc<dyn PositionStore>,
    logs_dir: PathBuf,
    datasource: Option<String>,

    /// Serialises writes to the store; never held together with a status read
    persist: Arc<Mutex<()>>,
}

impl ProcessingJob {
    /// Create the job, picking up the last persisted position
    pub fn new(
        worker: Arc<dyn Worker>,
        store: Arc<dyn PositionStore>,
        logs_dir: impl Into<PathBuf>,
    ) -> Result<Self, JobError> {
        let position = store.load()?;
        tracing::debug!(position, "loaded processing position");

        Ok(Self {
            inner: Arc::new(Mutex::new(ProcessingInner {
                position,
                ..Default::default()
            })),
            worker,
            store,
            logs_dir: logs_dir.into(),
            datasource: None,
            persist: Arc::new(Mutex::new(())),
        })
    }

    /// Datasource name handed to the worker on every pass
    pub fn with_datasource(mut self, datasource: Option<String>) -> Self {
        self.datasource = datasource;
        self
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    /// Current snapshot; never waits for the worker or the store
    pub fn status(&self) -> ProcessingStatus {
        self.inner.lock().snapshot()
    }

    /// Rewind the position to the start of the logs.
    ///
    /// A running pass is left alone: the offset it reports is dropped, so the
    /// reset applies to the next start. A finished job goes back to idle.
    pub fn reset_position(&self) {
        {
            let mut inner = self.inner.lock();
            inner.position = 0;

            match inner.state {
                ProcessingState::Running => {
                    inner.reset_pending = true;
                    tracing::info!("log position reset while processing, applies to next run");
                }
                ProcessingState::Completed | ProcessingState::Failed => {
                    inner.state = ProcessingState::Idle;
                    inner.last_error = None;
                    inner.progress = None;
                    tracing::info!("log position reset");
                }
                ProcessingState::Idle => {
                    tracing::info!("log position reset");
                }
            }
        }

        let _persist = self.persist.lock();
        if let Err(e) = self.store.save(0) {
            tracing::error!(error = %e, "failed to persist reset log position");
        }
    }

    /// Claim the processing slot and launch the worker in the background.
    ///
    /// Returns as soon as the job is `Running`. Must be called from within a
    /// tokio runtime.
    pub fn start(&self) -> Result<ProcessingStatus, JobError> {
        let (start_position, status) = {
            let mut inner = self.inner.lock();
            if inner.state == ProcessingState::Running {
                return Err(JobError::Conflict(
                    "log processing is already running".to_string(),
                ));
            }

            inner.state = ProcessingState::Running;
            inner.started_at = Some(Utc::now());
            inner.finished_at = None;
            inner.last_error = None;
            inner.progress = None;
            inner.last_counts = None;
            inner.reset_pending = false;
            (inner.position, inner.snapshot())
        };

        tracing::info!(
            position = start_position,
            logs_dir = %self.logs_dir.display(),
            "starting log processing"
        );

        let job = self.clone();
        let request = WorkerRequest::process(&self.logs_dir, start_position)
            .with_datasource(self.datasource.as_deref());
        let run = tokio::spawn(async move {
            let result = invoke_with_progress(job.worker.as_ref(), request, |p| {
                job.record_progress(p)
            })
            .await;
            job.finish(result).await;
        });

        // A panicking worker must not leave the slot claimed forever
        let job = self.clone();
        tokio::spawn(async move {
            if let Err(e) = run.await {
                if e.is_panic() {
                    tracing::error!(error = %e, "log processing task panicked");
                    job.settle(Err(format!("log processing task failed: {e}")));
                }
            }
        });

        Ok(status)
    }

    fn record_progress(&self, progress: WorkerProgress) {
        let mut inner = self.inner.lock();
        if inner.state == ProcessingState::Running {
            inner.progress = Some(progress);
        }
    }

    async fn finish(&self, result: Result<WorkerOutput, WorkerError>) {
        let output = match result {
            Ok(output) => output,
            Err(e) => {
                tracing::error!(error = %e, "log processing failed");
                self.settle(Err(e.to_string()));
                return;
            }
        };

        {
            let mut inner = self.inner.lock();
            if let Some(progress) = output.progress() {
                inner.progress = Some(progress);
            }
            inner.last_counts = output.service_counts();
        }

        let outcome = match output.position() {
            Some(position) => match self.persist(position).await {
                Ok(true) => Ok(Some(position)),
                Ok(false) => {
                    tracing::info!(
                        reported = position,
                        "discarding reported position after reset"
                    );
                    Ok(None)
                }
                // Keeping the old offset means the next run re-reads lines,
                // so treat it as a failed pass
                Err(e) => Err(e),
            },
            None => {
                tracing::warn!("worker did not report a new log position");
                Ok(None)
            }
        };

        self.settle(outcome);
    }

    /// Save `position` off the runtime threads; `Ok(false)` when a reset
    /// arrived first and the position was dropped
    async fn persist(&self, position: u64) -> Result<bool, String> {
        let job = self.clone();
        let task = tokio::task::spawn_blocking(move || {
            let _persist = job.persist.lock();
            if job.inner.lock().reset_pending {
                return Ok(false);
            }
            job.store.save(position).map(|()| true)
        });

        match task.await {
            Ok(Ok(saved)) => Ok(saved),
            Ok(Err(e)) => {
                tracing::error!(position, error = %e, "failed to persist log position");
                Err(e.to_string())
            }
            Err(e) => {
                tracing::error!(position, error = %e, "position persist task failed");
                Err(format!("position persist task failed: {e}"))
            }
        }
    }

    /// Leave `Running`, committing the new position unless a reset won.
    /// A run that already left `Running` is not touched.
    fn settle(&self, outcome: Result<Option<u64>, String>) {
        let mut inner = self.inner.lock();
        if inner.state != ProcessingState::Running {
            return;
        }
        let reset_pending = std::mem::take(&mut inner.reset_pending);
        inner.finished_at = Some(Utc::now());

        match outcome {
            Ok(position) => {
                if let Some(position) = position {
                    if reset_pending {
                        tracing::info!(
                            reported = position,
                            "discarding reported position after reset"
                        );
                    } else {
                        inner.position = position;
                    }
                }
                inner.state = ProcessingState::Completed;
                tracing::info!(position = inner.position, "log processing completed");
            }
            Err(error) => {
                inner.state = ProcessingState::Failed;
                inner.last_error = Some(error);
            }
        }
    }
}

impl std::fmt::Debug for ProcessingJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingJob")
            .field("logs_dir", &self.logs_dir)
            .field("datasource", &self.datasource)
            .field("status", &self.status())
            .finish()
    }
}
