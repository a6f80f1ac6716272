use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cachelog_types::{OperationId, RemovalState, RemovalStatus, WorkerProgress};
use cachelog_worker::{Worker, WorkerOutput, WorkerRequest, invoke_with_progress};

use crate::error::JobError;

/// One service removal, owned by the registry
#[derive(Debug)]
struct RemovalJob {
    operation_id: OperationId,
    service: String,
    state: RemovalState,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    progress: Option<WorkerProgress>,
    lines_removed: Option<u64>,
    error: Option<String>,

    /// Set once a status read has seen the terminal state
    observed: AtomicBool,
}

impl RemovalJob {
    fn new(operation_id: OperationId, service: String) -> Self {
        Self {
            operation_id,
            service,
            state: RemovalState::Started,
            created_at: Utc::now(),
            finished_at: None,
            progress: None,
            lines_removed: None,
            error: None,
            observed: AtomicBool::new(false),
        }
    }

    fn snapshot(&self) -> RemovalStatus {
        RemovalStatus {
            operation_id: self.operation_id.clone(),
            service: self.service.clone(),
            state: self.state,
            created_at: self.created_at,
            finished_at: self.finished_at,
            progress: self.progress.clone(),
            lines_removed: self.lines_removed,
            error: self.error.clone(),
        }
    }

    /// Terminal and older than the retention period that applies to it:
    /// `observed` once a poller has seen the outcome, `unobserved` otherwise
    fn is_expired(&self, retention: &Retention, now: DateTime<Utc>) -> bool {
        if !self.state.is_terminal() {
            return false;
        }
        let Some(finished_at) = self.finished_at else {
            return false;
        };
        let keep = if self.observed.load(Ordering::SeqCst) {
            retention.observed
        } else {
            retention.unobserved
        };
        let keep = chrono::Duration::from_std(keep).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(finished_at) >= keep
    }
}

/// How long finished removals are kept
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Retention {
    observed: Duration,
    unobserved: Duration,
}

/// Upper bound for finished removals nobody has asked about
const DEFAULT_UNOBSERVED_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Default)]
struct RegistryInner {
    jobs: HashMap<OperationId, RemovalJob>,

    /// Normalised service name -> its non-terminal operation
    active: HashMap<String, OperationId>,

    latest: Option<OperationId>,
}

impl RegistryInner {
    fn evict_expired(&mut self, retention: &Retention) -> usize {
        let now = Utc::now();
        let before = self.jobs.len();
        self.jobs.retain(|_, job| !job.is_expired(retention, now));
        before - self.jobs.len()
    }
}

/// Tracks service removals by operation id.
///
/// Removals of different services run side by side; a second removal of a
/// service whose previous removal has not finished is rejected.
#[derive(Clone)]
pub struct RemovalJobRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    worker: Arc<dyn Worker>,
    logs_dir: PathBuf,
    datasource: Option<String>,
    retention: Retention,
}

impl RemovalJobRegistry {
    /// `retention` applies to finished removals a poller has seen; unseen
    /// ones are kept for [`DEFAULT_UNOBSERVED_RETENTION`] unless changed with
    /// [`RemovalJobRegistry::with_unobserved_retention`]
    pub fn new(worker: Arc<dyn Worker>, logs_dir: impl Into<PathBuf>, retention: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner::default())),
            worker,
            logs_dir: logs_dir.into(),
            datasource: None,
            retention: Retention {
                observed: retention,
                unobserved: DEFAULT_UNOBSERVED_RETENTION,
            },
        }
    }

    pub fn with_unobserved_retention(mut self, retention: Duration) -> Self {
        self.retention.unobserved = retention;
        self
    }

    /// Datasource name handed to the worker on every removal
    pub fn with_datasource(mut self, datasource: Option<String>) -> Self {
        self.datasource = datasource;
        self
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    /// Register a removal for `service` and launch the worker in the
    /// background. Must be called from within a tokio runtime.
    pub fn start(&self, service: &str) -> Result<OperationId, JobError> {
        let service = service.trim();
        if service.is_empty() {
            return Err(JobError::Validation(
                "service name must not be empty".to_string(),
            ));
        }
        let key = service_key(service);

        let operation_id = {
            let mut inner = self.inner.write();
            let evicted = inner.evict_expired(&self.retention);
            if evicted > 0 {
                tracing::debug!(evicted, "evicted finished removal jobs");
            }

            if let Some(existing) = inner.active.get(&key) {
                return Err(JobError::Conflict(format!(
                    "removal of service '{service}' is already in progress (operation {existing})"
                )));
            }

            let operation_id = OperationId::generate();
            inner.jobs.insert(
                operation_id.clone(),
                RemovalJob::new(operation_id.clone(), service.to_string()),
            );
            inner.active.insert(key, operation_id.clone());
            inner.latest = Some(operation_id.clone());
            operation_id
        };

        tracing::info!(operation_id = %operation_id, service, "starting service removal");

        let registry = self.clone();
        let id = operation_id.clone();
        let request = WorkerRequest::remove(&self.logs_dir, service)
            .with_datasource(self.datasource.as_deref());
        let run = tokio::spawn(async move {
            registry.mark_running(&id);
            let result = invoke_with_progress(registry.worker.as_ref(), request, |p| {
                registry.record_progress(&id, p)
            })
            .await;
            registry.finish(&id, result.map_err(|e| e.to_string()));
        });

        // A panicking worker must not keep the service locked
        let registry = self.clone();
        let id = operation_id.clone();
        tokio::spawn(async move {
            if let Err(e) = run.await {
                if e.is_panic() {
                    tracing::error!(operation_id = %id, error = %e, "service removal task panicked");
                    registry.finish(&id, Err(format!("service removal task failed: {e}")));
                }
            }
        });

        Ok(operation_id)
    }

    /// Snapshot of one removal.
    ///
    /// Reading a finished job marks it observed, which switches it to the
    /// observed retention period.
    pub fn get(&self, operation_id: &OperationId) -> Result<RemovalStatus, JobError> {
        let inner = self.inner.read();
        let job = inner
            .jobs
            .get(operation_id)
            .ok_or_else(|| JobError::NotFound(operation_id.clone()))?;

        if job.state.is_terminal() {
            job.observed.store(true, Ordering::SeqCst);
        }
        Ok(job.snapshot())
    }

    /// Id of the most recently started removal, if still retained
    pub fn latest_id(&self) -> Option<OperationId> {
        let inner = self.inner.read();
        inner
            .latest
            .as_ref()
            .filter(|id| inner.jobs.contains_key(*id))
            .cloned()
    }

    /// Snapshots of every retained removal, oldest first
    pub fn list(&self) -> Vec<RemovalStatus> {
        let inner = self.inner.read();
        let mut jobs: Vec<_> = inner.jobs.values().map(RemovalJob::snapshot).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    /// Operation currently removing `service`, if any
    pub fn active_for(&self, service: &str) -> Option<OperationId> {
        self.inner.read().active.get(&service_key(service)).cloned()
    }

    /// Drop finished jobs past their retention; returns how many went
    pub fn reap(&self) -> usize {
        self.inner.write().evict_expired(&self.retention)
    }

    pub fn len(&self) -> usize {
        self.inner.read().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().jobs.is_empty()
    }

    fn mark_running(&self, operation_id: &OperationId) {
        let mut inner = self.inner.write();
        if let Some(job) = inner.jobs.get_mut(operation_id) {
            if job.state == RemovalState::Started {
                job.state = RemovalState::Running;
            }
        }
    }

    fn record_progress(&self, operation_id: &OperationId, progress: WorkerProgress) {
        let mut inner = self.inner.write();
        if let Some(job) = inner.jobs.get_mut(operation_id) {
            if !job.state.is_terminal() {
                job.progress = Some(progress);
            }
        }
    }

    /// Record the outcome; a job that already finished is left alone
    fn finish(&self, operation_id: &OperationId, result: Result<WorkerOutput, String>) {
        let mut inner = self.inner.write();
        let Some(job) = inner.jobs.get_mut(operation_id) else {
            return;
        };
        if job.state.is_terminal() {
            return;
        }

        job.finished_at = Some(Utc::now());
        match result {
            Ok(output) => {
                if let Some(progress) = output.progress() {
                    job.progress = Some(progress);
                }
                job.lines_removed = output
                    .u64_field("lines_removed")
                    .or_else(|| job.progress.as_ref().and_then(|p| p.lines_removed));
                job.state = RemovalState::Completed;
                tracing::info!(
                    operation_id = %operation_id,
                    service = %job.service,
                    lines_removed = job.lines_removed,
                    "service removal completed"
                );
            }
            Err(e) => {
                job.state = RemovalState::Failed;
                job.error = Some(e.clone());
                tracing::error!(
                    operation_id = %operation_id,
                    service = %job.service,
                    error = %e,
                    "service removal failed"
                );
            }
        }

        let key = service_key(&job.service);
        if inner.active.get(&key) == Some(operation_id) {
            inner.active.remove(&key);
        }
    }
}

impl std::fmt::Debug for RemovalJobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemovalJobRegistry")
            .field("logs_dir", &self.logs_dir)
            .field("retention", &self.retention)
            .field("jobs", &self.len())
            .finish()
    }
}

/// Services are matched case-insensitively ("Steam" and "steam" collide)
fn service_key(service: &str) -> String {
    service.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FnWorker, GatedWorker, Invocation, next_call, wait_until};
    use cachelog_worker::{Subcommand, WorkerError};
    use serde_json::json;
    use std::ffi::OsString;
    use tokio::sync::mpsc::UnboundedReceiver;

    const HOUR: Duration = Duration::from_secs(3600);

    fn new_registry(retention: Duration) -> (RemovalJobRegistry, UnboundedReceiver<Invocation>) {
        let (worker, calls) = GatedWorker::new();
        (RemovalJobRegistry::new(Arc::new(worker), "/logs", retention), calls)
    }

    fn state(registry: &RemovalJobRegistry, id: &OperationId) -> RemovalState {
        registry.get(id).unwrap().state
    }

    #[tokio::test]
    async fn test_rejects_blank_service() {
        let (registry, _calls) = new_registry(HOUR);
        assert!(matches!(registry.start(""), Err(JobError::Validation(_))));
        assert!(matches!(registry.start("  \t"), Err(JobError::Validation(_))));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_removal_lifecycle() {
        let (registry, mut calls) = new_registry(HOUR);

        let id = registry.start("steam").unwrap();
        let status = registry.get(&id).unwrap();
        assert_eq!(status.service, "steam");
        assert!(matches!(status.state, RemovalState::Started | RemovalState::Running));

        let call = next_call(&mut calls).await;
        assert_eq!(call.request.subcommand, Subcommand::Remove);
        assert_eq!(call.request.args, vec![OsString::from("steam")]);

        wait_until(|| state(&registry, &id) == RemovalState::Running).await;
        call.report(WorkerProgress {
            percent_complete: Some(60.0),
            ..Default::default()
        });
        wait_until(|| registry.get(&id).unwrap().progress.is_some()).await;

        call.complete(json!({"lines_removed": 1200}));
        wait_until(|| state(&registry, &id) == RemovalState::Completed).await;

        let status = registry.get(&id).unwrap();
        assert_eq!(status.lines_removed, Some(1200));
        assert!(status.finished_at.is_some());
        assert!(status.error.is_none());
        assert!(registry.active_for("steam").is_none());
    }

    #[tokio::test]
    async fn test_same_service_conflicts_other_service_runs() {
        let (registry, mut calls) = new_registry(HOUR);

        let steam = registry.start("steam").unwrap();
        let err = registry.start("steam").unwrap_err();
        assert!(err.is_conflict());
        assert!(registry.start(" STEAM ").unwrap_err().is_conflict());

        let origin = registry.start("origin").unwrap();
        assert_ne!(steam, origin);
        assert_eq!(registry.active_for("steam"), Some(steam.clone()));
        assert_eq!(registry.active_for("origin"), Some(origin.clone()));

        let first = next_call(&mut calls).await;
        let second = next_call(&mut calls).await;
        first.complete(json!({}));
        second.complete(json!({}));
        wait_until(|| {
            state(&registry, &steam).is_terminal() && state(&registry, &origin).is_terminal()
        })
        .await;

        // Finished removals free the service again
        let again = registry.start("steam").unwrap();
        assert_ne!(again, steam);
    }

    #[tokio::test]
    async fn test_failure_is_reported_and_releases_service() {
        let (registry, mut calls) = new_registry(HOUR);

        let id = registry.start("epicgames").unwrap();
        next_call(&mut calls).await.fail(WorkerError::Exit {
            code: Some(1),
            diagnostic: "permission denied".to_string(),
        });
        wait_until(|| state(&registry, &id) == RemovalState::Failed).await;

        let status = registry.get(&id).unwrap();
        assert!(status.error.unwrap().contains("permission denied"));
        assert!(registry.active_for("epicgames").is_none());
        registry.start("epicgames").unwrap();
    }

    #[tokio::test]
    async fn test_unknown_operation_not_found() {
        let (registry, _calls) = new_registry(HOUR);
        let err = registry.get(&OperationId::from("missing")).unwrap_err();
        assert!(err.is_not_found());
        assert!(registry.latest_id().is_none());
    }

    #[tokio::test]
    async fn test_latest_tracks_most_recent_start() {
        let (registry, _calls) = new_registry(HOUR);
        let _first = registry.start("steam").unwrap();
        let second = registry.start("riot").unwrap();
        assert_eq!(registry.latest_id(), Some(second));
        assert_eq!(registry.list().len(), 2);
    }

    #[tokio::test]
    async fn test_finished_job_survives_until_observed() {
        let (registry, mut calls) = new_registry(Duration::ZERO);

        let id = registry.start("steam").unwrap();
        next_call(&mut calls).await.complete(json!({}));
        wait_until(|| registry.list()[0].state == RemovalState::Completed).await;

        // Unobserved terminal jobs are never reaped
        assert_eq!(registry.reap(), 0);
        assert_eq!(state(&registry, &id), RemovalState::Completed);

        // Observed and past retention: gone on the next pass
        assert_eq!(registry.reap(), 1);
        assert!(registry.get(&id).unwrap_err().is_not_found());
        assert!(registry.latest_id().is_none());
    }

    #[tokio::test]
    async fn test_running_jobs_are_never_reaped() {
        let (registry, _calls) = new_registry(Duration::ZERO);
        let id = registry.start("steam").unwrap();
        let _ = registry.get(&id).unwrap();
        assert_eq!(registry.reap(), 0);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unobserved_jobs_expire_after_their_own_bound() {
        let (worker, mut calls) = GatedWorker::new();
        let registry = RemovalJobRegistry::new(Arc::new(worker), "/logs", HOUR)
            .with_unobserved_retention(Duration::ZERO);

        let id = registry.start("steam").unwrap();
        next_call(&mut calls).await.complete(json!({}));
        wait_until(|| registry.list()[0].state == RemovalState::Completed).await;

        // Nobody asked about it, still evicted
        assert_eq!(registry.reap(), 1);
        assert!(registry.get(&id).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_observed_job_uses_observed_retention() {
        let (worker, mut calls) = GatedWorker::new();
        let registry = RemovalJobRegistry::new(Arc::new(worker), "/logs", HOUR)
            .with_unobserved_retention(Duration::ZERO);

        let id = registry.start("steam").unwrap();
        next_call(&mut calls).await.complete(json!({}));
        wait_until(|| state(&registry, &id) == RemovalState::Completed).await;

        assert_eq!(registry.reap(), 0);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_start_sweeps_unobserved_finished_jobs() {
        let (registry, mut calls) = new_registry(HOUR);
        let registry = registry.with_unobserved_retention(Duration::ZERO);

        for service in ["steam", "origin", "riot"] {
            registry.start(service).unwrap();
            next_call(&mut calls).await.complete(json!({}));
        }
        wait_until(|| registry.list().iter().all(|s| s.state.is_terminal())).await;

        // Each start sweeps what finished before it
        registry.start("blizzard").unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_worker_releases_service() {
        let registry = RemovalJobRegistry::new(
            Arc::new(FnWorker::new(|_| panic!("worker crashed"))),
            "/logs",
            HOUR,
        );

        let id = registry.start("steam").unwrap();
        wait_until(|| state(&registry, &id) == RemovalState::Failed).await;

        let status = registry.get(&id).unwrap();
        assert!(status.error.unwrap().contains("service removal task failed"));
        assert!(registry.active_for("steam").is_none());
        registry.start("steam").unwrap();
    }

    #[tokio::test]
    async fn test_datasource_is_passed_to_worker() {
        let (registry, mut calls) = new_registry(HOUR);
        let registry = registry.with_datasource(Some("lan-a".to_string()));

        registry.start("steam").unwrap();
        let call = next_call(&mut calls).await;
        assert_eq!(call.request.args, vec![OsString::from("steam")]);
        assert_eq!(call.request.datasource.as_deref(), Some("lan-a"));
    }
}
