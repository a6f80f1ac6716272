use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use cachelog_worker::WorkerInvoker;

/// Runtime settings for the log manager.
///
/// Every field has a default so a partial config file is enough.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerConfig {
    /// Directory holding the cache access logs
    pub logs_dir: PathBuf,

    /// Path to the external log worker executable
    pub worker_program: PathBuf,

    /// Where per-invocation progress files are written
    pub progress_dir: PathBuf,

    /// File the processing position is persisted to
    pub state_file: PathBuf,

    /// Kill workers running longer than this (unset = no limit)
    pub worker_timeout_secs: Option<u64>,

    /// How often progress files are polled while a worker runs
    pub progress_poll_interval_ms: u64,

    /// How long observed, finished removals are kept around
    pub removal_retention_secs: u64,

    /// How long finished removals nobody polled are kept around
    pub removal_unobserved_retention_secs: u64,

    /// Datasource name passed to the worker (unset = the worker's default)
    pub datasource: Option<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            logs_dir: PathBuf::from("/logs"),
            worker_program: PathBuf::from("log_manager"),
            progress_dir: PathBuf::from("data/progress"),
            state_file: PathBuf::from("data/position.json"),
            worker_timeout_secs: None,
            progress_poll_interval_ms: 500,
            removal_retention_secs: 60 * 60,
            removal_unobserved_retention_secs: 24 * 60 * 60,
            datasource: None,
        }
    }
}

impl ManagerConfig {
    pub fn worker_timeout(&self) -> Option<Duration> {
        self.worker_timeout_secs.map(Duration::from_secs)
    }

    pub fn progress_poll_interval(&self) -> Duration {
        Duration::from_millis(self.progress_poll_interval_ms)
    }

    pub fn removal_retention(&self) -> Duration {
        Duration::from_secs(self.removal_retention_secs)
    }

    pub fn removal_unobserved_retention(&self) -> Duration {
        Duration::from_secs(self.removal_unobserved_retention_secs)
    }

    /// Build the worker invoker these settings describe
    pub fn invoker(&self) -> WorkerInvoker {
        WorkerInvoker::new(&self.worker_program, &self.progress_dir)
            .with_poll_interval(self.progress_poll_interval())
            .with_timeout(self.worker_timeout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durations() {
        let config = ManagerConfig {
            worker_timeout_secs: Some(30),
            progress_poll_interval_ms: 250,
            removal_retention_secs: 10,
            removal_unobserved_retention_secs: 600,
            ..Default::default()
        };
        assert_eq!(config.worker_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.progress_poll_interval(), Duration::from_millis(250));
        assert_eq!(config.removal_retention(), Duration::from_secs(10));
        assert_eq!(config.removal_unobserved_retention(), Duration::from_secs(600));
        assert_eq!(
            ManagerConfig::default().removal_unobserved_retention(),
            Duration::from_secs(86_400)
        );
        assert_eq!(ManagerConfig::default().worker_timeout(), None);
    }

    #[test]
    fn test_invoker_uses_worker_program() {
        let config = ManagerConfig {
            worker_program: PathBuf::from("/opt/cachelog/log_manager"),
            ..Default::default()
        };
        assert_eq!(config.invoker().program(), std::path::Path::new("/opt/cachelog/log_manager"));
    }
}
