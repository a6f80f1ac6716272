use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Verb passed as the worker's first argument
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Subcommand {
    /// Count log lines per service
    Count,
    /// Strip one service's lines from the logs
    Remove,
    /// Scan the logs from a start position into the database
    Process,
}

impl Subcommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Remove => "remove",
            Self::Process => "process",
        }
    }

    /// Counting keeps one progress file across runs; the worker compares
    /// its age with the logs and answers from it while it is still current
    pub fn reuses_progress_file(&self) -> bool {
        matches!(self, Self::Count)
    }
}

/// A single worker invocation.
///
/// Rendered as
/// `<program> <subcommand> <logs_path> [args...] <progress_file> [datasource]`;
/// the progress file is appended by the invoker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerRequest {
    pub subcommand: Subcommand,
    pub logs_path: PathBuf,
    pub args: Vec<OsString>,
    /// Datasource the worker attributes its results to
    pub datasource: Option<String>,
}

impl WorkerRequest {
    pub fn new(subcommand: Subcommand, logs_path: impl Into<PathBuf>) -> Self {
        Self {
            subcommand,
            logs_path: logs_path.into(),
            args: Vec::new(),
            datasource: None,
        }
    }

    /// Append an extra positional argument after the logs path
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_datasource(mut self, datasource: Option<&str>) -> Self {
        self.datasource = datasource.map(str::to_string);
        self
    }

    pub fn count(logs_path: &Path) -> Self {
        Self::new(Subcommand::Count, logs_path)
    }

    pub fn remove(logs_path: &Path, service: &str) -> Self {
        Self::new(Subcommand::Remove, logs_path).arg(service)
    }

    pub fn process(logs_path: &Path, start_position: u64) -> Self {
        Self::new(Subcommand::Process, logs_path).arg(start_position.to_string())
    }

    /// Full argument vector for the given progress file
    pub fn command_args(&self, progress_file: &Path) -> Vec<OsString> {
        let mut args = Vec::with_capacity(self.args.len() + 4);
        args.push(OsString::from(self.subcommand.as_str()));
        args.push(self.logs_path.clone().into_os_string());
        args.extend(self.args.iter().cloned());
        args.push(progress_file.as_os_str().to_os_string());
        if let Some(datasource) = &self.datasource {
            args.push(OsString::from(datasource));
        }
        args
    }
}
