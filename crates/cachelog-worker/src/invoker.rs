use futures::FutureExt;
use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use cachelog_types::WorkerProgress;

use crate::error::WorkerError;
use crate::output::{WorkerOutput, parse_document, parse_progress};
use crate::request::WorkerRequest;

/// Channel the invoker pushes progress snapshots into while a worker runs
pub type ProgressSink = mpsc::UnboundedSender<WorkerProgress>;

/// Default interval between progress file polls
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Maximum number of bytes of worker output kept in error diagnostics
const MAX_DIAGNOSTIC_BYTES: usize = 4096;

/// Something that can run a worker request to completion
pub trait Worker: Send + Sync + 'static {
    fn invoke(
        &self,
        request: WorkerRequest,
        progress: Option<ProgressSink>,
    ) -> BoxFuture<'static, Result<WorkerOutput, WorkerError>>;
}

/// Launches the external log worker executable
#[derive(Clone, Debug)]
pub struct WorkerInvoker {
    program: PathBuf,
    progress_dir: PathBuf,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl WorkerInvoker {
    /// Create an invoker for `program`, writing progress files into `progress_dir`
    pub fn new(program: impl Into<PathBuf>, progress_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            progress_dir: progress_dir.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        // A zero period would make tokio's interval panic
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Kill the worker and fail once `timeout` has elapsed
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Run the worker and wait for it to exit
    pub async fn run(
        &self,
        request: WorkerRequest,
        progress: Option<ProgressSink>,
    ) -> Result<WorkerOutput, WorkerError> {
        tokio::fs::create_dir_all(&self.progress_dir).await?;
        let progress_file = self.progress_file(&request);

        let result = self.run_with_progress_file(&request, &progress_file, progress).await;

        if request.subcommand.reuses_progress_file() {
            return result;
        }
        if let Err(e) = tokio::fs::remove_file(&progress_file).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(path = %progress_file.display(), error = %e, "failed to remove progress file");
            }
        }

        result
    }

    /// Progress file for `request`: a fixed name for subcommands that reuse
    /// it between runs, a fresh one otherwise
    pub fn progress_file(&self, request: &WorkerRequest) -> PathBuf {
        let subcommand = request.subcommand.as_str();
        let name = if request.subcommand.reuses_progress_file() {
            match &request.datasource {
                Some(datasource) => {
                    let datasource: String = datasource
                        .chars()
                        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
                        .collect();
                    format!("{subcommand}-{datasource}.json")
                }
                None => format!("{subcommand}.json"),
            }
        } else {
            format!("{subcommand}-{}.json", Uuid::new_v4())
        };
        self.progress_dir.join(name)
    }

    async fn run_with_progress_file(
        &self,
        request: &WorkerRequest,
        progress_file: &Path,
        progress: Option<ProgressSink>,
    ) -> Result<WorkerOutput, WorkerError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(request.command_args(progress_file))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the wait future (timeout) must not leave an orphan behind
            .kill_on_drop(true);

        tracing::debug!(
            program = %self.program.display(),
            subcommand = request.subcommand.as_str(),
            logs_path = %request.logs_path.display(),
            "launching worker"
        );

        let child = cmd.spawn().map_err(|source| WorkerError::Launch {
            program: self.program.display().to_string(),
            source,
        })?;

        let wait = child.wait_with_output();
        tokio::pin!(wait);

        let deadline = async {
            match self.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let output = loop {
            tokio::select! {
                result = &mut wait => break result?,

                _ = &mut deadline => {
                    let after = self.timeout.unwrap_or_default();
                    tracing::warn!(
                        subcommand = request.subcommand.as_str(),
                        timeout_secs = after.as_secs(),
                        "worker timed out, killing it"
                    );
                    return Err(WorkerError::TimedOut { after });
                }

                _ = ticker.tick(), if progress.is_some() => {
                    if let (Some(sink), Some(snapshot)) = (&progress, read_progress(progress_file).await) {
                        // Receiver gone means nobody is polling; keep running anyway
                        let _ = sink.send(snapshot);
                    }
                }
            }
        };

        // The file's final state doubles as the result for workers that only
        // report through it
        let final_contents = tokio::fs::read_to_string(progress_file).await.ok();
        if let (Some(sink), Some(contents)) = (&progress, &final_contents) {
            if let Some(snapshot) = parse_progress(contents) {
                let _ = sink.send(snapshot);
            }
        }

        interpret(output, final_contents.as_deref())
    }
}

impl Worker for WorkerInvoker {
    fn invoke(
        &self,
        request: WorkerRequest,
        progress: Option<ProgressSink>,
    ) -> BoxFuture<'static, Result<WorkerOutput, WorkerError>> {
        let invoker = self.clone();
        async move { invoker.run(request, progress).await }.boxed()
    }
}

/// Run `request` on `worker`, calling `on_progress` for every snapshot it
/// reports until it finishes.
pub async fn invoke_with_progress<F>(
    worker: &dyn Worker,
    request: WorkerRequest,
    mut on_progress: F,
) -> Result<WorkerOutput, WorkerError>
where
    F: FnMut(WorkerProgress),
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let invocation = worker.invoke(request, Some(tx));
    tokio::pin!(invocation);

    let result = loop {
        tokio::select! {
            biased;
            Some(snapshot) = rx.recv() => on_progress(snapshot),
            result = &mut invocation => break result,
        }
    };

    // Anything sent right before exit
    while let Ok(snapshot) = rx.try_recv() {
        on_progress(snapshot);
    }

    result
}

async fn read_progress(path: &Path) -> Option<WorkerProgress> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => parse_progress(&contents),
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(path = %path.display(), error = %e, "could not read progress file");
            }
            None
        }
    }
}

/// Map a finished process onto the invocation result
fn interpret(output: Output, progress_contents: Option<&str>) -> Result<WorkerOutput, WorkerError> {
    let stdout = String::from_utf8_lossy(&output.stdout);

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let text = if stderr.trim().is_empty() { &stdout } else { &stderr };
        return Err(WorkerError::Exit {
            code: output.status.code(),
            diagnostic: tail(text.trim()).to_string(),
        });
    }

    if let Some(document) = parse_document(&stdout) {
        return Ok(WorkerOutput::new(document));
    }

    if let Some(document) = progress_contents.and_then(parse_document) {
        tracing::debug!("worker stdout had no JSON object, using progress file");
        return Ok(WorkerOutput::new(document));
    }

    Err(WorkerError::MalformedOutput {
        raw: tail(stdout.trim()).to_string(),
    })
}

/// Keep the last `MAX_DIAGNOSTIC_BYTES` of `text`, respecting char boundaries
fn tail(text: &str) -> &str {
    if text.len() <= MAX_DIAGNOSTIC_BYTES {
        return text;
    }
    let mut start = text.len() - MAX_DIAGNOSTIC_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
