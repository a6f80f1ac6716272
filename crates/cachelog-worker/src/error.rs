use std::time::Duration;

/// Failure of a single worker invocation
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to launch worker '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker exited with {}: {diagnostic}", exit_code_label(.code))]
    Exit {
        code: Option<i32>,
        diagnostic: String,
    },

    #[error("worker produced no JSON object: {raw}")]
    MalformedOutput { raw: String },

    #[error("worker timed out after {}s", .after.as_secs())]
    TimedOut { after: Duration },

    #[error("worker i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    /// Whether the worker ran to completion but printed something unusable
    pub fn is_malformed_output(&self) -> bool {
        matches!(self, Self::MalformedOutput { .. })
    }
}

fn exit_code_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "no status (killed by signal)".to_string(),
    }
}
