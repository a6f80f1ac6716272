use serde_json::{Map, Value};

use cachelog_types::{ServiceCounts, WorkerProgress};

/// Structured output of a finished worker.
///
/// The document is kept untyped; accessors check each field explicitly so a
/// worker that changes shape degrades to `None` instead of failing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkerOutput {
    document: Map<String, Value>,
}

impl WorkerOutput {
    pub fn new(document: Map<String, Value>) -> Self {
        Self { document }
    }

    /// The raw JSON object
    pub fn document(&self) -> &Map<String, Value> {
        &self.document
    }

    /// Per-service counts, if the worker reported a `service_counts` object.
    ///
    /// Entries whose value is not an unsigned integer are skipped.
    pub fn service_counts(&self) -> Option<ServiceCounts> {
        let counts = self.document.get("service_counts")?.as_object()?;
        let mut result = ServiceCounts::new();
        for (service, count) in counts {
            match count.as_u64() {
                Some(count) => {
                    result.insert(service.clone(), count);
                }
                None => {
                    tracing::debug!(service = %service, value = %count, "skipping non-integer service count");
                }
            }
        }
        Some(result)
    }

    /// New log offset reported by a processing run
    pub fn position(&self) -> Option<u64> {
        self.u64_field("position")
    }

    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.document.get(key).and_then(Value::as_u64)
    }

    /// Progress fields carried in the final document, if any
    pub fn progress(&self) -> Option<WorkerProgress> {
        progress_from_object(&self.document)
    }
}

/// Find the JSON object in worker output.
///
/// The whole text is tried first; failing that, the last line holding a JSON
/// object wins, which covers workers that print log lines or JSON events
/// before the final result.
pub fn parse_document(text: &str) -> Option<Map<String, Value>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(Value::Object(map)) = serde_json::from_str(trimmed) {
        return Some(map);
    }

    trimmed.lines().rev().find_map(|line| {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        match serde_json::from_str(line) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        }
    })
}

/// Parse a progress snapshot written by the worker.
///
/// Returns `None` for partial writes, non-objects, or documents without any
/// recognised progress field.
pub fn parse_progress(text: &str) -> Option<WorkerProgress> {
    let value: Value = serde_json::from_str(text.trim()).ok()?;
    progress_from_object(value.as_object()?)
}

fn progress_from_object(obj: &Map<String, Value>) -> Option<WorkerProgress> {
    // The worker has used both snake_case and camelCase keys over time
    let field = |snake: &str, camel: &str| obj.get(snake).or_else(|| obj.get(camel));

    let progress = WorkerProgress {
        percent_complete: field("percent_complete", "percentComplete")
            .and_then(Value::as_f64)
            .map(|p| p.clamp(0.0, 100.0)),
        status: obj.get("status").and_then(Value::as_str).map(str::to_string),
        message: obj.get("message").and_then(Value::as_str).map(str::to_string),
        lines_processed: field("lines_processed", "linesProcessed").and_then(Value::as_u64),
        lines_removed: field("lines_removed", "linesRemoved").and_then(Value::as_u64),
        files_processed: field("files_processed", "filesProcessed").and_then(Value::as_u64),
        total_lines: field("total_lines", "totalLines").and_then(Value::as_u64),
        lines_parsed: field("lines_parsed", "linesParsed").and_then(Value::as_u64),
        entries_saved: field("entries_saved", "entriesSaved").and_then(Value::as_u64),
    };

    if progress.is_empty() { None } else { Some(progress) }
}
