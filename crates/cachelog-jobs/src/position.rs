use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::NamedTempFile;

use crate::error::StoreError;

/// Durable home of the processing position
pub trait PositionStore: Send + Sync + 'static {
    /// Last saved position, `0` if none was ever saved
    fn load(&self) -> Result<u64, StoreError>;

    fn save(&self, position: u64) -> Result<(), StoreError>;
}

/// On-disk format of the position file
#[derive(Debug, Serialize, Deserialize)]
struct PositionRecord {
    position: u64,
    updated_at: DateTime<Utc>,
}

/// Stores the position as a small JSON document, replaced atomically
#[derive(Clone, Debug)]
pub struct FilePositionStore {
    path: PathBuf,
}

impl FilePositionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Write {
            path: self.path.clone(),
            source,
        }
    }
}

impl PositionStore for FilePositionStore {
    fn load(&self) -> Result<u64, StoreError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let record: PositionRecord =
            serde_json::from_str(&content).map_err(|source| StoreError::Decode {
                path: self.path.clone(),
                source,
            })?;
        Ok(record.position)
    }

    fn save(&self, position: u64) -> Result<(), StoreError> {
        let record = PositionRecord {
            position,
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&record)?;

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent).map_err(|e| self.write_err(e))?;

        // Write next to the target and rename over it so readers never see a
        // half-written file
        let mut temp = NamedTempFile::new_in(parent).map_err(|e| self.write_err(e))?;
        temp.write_all(json.as_bytes())
            .and_then(|_| temp.flush())
            .map_err(|e| self.write_err(e))?;
        temp.into_temp_path()
            .persist(&self.path)
            .map_err(|e| self.write_err(e.error))?;

        Ok(())
    }
}

/// Keeps the position in memory only
#[derive(Debug, Default)]
pub struct MemoryPositionStore {
    position: AtomicU64,
}

impl MemoryPositionStore {
    pub fn new(position: u64) -> Self {
        Self {
            position: AtomicU64::new(position),
        }
    }
}

impl PositionStore for MemoryPositionStore {
    fn load(&self) -> Result<u64, StoreError> {
        Ok(self.position.load(Ordering::SeqCst))
    }

    fn save(&self, position: u64) -> Result<(), StoreError> {
        self.position.store(position, Ordering::SeqCst);
        Ok(())
    }
}
