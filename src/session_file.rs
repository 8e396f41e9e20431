//! Persisted download session
//!
//! The engine writes unfinished batches and tasks to a versioned JSON
//! document so a later run can pick them up again. Files are written to a
//! temporary sibling first and then renamed over the target.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::task_state::State;
use crate::types::{AccountId, BatchId, TaskErrors, TaskId};

/// Current document version
pub const SESSION_VERSION: u32 = 1;

/// Saved batch
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedBatch {
    /// Batch id
    pub id: BatchId,
    /// Account used for downloading
    pub account: AccountId,
    /// Description
    pub name: String,
    /// Output directory
    pub path: PathBuf,
    /// Sum of the expected file sizes
    pub size: u64,
    /// Tasks in the batch when it was created
    pub num_tasks: usize,
    /// Tasks that completed
    pub num_complete: usize,
    /// Tasks that were killed
    pub num_killed: usize,
    /// Union of the finished tasks' error flags
    pub errors: TaskErrors,
    /// When the batch was created
    pub created: DateTime<Utc>,
}

/// Saved task
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedTask {
    /// Task id
    pub id: TaskId,
    /// Owning batch
    pub batch: BatchId,
    /// Account used for downloading
    pub account: AccountId,
    /// Output file name
    pub name: String,
    /// Output directory
    pub path: PathBuf,
    /// Expected size in bytes
    pub size: u64,
    /// Error flags accumulated so far
    pub errors: TaskErrors,
    /// State at save time
    pub state: State,
    /// Seconds spent running
    pub runtime: u64,
    /// Candidate groups
    #[serde(default)]
    pub groups: Vec<String>,
    /// Articles still to fetch
    pub pending: Vec<String>,
    /// Articles in the whole file
    pub total_articles: usize,
    /// Some content had already been written
    #[serde(default)]
    pub received_content: bool,
    /// When the task was created
    pub created: DateTime<Utc>,
}

/// Saved engine session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFile {
    /// Document version
    pub version: u32,
    /// Batches with at least one unfinished task
    pub batches: Vec<SavedBatch>,
    /// Unfinished tasks in scheduling order
    pub tasks: Vec<SavedTask>,
}

impl Default for SessionFile {
    fn default() -> Self {
        Self {
            version: SESSION_VERSION,
            batches: Vec::new(),
            tasks: Vec::new(),
        }
    }
}

impl SessionFile {
    /// Read and validate a session file
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionFile`] when the file cannot be read, is not a
    /// session document, has another version, or names an unknown batch.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| Error::SessionFile {
            path: path.to_path_buf(),
            message: format!("read failed: {e}"),
        })?;
        let session: SessionFile =
            serde_json::from_slice(&data).map_err(|e| Error::SessionFile {
                path: path.to_path_buf(),
                message: format!("invalid document: {e}"),
            })?;
        if session.version != SESSION_VERSION {
            return Err(Error::SessionFile {
                path: path.to_path_buf(),
                message: format!("unsupported version {}", session.version),
            });
        }
        for task in &session.tasks {
            if !session.batches.iter().any(|b| b.id == task.batch) {
                return Err(Error::SessionFile {
                    path: path.to_path_buf(),
                    message: format!("task {} refers to unknown batch {}", task.id, task.batch),
                });
            }
        }
        tracing::debug!(path = %path.display(), tasks = session.tasks.len(), batches = session.batches.len(), "session file loaded");
        Ok(session)
    }

    /// Write the session atomically
    ///
    /// # Errors
    ///
    /// Returns an error when serialization or any step of the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        let tmp = temp_path(path);
        let write = || -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
            std::fs::rename(&tmp, path)
        };
        if let Err(e) = write() {
            let _ = std::fs::remove_file(&tmp);
            return Err(Error::SessionFile {
                path: path.to_path_buf(),
                message: format!("write failed: {e}"),
            });
        }
        tracing::debug!(path = %path.display(), tasks = self.tasks.len(), "session file saved");
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "session".into());
    name.push(".tmp");
    path.with_file_name(name)
}
