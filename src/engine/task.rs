//! Task and batch records kept by the engine, plus their public snapshots

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content::{ContentWriter, WriteOptions};
use crate::speedometer::estimate_eta;
use crate::task_state::{State, TaskStateMachine};
use crate::types::{AccountId, BatchId, TaskErrors, TaskId};

/// One file to download, as produced by an NZB or RSS collaborator
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    /// Output file name
    pub name: String,
    /// Message ids (or article numbers) of the file's parts
    pub articles: Vec<String>,
    /// Groups the articles were posted to
    #[serde(default)]
    pub groups: Vec<String>,
    /// Expected size in bytes
    #[serde(default)]
    pub size: u64,
    /// Put the task in front of everything already queued
    #[serde(default)]
    pub priority: bool,
}

impl FileSpec {
    /// File with the given name and articles
    pub fn new(name: impl Into<String>, articles: Vec<String>) -> Self {
        Self {
            name: name.into(),
            articles,
            ..Default::default()
        }
    }

    /// Set the candidate groups
    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = groups;
        self
    }

    /// Set the expected size
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Mark the file as priority
    pub fn with_priority(mut self) -> Self {
        self.priority = true;
        self
    }
}

/// Snapshot of a task for the host
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Task id
    pub id: TaskId,
    /// Batch the task belongs to
    pub batch: BatchId,
    /// Account used for downloading
    pub account: AccountId,
    /// Description (output file name)
    pub name: String,
    /// Output directory
    pub path: PathBuf,
    /// Expected size in bytes
    pub size: u64,
    /// Current state
    pub state: State,
    /// Accumulated error flags
    pub errors: TaskErrors,
    /// Seconds spent running
    pub runtime: u64,
    /// Estimated seconds remaining
    pub eta: Option<u64>,
    /// Percent of articles processed
    pub completion: f64,
    /// Bytes received but not yet written
    pub buffered: u64,
}

/// Snapshot of a batch for the host
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchInfo {
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
    /// Number of tasks in the batch
    pub num_tasks: usize,
    /// Tasks that completed
    pub num_complete: usize,
    /// Tasks that were killed
    pub num_killed: usize,
    /// Union of the tasks' error flags
    pub errors: TaskErrors,
    /// When the batch was created
    pub created: DateTime<Utc>,
}

#[derive(Debug)]
pub(crate) struct Task {
    pub id: TaskId,
    pub batch: BatchId,
    pub account: AccountId,
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub groups: Vec<String>,
    pub created: DateTime<Utc>,
    pub stm: TaskStateMachine,
    /// Articles not yet handed to a connection
    pub pending: VecDeque<String>,
    /// Articles waiting for a retry on the fill account
    pub fill_pending: VecDeque<String>,
    /// Articles in the whole file, including earlier sessions
    pub total_articles: usize,
    /// Articles processed in earlier sessions
    pub done_before: usize,
    pub errors: TaskErrors,
    pub received_content: bool,
    /// Connections may take command lists
    pub run_cmds: bool,
    /// Resume once the account's active task is done
    pub resume_pending: bool,
    pub outstanding_jobs: usize,
    pub runtime: u64,
    pub eta: Option<u64>,
    pub paths: Vec<PathBuf>,
    pub bytes_written: u64,
    pub writer: Arc<Mutex<ContentWriter>>,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        batch: BatchId,
        account: AccountId,
        path: PathBuf,
        file: FileSpec,
        options: WriteOptions,
    ) -> Self {
        let writer = ContentWriter::new(&path, &file.name, options);
        Self {
            id,
            batch,
            account,
            total_articles: file.articles.len(),
            done_before: 0,
            name: file.name,
            path,
            size: file.size,
            groups: file.groups,
            created: Utc::now(),
            stm: TaskStateMachine::new(),
            pending: file.articles.into(),
            fill_pending: VecDeque::new(),
            errors: TaskErrors::empty(),
            received_content: false,
            run_cmds: false,
            resume_pending: false,
            outstanding_jobs: 0,
            runtime: 0,
            eta: None,
            paths: Vec::new(),
            bytes_written: 0,
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    pub(crate) fn writer(&self) -> MutexGuard<'_, ContentWriter> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All error flags, including those recorded by a fault
    pub(crate) fn all_errors(&self) -> TaskErrors {
        self.errors | self.stm.errors()
    }

    pub(crate) fn completion(&self) -> f64 {
        if self.total_articles == 0 {
            return 0.0;
        }
        let done = self.done_before + self.stm.processed_buffers();
        (done as f64 / self.total_articles as f64 * 100.0).min(100.0)
    }

    /// Finished or killed
    pub(crate) fn is_done(&self) -> bool {
        matches!(self.stm.state(), State::Complete | State::Killed)
    }

    /// Active, or debuffering and about to become active again
    pub(crate) fn owns_account(&self) -> bool {
        self.stm.is_active() || self.stm.state() == State::Debuffering
    }

    pub(crate) fn tick(&mut self) {
        if !self.stm.is_active() {
            return;
        }
        self.runtime += 1;
        self.eta = estimate_eta(self.runtime, self.completion());
    }

    pub(crate) fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            batch: self.batch,
            account: self.account,
            name: self.name.clone(),
            path: self.path.clone(),
            size: self.size,
            state: self.stm.state(),
            errors: self.all_errors(),
            runtime: self.runtime,
            eta: self.eta,
            completion: self.completion(),
            buffered: self.stm.buffered_bytes(),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Batch {
    pub id: BatchId,
    pub account: AccountId,
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub num_tasks: usize,
    pub num_complete: usize,
    pub num_killed: usize,
    pub errors: TaskErrors,
    pub created: DateTime<Utc>,
    pub reported: bool,
}

impl Batch {
    pub(crate) fn is_complete(&self) -> bool {
        self.num_complete + self.num_killed >= self.num_tasks
    }

    pub(crate) fn info(&self) -> BatchInfo {
        BatchInfo {
            id: self.id,
            account: self.account,
            name: self.name.clone(),
            path: self.path.clone(),
            size: self.size,
            num_tasks: self.num_tasks,
            num_complete: self.num_complete,
            num_killed: self.num_killed,
            errors: self.errors,
            created: self.created,
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn task(articles: usize) -> Task {
        let file = FileSpec::new(
            "file.bin",
            (0..articles).map(|i| format!("part{i}@test")).collect(),
        );
        Task::new(
            TaskId(1),
            BatchId(1),
            AccountId(1),
            PathBuf::from("/tmp/unused"),
            file,
            WriteOptions::default(),
        )
    }

    #[test]
    fn test_completion_counts_earlier_sessions() {
        let mut t = task(4);
        t.pending.pop_front();
        t.done_before = 1;
        assert!((t.completion() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_tick_only_counts_active_tasks() {
        let mut t = task(2);
        t.tick();
        assert_eq!(t.runtime, 0);

        let mut actions = Vec::new();
        t.stm.start(&mut actions);
        t.tick();
        assert_eq!(t.runtime, 1);
        assert_eq!(t.eta, None);
    }

    #[test]
    fn test_batch_completion() {
        let mut batch = Batch {
            id: BatchId(1),
            account: AccountId(1),
            name: "batch".to_string(),
            path: PathBuf::new(),
            size: 0,
            num_tasks: 2,
            num_complete: 1,
            num_killed: 0,
            errors: TaskErrors::empty(),
            created: Utc::now(),
            reported: false,
        };
        assert!(!batch.is_complete());
        batch.num_killed = 1;
        assert!(batch.is_complete());
    }
}
