//! Callbacks from the engine to its host
//!
//! Every method has an empty default so hosts implement only what they use.
//! All callbacks except [`Listener::async_notify`] run inside
//! [`Engine::pump`](crate::Engine::pump) or another engine method, on the
//! host's own context.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ConnectionError, ConnectionErrorKind};
use crate::types::{AccountId, BatchId, ConnectionId, FileStatus, TaskErrors, TaskId};

/// What an error report is about
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum ErrorResource {
    /// A connection failed
    Connection(ConnectionId),
    /// A task could not be processed
    Task(TaskId),
    /// Account level problem (e.g. no usable server)
    Account(AccountId),
}

/// Kind of failure reported through [`Listener::on_error`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network or protocol failure of a connection
    Connection(ConnectionErrorKind),
    /// Decoding or writing content failed
    Processing,
    /// The output file could not be created
    Output,
}

/// An error surfaced to the host
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Source of the error
    pub resource: ErrorResource,
    /// Human readable description
    pub what: String,
    /// Classification
    pub kind: ErrorKind,
}

/// A task reached a terminal state with its output finalized
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileResult {
    /// Task id
    pub task: TaskId,
    /// Batch the task belongs to
    pub batch: BatchId,
    /// Account it was downloaded with
    pub account: AccountId,
    /// Task description
    pub name: String,
    /// Files written; empty when nothing could be fetched
    pub paths: Vec<PathBuf>,
    /// Bytes written to disk
    pub size: u64,
    /// Overall outcome
    pub status: FileStatus,
    /// Accumulated error flags
    pub errors: TaskErrors,
}

/// Every task of a batch is complete or killed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    /// Batch id
    pub batch: BatchId,
    /// Account the batch was downloaded with
    pub account: AccountId,
    /// Batch description
    pub name: String,
    /// Output directory
    pub path: PathBuf,
    /// Tasks that completed
    pub num_complete: usize,
    /// Tasks that were killed
    pub num_killed: usize,
    /// Union of the error flags of all tasks
    pub errors: TaskErrors,
}

/// Host callbacks
pub trait Listener: Send + Sync {
    /// Something went wrong
    fn on_error(&self, _report: ErrorReport) {}

    /// A task finished
    fn on_file_complete(&self, _result: FileResult) {}

    /// A batch finished
    fn on_batch_complete(&self, _result: BatchResult) {}

    /// No pending tasks remain
    fn on_all_complete(&self) {}

    /// After [`Engine::stop`](crate::Engine::stop), every connection has closed
    fn on_shutdown_complete(&self) {}

    /// Article data counting against the account's quota arrived
    ///
    /// `bytes` is the size of one article body as received, so hosts can
    /// track provider block accounts.
    fn on_quota(&self, _account: AccountId, _bytes: u64) {}

    /// Outcome of [`Engine::try_account`](crate::Engine::try_account)
    fn on_account_test(&self, _account: AccountId, _result: Result<(), ConnectionError>) {}

    /// Messages are waiting; the host should call
    /// [`Engine::pump`](crate::Engine::pump) soon
    ///
    /// Called from connection tasks and pool worker threads, so it must be
    /// cheap and must not call back into the engine.
    fn async_notify(&self) {}
}

/// Listener that ignores everything
#[derive(Clone, Copy, Debug, Default)]
pub struct NullListener;

impl Listener for NullListener {}
