//! Messages posted to the engine from connection tasks and pool workers

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionEvent, EventSink};
use crate::content::BodyOutcome;
use crate::error::JobError;
use crate::listener::Listener;
use crate::threadpool::Completed;
use crate::types::{ConnectionId, TaskId};

/// What a pool job produced
#[derive(Debug)]
pub(crate) enum JobOutput {
    Body(BodyOutcome),
    Flushed,
    Cancelled,
    Finalized(Vec<PathBuf>),
}

pub(crate) type JobResult = Result<JobOutput, JobError>;

/// Engine-side bookkeeping for a submitted job
#[derive(Clone, Debug)]
pub(crate) struct JobTag {
    pub task: TaskId,
    pub kind: JobKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum JobKind {
    /// Until the job finishes the article is not on disk
    Body { bytes: u64, article: String },
    Flush,
    Cancel,
    Finalize,
}

/// Engine-side bookkeeping for a command list handed to a connection
#[derive(Clone, Debug)]
pub(crate) struct CmdListTag {
    pub task: TaskId,
    pub conn: ConnectionId,
    /// Runs on the fill account; its failures are final
    pub fill: bool,
    /// Articles the connection has not answered yet
    pub articles: Vec<String>,
    pub stop: CancellationToken,
}

#[derive(Debug)]
pub(crate) enum Message {
    Connection {
        conn: ConnectionId,
        event: ConnectionEvent,
    },
    Job(Completed<JobResult>),
}

/// Sending half of the engine queue
///
/// Every post wakes the host through [`Listener::async_notify`].
#[derive(Clone)]
pub(crate) struct Mailbox {
    tx: mpsc::UnboundedSender<Message>,
    listener: Arc<dyn Listener>,
}

impl Mailbox {
    pub(crate) fn new(listener: Arc<dyn Listener>) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, listener }, rx)
    }

    pub(crate) fn send(&self, message: Message) {
        if self.tx.send(message).is_ok() {
            self.listener.async_notify();
        }
    }
}

impl EventSink for Mailbox {
    fn post(&self, conn: ConnectionId, event: ConnectionEvent) {
        self.send(Message::Connection { conn, event });
    }
}
