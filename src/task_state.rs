//! Per-task execution state machine with buffer backpressure
//!
//! The machine decides when a task may ask connections for more article data
//! and when it has to stop and let the decoder drain what is already buffered.
//! Every transition returns whether it was accepted and appends the follow-up
//! [`TaskAction`]s the engine must carry out.

use serde::{Deserialize, Serialize};

use crate::types::TaskErrors;

/// Buffered bytes at which an active task stops requesting data (50 MB)
pub const HIGH_WATER_MARK: u64 = 50 * 1024 * 1024;

/// Task execution state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    /// Created, not yet started
    Queued,
    /// Started; waiting for a connection to deliver data
    Waiting,
    /// Receiving data
    Active,
    /// Too much data buffered; waiting for the decoder to catch up
    Debuffering,
    /// Paused by the user
    Paused,
    /// Finished, with or without errors
    Complete,
    /// Cancelled and discarded
    Killed,
}

impl State {
    /// Convert integer state code to State enum
    pub fn from_i32(state: i32) -> Self {
        match state {
            0 => State::Queued,
            1 => State::Waiting,
            2 => State::Active,
            3 => State::Debuffering,
            4 => State::Paused,
            5 => State::Complete,
            _ => State::Killed,
        }
    }

    /// Convert State enum to integer code
    pub fn to_i32(&self) -> i32 {
        match self {
            State::Queued => 0,
            State::Waiting => 1,
            State::Active => 2,
            State::Debuffering => 3,
            State::Paused => 4,
            State::Complete => 5,
            State::Killed => 6,
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Queued => "queued",
            State::Waiting => "waiting",
            State::Active => "active",
            State::Debuffering => "debuffering",
            State::Paused => "paused",
            State::Complete => "complete",
            State::Killed => "killed",
        };
        write!(f, "{s}")
    }
}

/// Follow-up work requested by a transition
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskAction {
    /// Set up the output pipeline before the first data arrives
    Prepare,
    /// Flush buffered output to disk
    Flush,
    /// Discard the output pipeline
    Cancel,
    /// Every buffer has been processed; close the output
    Finalize,
    /// Connections may take command lists from this task
    RunCmdList,
    /// Connections must not take further command lists from this task
    StopCmdList,
}

/// State machine tracking one task's lifecycle and buffered data
///
/// # Examples
///
/// ```
/// use usenet_engine::task_state::{State, TaskAction, TaskStateMachine};
///
/// let mut stm = TaskStateMachine::new();
/// let mut actions = Vec::new();
///
/// assert!(stm.start(&mut actions));
/// assert_eq!(actions, vec![TaskAction::Prepare, TaskAction::RunCmdList]);
///
/// stm.prepare(1);
/// actions.clear();
/// assert!(stm.enqueue(1024, &mut actions));
/// assert_eq!(stm.state(), State::Active);
///
/// assert!(stm.dequeue(1024, &mut actions));
/// assert!(actions.contains(&TaskAction::Finalize));
/// assert!(stm.complete());
/// assert_eq!(stm.state(), State::Complete);
/// ```
#[derive(Clone, Debug)]
pub struct TaskStateMachine {
    state: State,
    started: bool,
    buffered_bytes: u64,
    expected_buffers: usize,
    enqueued: usize,
    dequeued: usize,
    finalized: bool,
    errors: TaskErrors,
}

impl Default for TaskStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStateMachine {
    /// Create a machine in the `Queued` state
    pub fn new() -> Self {
        Self {
            state: State::Queued,
            started: false,
            buffered_bytes: 0,
            expected_buffers: 0,
            enqueued: 0,
            dequeued: 0,
            finalized: false,
            errors: TaskErrors::empty(),
        }
    }

    /// Restore a machine for a task loaded from a session file
    ///
    /// Running states come back as `Queued` so the task restarts cleanly; a
    /// paused task keeps its paused state but will restart from scratch when
    /// resumed.
    pub fn restore(state: State, errors: TaskErrors) -> Self {
        let mut stm = Self::new();
        stm.errors = errors;
        stm.state = match state {
            State::Paused => State::Paused,
            _ => State::Queued,
        };
        stm
    }

    /// Current state
    pub fn state(&self) -> State {
        self.state
    }

    /// Bytes enqueued but not yet dequeued
    pub fn buffered_bytes(&self) -> u64 {
        self.buffered_bytes
    }

    /// Number of buffers processed so far
    pub fn processed_buffers(&self) -> usize {
        self.dequeued
    }

    /// Number of buffers accepted so far
    pub fn enqueued_buffers(&self) -> usize {
        self.enqueued
    }

    /// Number of buffers the task expects in total
    pub fn expected_buffers(&self) -> usize {
        self.expected_buffers
    }

    /// Errors recorded through [`fault`](Self::fault)
    pub fn errors(&self) -> TaskErrors {
        self.errors
    }

    /// Whether the task has been started at least once
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Whether buffers may be enqueued or dequeued
    pub fn is_runnable(&self) -> bool {
        matches!(
            self.state,
            State::Active | State::Waiting | State::Debuffering | State::Paused
        )
    }

    /// Whether the task is the one driving its account's connections
    pub fn is_active(&self) -> bool {
        matches!(self.state, State::Active | State::Waiting)
    }

    /// `Queued → Waiting`
    pub fn start(&mut self, actions: &mut Vec<TaskAction>) -> bool {
        if self.state != State::Queued {
            return false;
        }
        self.started = true;
        self.goto(State::Waiting);
        actions.push(TaskAction::Prepare);
        actions.push(TaskAction::RunCmdList);
        true
    }

    /// Record how many buffers the task will produce in total
    pub fn prepare(&mut self, expected_buffers: usize) {
        self.expected_buffers = expected_buffers;
    }

    /// Pause the task
    pub fn pause(&mut self, actions: &mut Vec<TaskAction>) -> bool {
        match self.state {
            State::Active | State::Waiting => {
                actions.push(TaskAction::StopCmdList);
                self.goto(State::Paused);
                true
            }
            State::Queued | State::Debuffering => {
                self.goto(State::Paused);
                true
            }
            _ => false,
        }
    }

    /// Resume a paused task
    pub fn resume(&mut self, actions: &mut Vec<TaskAction>) -> bool {
        if self.state != State::Paused {
            return false;
        }
        if self.started {
            self.goto(State::Waiting);
            actions.push(TaskAction::RunCmdList);
        } else {
            self.goto(State::Queued);
        }
        true
    }

    /// The last connection working on the task went away
    pub fn disrupt(&mut self) -> bool {
        if self.state != State::Active {
            return false;
        }
        self.goto(State::Waiting);
        true
    }

    /// Account for a received buffer of `bytes`
    pub fn enqueue(&mut self, bytes: u64, actions: &mut Vec<TaskAction>) -> bool {
        if !self.is_runnable() {
            return false;
        }
        self.buffered_bytes += bytes;
        self.enqueued += 1;

        if self.state == State::Waiting {
            self.goto(State::Active);
        }
        if self.state == State::Active {
            if self.enqueued >= self.expected_buffers {
                actions.push(TaskAction::StopCmdList);
            } else if self.buffered_bytes >= HIGH_WATER_MARK {
                actions.push(TaskAction::StopCmdList);
                self.goto(State::Debuffering);
            }
        }
        true
    }

    /// Account for a processed buffer of `bytes`
    pub fn dequeue(&mut self, bytes: u64, actions: &mut Vec<TaskAction>) -> bool {
        if !self.is_runnable() {
            return false;
        }
        self.buffered_bytes = self.buffered_bytes.saturating_sub(bytes);
        self.dequeued += 1;

        if self.state == State::Debuffering && self.buffered_bytes == 0 {
            self.goto(State::Waiting);
            if self.enqueued < self.expected_buffers {
                actions.push(TaskAction::RunCmdList);
            }
        }
        if !self.finalized && self.dequeued >= self.expected_buffers {
            self.finalized = true;
            actions.push(TaskAction::Finalize);
        }
        true
    }

    /// Request a flush of the output pipeline
    pub fn flush(&mut self, actions: &mut Vec<TaskAction>) -> bool {
        if !self.is_runnable() {
            return false;
        }
        actions.push(TaskAction::Flush);
        true
    }

    /// Move a finalized task to `Complete`
    pub fn complete(&mut self) -> bool {
        if !self.is_runnable() || self.buffered_bytes != 0 {
            return false;
        }
        self.goto(State::Complete);
        true
    }

    /// Cancel the task
    pub fn kill(&mut self, actions: &mut Vec<TaskAction>) -> bool {
        if self.state == State::Killed {
            return false;
        }
        self.emit_teardown(actions);
        self.buffered_bytes = 0;
        self.goto(State::Killed);
        true
    }

    /// Fail the task with `errors`, ending in `Complete`
    pub fn fault(&mut self, errors: TaskErrors, actions: &mut Vec<TaskAction>) -> bool {
        if matches!(self.state, State::Killed | State::Complete) {
            return false;
        }
        self.emit_teardown(actions);
        self.errors |= errors;
        self.buffered_bytes = 0;
        self.goto(State::Complete);
        true
    }

    fn emit_teardown(&self, actions: &mut Vec<TaskAction>) {
        match self.state {
            State::Active | State::Waiting => {
                actions.push(TaskAction::StopCmdList);
                actions.push(TaskAction::Cancel);
            }
            State::Debuffering | State::Paused => actions.push(TaskAction::Cancel),
            State::Queued | State::Complete | State::Killed => {}
        }
    }

    fn goto(&mut self, next: State) {
        tracing::trace!(from = %self.state, to = %next, "task state transition");
        self.state = next;
    }
}
