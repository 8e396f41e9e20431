//! Saving and restoring the engine's unfinished work

use std::collections::{HashMap, HashSet};
use std::path::Path;

use super::Engine;
use super::message::JobKind;
use super::task::{Batch, Task};
use crate::content::WriteOptions;
use crate::error::{Error, Result};
use crate::session_file::{SESSION_VERSION, SavedBatch, SavedTask, SessionFile};
use crate::task_state::TaskStateMachine;
use crate::types::{BatchId, CmdListId, TaskId};

impl Engine {
    /// Snapshot of every unfinished task and the batches they belong to
    ///
    /// Articles count as done only once their body is on disk. Bodies still
    /// waiting for a worker and articles held by a connection are saved as
    /// pending, ahead of the ones not handed out yet.
    pub fn session(&self) -> SessionFile {
        let in_flight = self.in_flight_articles();
        let tasks: Vec<SavedTask> = self
            .task_order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|t| !t.is_done())
            .map(|t| SavedTask {
                id: t.id,
                batch: t.batch,
                account: t.account,
                name: t.name.clone(),
                path: t.path.clone(),
                size: t.size,
                errors: t.all_errors(),
                state: t.stm.state(),
                runtime: t.runtime,
                groups: t.groups.clone(),
                // articles parked for the fill account still need fetching
                pending: in_flight
                    .get(&t.id)
                    .into_iter()
                    .flatten()
                    .chain(&t.pending)
                    .chain(&t.fill_pending)
                    .cloned()
                    .collect(),
                total_articles: t.total_articles,
                received_content: t.received_content,
                created: t.created,
            })
            .collect();

        let used: HashSet<BatchId> = tasks.iter().map(|t| t.batch).collect();
        let mut batches: Vec<SavedBatch> = self
            .batches
            .values()
            .filter(|b| used.contains(&b.id))
            .map(|b| SavedBatch {
                id: b.id,
                account: b.account,
                name: b.name.clone(),
                path: b.path.clone(),
                size: b.size,
                num_tasks: b.num_tasks,
                num_complete: b.num_complete,
                num_killed: b.num_killed,
                errors: b.errors,
                created: b.created,
            })
            .collect();
        batches.sort_by_key(|b| b.id);

        SessionFile {
            version: SESSION_VERSION,
            batches,
            tasks,
        }
    }

    /// Articles of each task that left the queue but are not written yet,
    /// in the order they were handed out
    fn in_flight_articles(&self) -> HashMap<TaskId, Vec<String>> {
        let mut bodies: Vec<_> = self
            .jobs
            .iter()
            .filter_map(|(job, tag)| match &tag.kind {
                JobKind::Body { article, .. } => Some((*job, tag.task, article)),
                _ => None,
            })
            .collect();
        bodies.sort_by_key(|(job, _, _)| *job);

        let mut lists: Vec<(CmdListId, TaskId, &Vec<String>)> = self
            .cmdlists
            .iter()
            .map(|(id, tag)| (*id, tag.task, &tag.articles))
            .collect();
        lists.sort_by_key(|(id, _, _)| *id);

        let mut in_flight: HashMap<TaskId, Vec<String>> = HashMap::new();
        for (_, task, article) in bodies {
            in_flight.entry(task).or_default().push(article.clone());
        }
        for (_, task, articles) in lists {
            in_flight
                .entry(task)
                .or_default()
                .extend(articles.iter().cloned());
        }
        in_flight
    }

    /// Write unfinished work to `path`
    ///
    /// Complete and killed tasks are left out; batches without an unfinished
    /// task are dropped. The file is replaced atomically.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionFile`] when the file cannot be written.
    pub fn save_session(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let session = self.session();
        session.save(path)?;
        tracing::info!(path = %path.display(), tasks = session.tasks.len(), "session saved");
        Ok(())
    }

    /// Restore work saved by [`save_session`](Self::save_session)
    ///
    /// Only an engine without tasks can load a session, since task and batch
    /// ids continue from the loaded ones. Tasks that were running come back
    /// queued, paused tasks stay paused, and partial output files are
    /// reopened instead of replaced. Articles that were in flight when the
    /// session was saved are fetched again.
    ///
    /// # Arguments
    ///
    /// * `path` - Session file written by [`save_session`](Self::save_session)
    ///
    /// # Returns
    ///
    /// The number of tasks restored.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] when the engine already has tasks
    /// - [`Error::SessionFile`] when the file is missing, malformed or of
    ///   another version
    /// - [`Error::AccountNotFound`] when a task refers to an account that is
    ///   not configured; nothing is restored then
    pub fn load_session(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        if !self.tasks.is_empty() {
            return Err(Error::InvalidState(
                "a session can only be loaded into an idle engine".to_string(),
            ));
        }
        let session = SessionFile::load(path)?;
        self.restore(session)
    }

    /// Restore an already parsed session
    ///
    /// # Errors
    ///
    /// Same as [`load_session`](Self::load_session), except that the engine
    /// may already hold tasks as long as the session's batch ids are free.
    pub fn restore(&mut self, session: SessionFile) -> Result<usize> {
        if let Some(task) = session
            .tasks
            .iter()
            .find(|t| !self.accounts.contains_key(&t.account))
        {
            return Err(Error::AccountNotFound(task.account));
        }

        for saved in &session.batches {
            if self.batches.contains_key(&saved.id) {
                return Err(Error::InvalidState(format!(
                    "batch {} already exists",
                    saved.id
                )));
            }
        }

        let options = WriteOptions {
            resume: true,
            ..self.write_options()
        };

        for saved in session.batches {
            self.next_batch = self.next_batch.max(saved.id.get() + 1);
            self.batches.insert(
                saved.id,
                Batch {
                    id: saved.id,
                    account: saved.account,
                    name: saved.name,
                    path: saved.path,
                    size: saved.size,
                    num_tasks: saved.num_tasks,
                    num_complete: saved.num_complete,
                    num_killed: saved.num_killed,
                    errors: saved.errors,
                    created: saved.created,
                    reported: false,
                },
            );
        }

        let count = session.tasks.len();
        for saved in session.tasks {
            let id: TaskId = saved.id;
            self.next_task = self.next_task.max(id.get() + 1);
            let file = super::FileSpec {
                name: saved.name,
                articles: saved.pending,
                groups: saved.groups,
                size: saved.size,
                priority: false,
            };
            let mut task = Task::new(id, saved.batch, saved.account, saved.path, file, options);
            task.total_articles = saved.total_articles.max(task.pending.len());
            task.done_before = task.total_articles - task.pending.len();
            task.stm = TaskStateMachine::restore(saved.state, saved.errors);
            task.runtime = saved.runtime;
            task.received_content = saved.received_content;
            task.created = saved.created;
            tracing::debug!(task_id = %id, state = %task.stm.state(), pending = task.pending.len(), "task restored");
            self.tasks.insert(id, task);
            self.task_order.push(id);
        }
        self.all_complete_reported = false;
        tracing::info!(tasks = count, "session restored");

        if self.started {
            let mut accounts: Vec<_> = self.accounts.keys().copied().collect();
            accounts.sort();
            for account in accounts {
                self.start_next_task(account);
            }
            self.dispatch();
        }
        Ok(count)
    }
}
