//! Article bodies, pool jobs and task completion

use std::sync::{Arc, Mutex, PoisonError};

use super::Engine;
use super::message::{JobKind, JobOutput, JobResult, JobTag};
use crate::content::{BodyKind, ContentWriter};
use crate::error::JobError;
use crate::listener::{BatchResult, ErrorKind, ErrorReport, ErrorResource, FileResult};
use crate::task_state::{State, TaskAction};
use crate::threadpool::{Affinity, Completed};
use crate::types::{BatchId, ContentStatus, FileStatus, TaskErrors, TaskId};

/// Message ids can be fetched from any provider; article numbers are
/// specific to one server
fn is_fillable(article: &str) -> bool {
    !article.bytes().all(|b| b.is_ascii_digit())
}

impl Engine {
    /// Apply one article reply to its task
    pub(super) fn on_body(
        &mut self,
        task_id: TaskId,
        article: String,
        status: ContentStatus,
        data: Vec<u8>,
        from_fill: bool,
    ) {
        let fill_account = self.fill_account();
        let Some(task) = self.tasks.get_mut(&task_id) else {
            tracing::debug!(task_id = %task_id, "body for erased task dropped");
            return;
        };
        let mut actions = Vec::new();

        match status {
            ContentStatus::Success => {
                let bytes = data.len() as u64;
                if !task.stm.enqueue(bytes, &mut actions) {
                    tracing::debug!(task_id = %task_id, article = %article, state = %task.stm.state(), "task not runnable; body dropped");
                    task.pending.push_front(article);
                    return;
                }
                task.received_content = true;
                let writer = Arc::clone(&task.writer);
                self.submit(task_id, JobKind::Body { bytes, article }, move || {
                    lock(&writer).write_body(&data).map(JobOutput::Body)
                });
            }
            ContentStatus::Unavailable | ContentStatus::Dmca => {
                let refill = !from_fill
                    && is_fillable(&article)
                    && fill_account.is_some_and(|fill| fill != task.account);
                if refill && task.stm.is_runnable() {
                    tracing::debug!(task_id = %task_id, article = %article, "article queued for fill account");
                    task.fill_pending.push_back(article);
                    self.dispatch();
                    return;
                }
                if !task.stm.enqueue(0, &mut actions) {
                    task.pending.push_front(article);
                    return;
                }
                task.stm.dequeue(0, &mut actions);
                let flag = if status == ContentStatus::Dmca {
                    TaskErrors::DMCA
                } else {
                    TaskErrors::UNAVAILABLE
                };
                task.errors.insert(flag);
                tracing::debug!(task_id = %task_id, article = %article, ?status, "article missing");
            }
        }
        self.perform(task_id, actions);
    }

    pub(super) fn submit<F>(&mut self, task_id: TaskId, kind: JobKind, work: F)
    where
        F: FnOnce() -> JobResult + Send + 'static,
    {
        match self.pool.submit(work, Affinity::SingleThread(task_id.get())) {
            Ok(job) => {
                self.jobs.insert(job, JobTag { task: task_id, kind });
                if let Some(task) = self.tasks.get_mut(&task_id) {
                    task.outstanding_jobs += 1;
                }
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "failed to submit job");
                self.fail_task(task_id, JobError::Panicked(e.to_string()));
            }
        }
    }

    pub(super) fn submit_flush(&mut self, task_id: TaskId) {
        let Some(writer) = self.writer_of(task_id) else {
            return;
        };
        self.submit(task_id, JobKind::Flush, move || {
            lock(&writer).flush().map(|()| JobOutput::Flushed)
        });
    }

    pub(super) fn submit_cancel(&mut self, task_id: TaskId) {
        let Some(writer) = self.writer_of(task_id) else {
            return;
        };
        self.submit(task_id, JobKind::Cancel, move || {
            lock(&writer).cancel();
            Ok(JobOutput::Cancelled)
        });
    }

    pub(super) fn submit_finalize(&mut self, task_id: TaskId) {
        let Some(writer) = self.writer_of(task_id) else {
            return;
        };
        self.submit(task_id, JobKind::Finalize, move || {
            lock(&writer).finalize().map(JobOutput::Finalized)
        });
    }

    fn writer_of(&self, task_id: TaskId) -> Option<Arc<Mutex<ContentWriter>>> {
        self.tasks.get(&task_id).map(|t| Arc::clone(&t.writer))
    }

    pub(super) fn on_job_done(&mut self, done: Completed<JobResult>) {
        let Some(tag) = self.jobs.remove(&done.id) else {
            tracing::debug!(job = ?done.id, "completion for unknown job");
            return;
        };
        let result = done.result.and_then(|r| r);
        let Some(task) = self.tasks.get_mut(&tag.task) else {
            return;
        };
        task.outstanding_jobs = task.outstanding_jobs.saturating_sub(1);

        match (tag.kind, result) {
            (JobKind::Body { bytes, .. }, Ok(JobOutput::Body(outcome))) => {
                if outcome.kind == BodyKind::Damaged {
                    task.errors.insert(TaskErrors::DAMAGED);
                }
                task.bytes_written += outcome.written;
                let mut actions = Vec::new();
                task.stm.dequeue(bytes, &mut actions);
                // a drained task takes its connections back right away
                let drained = actions.contains(&TaskAction::RunCmdList);
                self.perform(tag.task, actions);
                if drained {
                    tracing::debug!(task_id = %tag.task, "buffer drained; resuming downloads");
                    self.dispatch();
                }
            }
            (JobKind::Finalize, Ok(JobOutput::Finalized(paths))) => {
                task.paths = paths;
                if task.stm.complete() {
                    self.finish_task(tag.task);
                }
            }
            (JobKind::Flush | JobKind::Cancel, Ok(_)) => {}
            (kind, Ok(output)) => {
                tracing::warn!(task_id = %tag.task, ?kind, ?output, "job produced unexpected output");
            }
            (_, Err(e)) => self.fail_task(tag.task, e),
        }
        self.maybe_erase(tag.task);
    }

    /// Turn a processing failure into a task fault
    fn fail_task(&mut self, task_id: TaskId, error: JobError) {
        tracing::error!(task_id = %task_id, error = %error, "task processing failed");
        let kind = match error {
            JobError::Create { .. } => ErrorKind::Output,
            _ => ErrorKind::Processing,
        };
        self.listener.on_error(ErrorReport {
            resource: ErrorResource::Task(task_id),
            what: error.to_string(),
            kind,
        });

        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        let mut actions = Vec::new();
        if task.stm.fault(TaskErrors::OTHER, &mut actions) {
            self.perform(task_id, actions);
            self.finish_task(task_id);
        }
    }

    /// Report a task that reached `Complete`
    fn finish_task(&mut self, task_id: TaskId) {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        task.run_cmds = false;
        task.eta = None;
        let errors = task.all_errors();
        let status = FileStatus::from_errors(errors, task.received_content);
        let result = FileResult {
            task: task_id,
            batch: task.batch,
            account: task.account,
            name: task.name.clone(),
            paths: task.paths.clone(),
            size: task.bytes_written,
            status,
            errors,
        };
        let (account, batch) = (task.account, task.batch);
        tracing::info!(task_id = %task_id, ?status, errors = %errors, bytes = task.bytes_written, "task complete");
        self.listener.on_file_complete(result);

        if let Some(b) = self.batches.get_mut(&batch) {
            b.num_complete += 1;
            b.errors |= errors;
        }
        self.update_batch(batch);

        if self.settings.auto_remove_complete {
            self.maybe_erase(task_id);
        }
        self.start_next_task(account);
        self.dispatch();
        self.check_all_complete();
    }

    /// Report the batch once all of its tasks are done
    pub(super) fn update_batch(&mut self, batch_id: BatchId) {
        let Some(batch) = self.batches.get_mut(&batch_id) else {
            return;
        };
        if batch.reported || !batch.is_complete() {
            return;
        }
        batch.reported = true;
        let result = BatchResult {
            batch: batch.id,
            account: batch.account,
            name: batch.name.clone(),
            path: batch.path.clone(),
            num_complete: batch.num_complete,
            num_killed: batch.num_killed,
            errors: batch.errors,
        };
        tracing::info!(batch_id = %batch_id, complete = result.num_complete, killed = result.num_killed, "batch complete");
        self.listener.on_batch_complete(result);
    }

    /// Erase a killed task (or a complete one under auto-remove) once no job
    /// refers to it any more
    pub(super) fn maybe_erase(&mut self, task_id: TaskId) {
        let Some(task) = self.tasks.get(&task_id) else {
            return;
        };
        if task.outstanding_jobs > 0 {
            return;
        }
        let erase = match task.stm.state() {
            State::Killed => true,
            State::Complete => self.settings.auto_remove_complete,
            _ => false,
        };
        if !erase {
            return;
        }
        tracing::debug!(task_id = %task_id, "task erased");
        self.tasks.remove(&task_id);
        self.task_order.retain(|id| *id != task_id);
    }
}

fn lock(writer: &Mutex<ContentWriter>) -> std::sync::MutexGuard<'_, ContentWriter> {
    writer.lock().unwrap_or_else(PoisonError::into_inner)
}
