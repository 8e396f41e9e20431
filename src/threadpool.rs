//! Fixed pool of worker threads with per-thread queues and affinity
//!
//! Every worker owns its own queue, so work submitted with the same
//! [`Affinity::SingleThread`] key always runs on the same thread, in
//! submission order. Work that has no ordering needs is spread round-robin
//! with [`Affinity::AnyThread`].
//!
//! A job never unwinds into the pool: panics are caught and delivered to the
//! completion callback as [`JobError::Panicked`].

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use crate::error::JobError;

/// Which worker a job may run on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Affinity {
    /// Any worker, chosen round-robin
    AnyThread,
    /// Always the same worker for the same key
    SingleThread(u64),
}

/// Identifier of a submitted job
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

/// A finished job, handed to the completion callback
#[derive(Debug)]
pub struct Completed<T> {
    /// Job identifier returned by [`ThreadPool::submit`]
    pub id: JobId,
    /// Affinity the job ran with
    pub affinity: Affinity,
    /// Job output, or the captured panic
    pub result: Result<T, JobError>,
}

type Work<T> = Box<dyn FnOnce() -> T + Send + 'static>;
type Callback<T> = Arc<dyn Fn(Completed<T>) + Send + Sync + 'static>;

struct Job<T> {
    id: JobId,
    affinity: Affinity,
    work: Work<T>,
}

struct QueueState<T> {
    jobs: VecDeque<Job<T>>,
    quit: bool,
}

struct WorkerQueue<T> {
    state: Mutex<QueueState<T>>,
    ready: Condvar,
}

// queued plus executing jobs across all workers
struct Pending {
    count: Mutex<usize>,
    drained: Condvar,
}

fn lock<G>(mutex: &Mutex<G>) -> MutexGuard<'_, G> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pool of persistent worker threads
///
/// # Examples
///
/// ```
/// use std::sync::{Arc, Mutex};
/// use usenet_engine::threadpool::{Affinity, ThreadPool};
///
/// let results = Arc::new(Mutex::new(Vec::new()));
/// let sink = Arc::clone(&results);
/// let mut pool = ThreadPool::new(2, move |done| {
///     sink.lock().unwrap().push(done.result.unwrap());
/// })
/// .unwrap();
///
/// for i in 0..4u32 {
///     pool.submit(move || i * 2, Affinity::SingleThread(7)).unwrap();
/// }
/// pool.wait_all();
/// assert_eq!(*results.lock().unwrap(), vec![0, 2, 4, 6]);
/// pool.shutdown();
/// ```
pub struct ThreadPool<T: Send + 'static> {
    queues: Vec<Arc<WorkerQueue<T>>>,
    threads: Vec<JoinHandle<()>>,
    pending: Arc<Pending>,
    next_thread: AtomicUsize,
    next_id: AtomicU64,
    running: bool,
}

impl<T: Send + 'static> std::fmt::Debug for ThreadPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("threads", &self.queues.len())
            .field("pending", &self.pending_jobs())
            .field("running", &self.running)
            .finish()
    }
}

impl<T: Send + 'static> ThreadPool<T> {
    /// Start `num_threads` workers; `on_complete` runs on the worker thread
    /// after each job
    pub fn new<F>(num_threads: usize, on_complete: F) -> crate::Result<Self>
    where
        F: Fn(Completed<T>) + Send + Sync + 'static,
    {
        if num_threads == 0 {
            return Err(crate::Error::Config {
                message: "thread pool needs at least one thread".to_string(),
                key: Some("worker_threads".to_string()),
            });
        }
        let callback: Callback<T> = Arc::new(on_complete);
        let pending = Arc::new(Pending {
            count: Mutex::new(0),
            drained: Condvar::new(),
        });

        let mut queues = Vec::with_capacity(num_threads);
        let mut threads = Vec::with_capacity(num_threads);
        for index in 0..num_threads {
            let queue = Arc::new(WorkerQueue {
                state: Mutex::new(QueueState {
                    jobs: VecDeque::new(),
                    quit: false,
                }),
                ready: Condvar::new(),
            });
            let handle = std::thread::Builder::new()
                .name(format!("engine-worker-{index}"))
                .spawn({
                    let queue = Arc::clone(&queue);
                    let pending = Arc::clone(&pending);
                    let callback = Arc::clone(&callback);
                    move || worker_loop(queue, pending, callback)
                })?;
            queues.push(queue);
            threads.push(handle);
        }
        tracing::debug!(threads = num_threads, "thread pool started");

        Ok(Self {
            queues,
            threads,
            pending,
            next_thread: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            running: true,
        })
    }

    /// Number of worker threads
    pub fn num_threads(&self) -> usize {
        self.queues.len()
    }

    /// Jobs queued or executing
    pub fn pending_jobs(&self) -> usize {
        *lock(&self.pending.count)
    }

    /// Queue `work` on a worker selected by `affinity`
    pub fn submit<F>(&self, work: F, affinity: Affinity) -> crate::Result<JobId>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        if !self.running {
            return Err(crate::Error::InvalidState(
                "thread pool is shut down".to_string(),
            ));
        }
        let index = match affinity {
            Affinity::AnyThread => self.next_thread.fetch_add(1, Ordering::Relaxed),
            Affinity::SingleThread(key) => (key % self.queues.len() as u64) as usize,
        } % self.queues.len();
        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));

        *lock(&self.pending.count) += 1;
        let queue = &self.queues[index];
        lock(&queue.state).jobs.push_back(Job {
            id,
            affinity,
            work: Box::new(work),
        });
        queue.ready.notify_one();
        Ok(id)
    }

    /// Block until every submitted job has finished
    pub fn wait_all(&self) {
        let mut count = lock(&self.pending.count);
        while *count > 0 {
            count = self
                .pending
                .drained
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stop the workers and join them
    ///
    /// Jobs still queued are dropped without running; the job executing on
    /// each worker finishes first.
    pub fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        let mut dropped = 0;
        for queue in &self.queues {
            let mut state = lock(&queue.state);
            state.quit = true;
            dropped += state.jobs.len();
            state.jobs.clear();
            queue.ready.notify_all();
        }
        if dropped > 0 {
            let mut count = lock(&self.pending.count);
            *count = count.saturating_sub(dropped);
            self.pending.drained.notify_all();
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread exited with a panic");
            }
        }
        tracing::debug!(dropped, "thread pool stopped");
    }
}

impl<T: Send + 'static> Drop for ThreadPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<T>(queue: Arc<WorkerQueue<T>>, pending: Arc<Pending>, callback: Callback<T>) {
    loop {
        let job = {
            let mut state = lock(&queue.state);
            while state.jobs.is_empty() && !state.quit {
                state = queue
                    .ready
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if state.quit {
                return;
            }
            match state.jobs.pop_front() {
                Some(job) => job,
                None => continue,
            }
        };

        let result = catch_unwind(AssertUnwindSafe(job.work)).map_err(|payload| {
            let message = panic_message(payload.as_ref());
            tracing::error!(job_id = job.id.0, error = %message, "job panicked");
            JobError::Panicked(message)
        });

        let completed = Completed {
            id: job.id,
            affinity: job.affinity,
            result,
        };
        if catch_unwind(AssertUnwindSafe(|| callback(completed))).is_err() {
            tracing::error!(job_id = job.id.0, "completion callback panicked");
        }

        let mut count = lock(&pending.count);
        *count = count.saturating_sub(1);
        if *count == 0 {
            pending.drained.notify_all();
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread::ThreadId;
    use std::time::Duration;

    fn collecting<T: Send + 'static>(
        threads: usize,
    ) -> (ThreadPool<T>, mpsc::Receiver<Completed<T>>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let pool = ThreadPool::new(threads, move |done| {
            let _ = tx.lock().unwrap().send(done);
        })
        .unwrap();
        (pool, rx)
    }

    #[test]
    fn test_single_thread_affinity_preserves_order() {
        let (pool, rx) = collecting::<(usize, ThreadId)>(4);

        for i in 0..50 {
            pool.submit(
                move || (i, std::thread::current().id()),
                Affinity::SingleThread(3),
            )
            .unwrap();
        }
        pool.wait_all();

        let results: Vec<_> = rx.try_iter().map(|c| c.result.unwrap()).collect();
        assert_eq!(results.len(), 50);
        let order: Vec<usize> = results.iter().map(|(i, _)| *i).collect();
        assert_eq!(order, (0..50).collect::<Vec<_>>(), "jobs ran out of order");
        let first_thread = results[0].1;
        assert!(
            results.iter().all(|(_, t)| *t == first_thread),
            "same key must always run on the same thread"
        );
    }

    #[test]
    fn test_any_thread_spreads_work() {
        let (pool, rx) = collecting::<ThreadId>(4);
        let barrier = Arc::new(std::sync::Barrier::new(4));

        for _ in 0..4 {
            let barrier = Arc::clone(&barrier);
            pool.submit(
                move || {
                    // all four jobs must be running at once to pass the barrier
                    barrier.wait();
                    std::thread::current().id()
                },
                Affinity::AnyThread,
            )
            .unwrap();
        }
        pool.wait_all();

        let mut threads: Vec<_> = rx.try_iter().map(|c| c.result.unwrap()).collect();
        threads.sort_by_key(|t| format!("{t:?}"));
        threads.dedup();
        assert_eq!(threads.len(), 4);
    }

    #[test]
    fn test_panic_is_captured() {
        let (pool, rx) = collecting::<u32>(1);

        let id = pool
            .submit(|| panic!("decoder exploded"), Affinity::AnyThread)
            .unwrap();
        pool.submit(|| 7, Affinity::AnyThread).unwrap();
        pool.wait_all();

        let done: Vec<_> = rx.try_iter().collect();
        assert_eq!(done.len(), 2, "the worker must survive the panic");
        assert_eq!(done[0].id, id);
        assert_eq!(
            done[0].result,
            Err(JobError::Panicked("decoder exploded".to_string()))
        );
        assert_eq!(done[1].result, Ok(7));
    }

    #[test]
    fn test_wait_all_with_nothing_pending_returns() {
        let (pool, _rx) = collecting::<()>(2);
        pool.wait_all();
        assert_eq!(pool.pending_jobs(), 0);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let (mut pool, _rx) = collecting::<()>(2);
        pool.shutdown();
        assert!(pool.submit(|| (), Affinity::AnyThread).is_err());
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_drops_queued_jobs() {
        let (mut pool, rx) = collecting::<u32>(1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();

        pool.submit(
            move || {
                let _ = gate_rx.recv_timeout(Duration::from_secs(5));
                1
            },
            Affinity::AnyThread,
        )
        .unwrap();
        for _ in 0..5 {
            pool.submit(|| 2, Affinity::AnyThread).unwrap();
        }

        std::thread::sleep(Duration::from_millis(50));
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let _ = gate_tx.send(());
        });
        pool.shutdown();
        releaser.join().unwrap();

        let ran: Vec<_> = rx.try_iter().map(|c| c.result.unwrap()).collect();
        assert_eq!(ran, vec![1], "queued jobs must not run after shutdown");
        assert_eq!(pool.pending_jobs(), 0);
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(ThreadPool::<()>::new(0, |_| {}).is_err());
    }
}
