//! Recording listener and wait helpers for integration tests

use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use usenet_engine::{
    BatchResult, Engine, ErrorReport, FileResult, FileStatus, Listener,
};

/// Listener that records every callback and wakes the test driver
#[derive(Default)]
pub struct Events {
    wake: Notify,
    errors: Mutex<Vec<ErrorReport>>,
    files: Mutex<Vec<FileResult>>,
    batches: Mutex<Vec<BatchResult>>,
    all_complete: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl Events {
    /// Errors reported so far
    pub fn errors(&self) -> Vec<ErrorReport> {
        self.errors.lock().unwrap().clone()
    }

    /// Files completed so far
    pub fn files(&self) -> Vec<FileResult> {
        self.files.lock().unwrap().clone()
    }

    /// Batches completed so far
    pub fn batches(&self) -> Vec<BatchResult> {
        self.batches.lock().unwrap().clone()
    }

    /// Times `on_all_complete` fired
    pub fn all_complete(&self) -> usize {
        self.all_complete.load(Ordering::SeqCst)
    }

    /// Times `on_shutdown_complete` fired
    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl Listener for Events {
    fn on_error(&self, report: ErrorReport) {
        self.errors.lock().unwrap().push(report);
    }

    fn on_file_complete(&self, result: FileResult) {
        self.files.lock().unwrap().push(result);
    }

    fn on_batch_complete(&self, result: BatchResult) {
        self.batches.lock().unwrap().push(result);
    }

    fn on_all_complete(&self) {
        self.all_complete.fetch_add(1, Ordering::SeqCst);
    }

    fn on_shutdown_complete(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }

    fn async_notify(&self) {
        self.wake.notify_one();
    }
}

/// Result of driving the engine
#[derive(Debug, PartialEq, Eq)]
pub enum WaitResult {
    /// The condition became true
    Completed,
    /// Timeout waiting for the condition
    Timeout,
}

/// Pump and tick the engine until `done` holds or `timeout` passes
pub async fn drive_until(
    engine: &mut Engine,
    events: &Events,
    timeout: Duration,
    mut done: impl FnMut(&Engine, &Events) -> bool,
) -> WaitResult {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        engine.pump();
        if done(engine, events) {
            return WaitResult::Completed;
        }
        tokio::select! {
            _ = events.wake.notified() => {}
            _ = ticker.tick() => engine.tick(),
            _ = tokio::time::sleep_until(deadline) => return WaitResult::Timeout,
        }
    }
}

/// Drive until `count` files completed
pub async fn wait_for_files(
    engine: &mut Engine,
    events: &Events,
    count: usize,
    timeout: Duration,
) -> WaitResult {
    drive_until(engine, events, timeout, |_, ev| ev.files().len() >= count).await
}

/// Assert that the file named `name` completed with `expected`
pub fn assert_file_status(events: &Events, name: &str, expected: FileStatus) {
    let files = events.files();
    let file = files
        .iter()
        .find(|f| f.name == name)
        .unwrap_or_else(|| panic!("no result for {name}; have {files:?}"));
    assert_eq!(
        file.status, expected,
        "file {name} finished as {:?}, expected {expected:?}",
        file.status
    );
}

/// Assert that `path` holds exactly `expected`
pub fn assert_file_contents(path: &Path, expected: &[u8]) {
    let actual = std::fs::read(path)
        .unwrap_or_else(|e| panic!("failed to read {}: {e}", path.display()));
    assert_eq!(actual.len(), expected.len(), "size mismatch for {}", path.display());
    assert!(actual == expected, "content mismatch for {}", path.display());
}
