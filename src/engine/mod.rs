//! The download engine
//!
//! [`Engine`] owns accounts, connections, tasks and batches in id-keyed maps.
//! Connection tasks and pool workers never touch that state; they post
//! messages to a single queue and call [`Listener::async_notify`]. The host
//! then calls [`Engine::pump`] from its own context, which drains the queue
//! and applies every change. [`Engine::tick`] should be called about once a
//! second for rates, ETAs and reconnects.
//!
//! ```no_run
//! use std::sync::Arc;
//! use usenet_engine::{Account, AccountId, Engine, FileSpec, NullListener, Server};
//!
//! # async fn run() -> usenet_engine::Result<()> {
//! let mut engine = Engine::new(Arc::new(NullListener))?;
//!
//! let mut account = Account::new(AccountId(1), "provider");
//! account.secure_server = Some(Server::new("news.example.com", 563));
//! account.username = Some("user".into());
//! account.password = Some("pass".into());
//! engine.set_account(account);
//!
//! let file = FileSpec::new("file.bin", vec!["part1@example.com".into()])
//!     .with_groups(vec!["alt.binaries.test".into()]);
//! engine.download(AccountId(1), "/downloads", file)?;
//! engine.start();
//!
//! let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
//! while engine.num_pending_tasks() > 0 {
//!     interval.tick().await;
//!     engine.pump();
//!     engine.tick();
//! }
//! # Ok(())
//! # }
//! ```

mod connections;
mod message;
mod persist;
mod processing;
mod task;

pub use connections::ConnectionInfo;
pub use task::{BatchInfo, FileSpec, TaskInfo};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::config::{Account, EngineConfig, Settings};
use crate::connection::{Connector, TcpConnector};
use crate::content::WriteOptions;
use crate::error::{Error, Result};
use crate::listener::Listener;
use crate::speedometer::Speedometer;
use crate::task_state::{State, TaskAction};
use crate::threadpool::{JobId, ThreadPool};
use crate::throttle::Throttle;
use crate::types::{AccountId, BatchId, CmdListId, ConnectionId, TaskId};

use connections::{AccountTest, Conn};
use message::{CmdListTag, JobResult, JobTag, Mailbox, Message};
use task::{Batch, Task};

/// Builder for [`Engine`]
pub struct EngineBuilder {
    listener: Arc<dyn Listener>,
    config: EngineConfig,
    settings: Settings,
    connector: Option<Arc<dyn Connector>>,
    runtime: Option<Handle>,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl EngineBuilder {
    /// Static configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Initial runtime settings
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Replace the TCP/TLS connector
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Runtime connections are spawned on (default: the current one)
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Build the engine and start its worker threads
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the configuration fails
    /// [`EngineConfig::validate`], and [`Error::Io`] when a worker thread
    /// cannot be spawned.
    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| {
                Error::InvalidState("engine must be built inside a tokio runtime".to_string())
            })?,
        };
        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(TcpConnector::new()?),
        };

        let (mailbox, inbox) = Mailbox::new(Arc::clone(&self.listener));
        let pool = {
            let mailbox = mailbox.clone();
            ThreadPool::new(self.config.worker_threads, move |done| {
                mailbox.send(Message::Job(done));
            })?
        };
        let throttle = Throttle::new(self.settings.throttle_limit());

        tracing::info!(
            workers = self.config.worker_threads,
            throttle = ?throttle.limit(),
            "engine created"
        );

        Ok(Engine {
            config: self.config,
            settings: self.settings,
            listener: self.listener,
            connector,
            runtime,
            throttle,
            pool,
            mailbox,
            inbox,
            accounts: HashMap::new(),
            conns: HashMap::new(),
            account_tests: HashMap::new(),
            tasks: HashMap::new(),
            task_order: Vec::new(),
            batches: HashMap::new(),
            jobs: HashMap::new(),
            cmdlists: HashMap::new(),
            next_task: 1,
            next_batch: 1,
            next_conn: 1,
            next_cmdlist: 1,
            started: false,
            shutdown_pending: false,
            all_complete_reported: false,
            speed: Speedometer::new(),
            tick_bytes: 0,
            bytes_downloaded: 0,
        })
    }
}

/// Multi-account NNTP download engine
pub struct Engine {
    config: EngineConfig,
    settings: Settings,
    listener: Arc<dyn Listener>,
    connector: Arc<dyn Connector>,
    runtime: Handle,
    throttle: Throttle,
    pool: ThreadPool<JobResult>,
    mailbox: Mailbox,
    inbox: mpsc::UnboundedReceiver<Message>,

    accounts: HashMap<AccountId, Account>,
    conns: HashMap<ConnectionId, Conn>,
    account_tests: HashMap<ConnectionId, AccountTest>,
    tasks: HashMap<TaskId, Task>,
    // scheduling order; priority tasks go first
    task_order: Vec<TaskId>,
    batches: HashMap<BatchId, Batch>,
    jobs: HashMap<JobId, JobTag>,
    cmdlists: HashMap<CmdListId, CmdListTag>,

    next_task: u64,
    next_batch: u64,
    next_conn: u64,
    next_cmdlist: u64,

    started: bool,
    // stop() was called and connections are still closing
    shutdown_pending: bool,
    all_complete_reported: bool,

    speed: Speedometer,
    tick_bytes: u64,
    bytes_downloaded: u64,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("started", &self.started)
            .field("accounts", &self.accounts.len())
            .field("connections", &self.conns.len())
            .field("tasks", &self.tasks.len())
            .field("batches", &self.batches.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Engine with default configuration on the current tokio runtime
    ///
    /// # Errors
    ///
    /// Fails like [`EngineBuilder::build`].
    pub fn new(listener: Arc<dyn Listener>) -> Result<Self> {
        Self::builder(listener).build()
    }

    /// Start building an engine
    pub fn builder(listener: Arc<dyn Listener>) -> EngineBuilder {
        EngineBuilder {
            listener,
            config: EngineConfig::default(),
            settings: Settings::default(),
            connector: None,
            runtime: None,
        }
    }

    // ---------------------------------------------------------------------
    // Configuration
    // ---------------------------------------------------------------------

    /// Add or update an account
    ///
    /// Accounts are never removed, only replaced by id. When an existing
    /// account changes:
    ///
    /// - a different server, pipelining or compression setting closes every
    ///   connection of the account so new ones pick up the change
    /// - different credentials restart only the connections that failed
    ///   authentication; healthy connections keep running
    ///
    /// While started, the account's connection count is then brought to
    /// `max_connections` and its next task is started.
    ///
    /// # Arguments
    ///
    /// * `account` - Account to add, or replacement for the account with the
    ///   same id
    pub fn set_account(&mut self, account: Account) {
        let id = account.id;
        let prefer_secure = self.settings.prefer_secure;
        let previous = self.accounts.insert(id, account);

        if let (Some(previous), Some(current)) = (previous, self.accounts.get(&id)) {
            let endpoint_changed = previous.endpoint(prefer_secure) != current.endpoint(prefer_secure)
                || previous.enable_pipelining != current.enable_pipelining
                || previous.enable_compression != current.enable_compression;
            let credentials_changed = previous.credentials_differ(current);
            if endpoint_changed {
                tracing::info!(account_id = %id, "server changed; closing connections");
                self.close_account_connections(id);
            } else if credentials_changed {
                self.restart_auth_failed(id);
            }
        } else {
            tracing::info!(account_id = %id, "account added");
        }

        if self.started {
            self.start_account_connections(id);
            self.start_next_task(id);
            self.dispatch();
        }
    }

    /// Configured accounts
    pub fn accounts(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> = self.accounts.values().cloned().collect();
        accounts.sort_by_key(|a| a.id);
        accounts
    }

    /// Replace the runtime settings
    ///
    /// The throttle applies immediately; output options apply to files not
    /// yet created. Tasks restored from a session keep appending to their
    /// partial files.
    pub fn set_settings(&mut self, settings: Settings) {
        self.throttle.set_limit(settings.throttle_limit());
        self.settings = settings;
        let options = self.write_options();
        for task in self.tasks.values() {
            task.writer().set_options(options);
        }
        tracing::debug!(throttle = ?self.throttle.limit(), "settings updated");
    }

    /// Current runtime settings
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn write_options(&self) -> WriteOptions {
        WriteOptions {
            overwrite: self.settings.overwrite_existing_files,
            discard_text: self.settings.discard_text_content,
            resume: false,
        }
    }

    /// Account used to re-fetch articles other accounts could not provide
    fn fill_account(&self) -> Option<AccountId> {
        self.accounts
            .values()
            .filter(|a| a.fill_account && a.endpoint(self.settings.prefer_secure).is_some())
            .map(|a| a.id)
            .min()
    }

    // ---------------------------------------------------------------------
    // Downloads
    // ---------------------------------------------------------------------

    /// Download one file into `path`
    ///
    /// The file becomes a batch of its own, named after the file. Nothing is
    /// fetched until the engine is [started](Self::start).
    ///
    /// # Arguments
    ///
    /// * `account` - Account whose connections fetch the articles
    /// * `path` - Output directory; created when the first body is written
    /// * `file` - Name, articles and candidate groups of the file
    ///
    /// # Returns
    ///
    /// The id of the new batch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] for an unknown account and
    /// [`Error::InvalidState`] when the file has no articles.
    pub fn download(
        &mut self,
        account: AccountId,
        path: impl Into<PathBuf>,
        file: FileSpec,
    ) -> Result<BatchId> {
        let description = file.name.clone();
        self.download_batch(account, path, description, vec![file])
    }

    /// Download several files as one batch into `path`
    ///
    /// Each file becomes a task. Priority files go in front of every task
    /// already queued, keeping their order among themselves.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] for an unknown account and
    /// [`Error::InvalidState`] when the batch is empty or a file has no
    /// articles.
    pub fn download_batch(
        &mut self,
        account: AccountId,
        path: impl Into<PathBuf>,
        description: impl Into<String>,
        files: Vec<FileSpec>,
    ) -> Result<BatchId> {
        if !self.accounts.contains_key(&account) {
            return Err(Error::AccountNotFound(account));
        }
        if files.is_empty() {
            return Err(Error::InvalidState("batch contains no files".to_string()));
        }
        if let Some(empty) = files.iter().find(|f| f.articles.is_empty()) {
            return Err(Error::InvalidState(format!(
                "file {} has no articles",
                empty.name
            )));
        }

        let path = path.into();
        let batch_id = BatchId(self.next_batch);
        self.next_batch += 1;
        let options = self.write_options();

        let mut batch = Batch {
            id: batch_id,
            account,
            name: description.into(),
            path: path.clone(),
            size: 0,
            num_tasks: files.len(),
            num_complete: 0,
            num_killed: 0,
            errors: Default::default(),
            created: chrono::Utc::now(),
            reported: false,
        };

        let mut priority_slot = 0;
        for file in files {
            let id = TaskId(self.next_task);
            self.next_task += 1;
            batch.size += file.size;
            let priority = file.priority;
            tracing::debug!(task_id = %id, batch_id = %batch_id, file = %file.name, articles = file.articles.len(), priority, "task created");
            let task = Task::new(id, batch_id, account, path.clone(), file, options);
            self.tasks.insert(id, task);
            if priority {
                self.task_order.insert(priority_slot, id);
                priority_slot += 1;
            } else {
                self.task_order.push(id);
            }
        }
        tracing::info!(batch_id = %batch_id, account_id = %account, tasks = batch.num_tasks, "batch queued");
        self.batches.insert(batch_id, batch);
        self.all_complete_reported = false;

        if self.started {
            self.start_next_task(account);
            self.dispatch();
        }
        Ok(batch_id)
    }

    /// Kill a task, discarding its output
    ///
    /// Returns false when the task was already killed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] for an unknown task.
    pub fn kill_task(&mut self, id: TaskId) -> Result<bool> {
        let task = self.tasks.get_mut(&id).ok_or(Error::TaskNotFound(id))?;
        let was_done = task.is_done();
        let mut actions = Vec::new();
        if !task.stm.kill(&mut actions) {
            return Ok(false);
        }
        task.run_cmds = false;
        task.resume_pending = false;
        let (account, batch) = (task.account, task.batch);
        tracing::info!(task_id = %id, "task killed");

        self.perform(id, actions);
        if !was_done {
            if let Some(batch) = self.batches.get_mut(&batch) {
                batch.num_killed += 1;
            }
            self.update_batch(batch);
        }
        self.maybe_erase(id);
        self.start_next_task(account);
        self.dispatch();
        self.check_all_complete();
        Ok(true)
    }

    /// Kill every unfinished task of a batch
    ///
    /// The batch is reported through
    /// [`Listener::on_batch_complete`](crate::Listener::on_batch_complete)
    /// once its last task is killed.
    ///
    /// # Returns
    ///
    /// The number of tasks killed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BatchNotFound`] for an unknown batch.
    pub fn kill_batch(&mut self, id: BatchId) -> Result<usize> {
        if !self.batches.contains_key(&id) {
            return Err(Error::BatchNotFound(id));
        }
        let members: Vec<TaskId> = self
            .task_order
            .iter()
            .filter(|t| {
                self.tasks
                    .get(*t)
                    .is_some_and(|task| task.batch == id && !task.is_done())
            })
            .copied()
            .collect();
        tracing::info!(batch_id = %id, tasks = members.len(), "killing batch");
        let mut killed = 0;
        for task in members {
            if self.kill_task(task)? {
                killed += 1;
            }
        }
        Ok(killed)
    }

    /// Move a task one place towards the front of the queue
    ///
    /// Only the order in which queued tasks are started changes; a running
    /// task keeps running. Returns false when the task is already first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] for an unknown task.
    pub fn move_task_up(&mut self, id: TaskId) -> Result<bool> {
        let pos = self.order_of(id)?;
        if pos == 0 {
            return Ok(false);
        }
        self.task_order.swap(pos, pos - 1);
        tracing::debug!(task_id = %id, position = pos - 1, "task moved up");
        Ok(true)
    }

    /// Move a task one place towards the back of the queue
    ///
    /// Returns false when the task is already last.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] for an unknown task.
    pub fn move_task_down(&mut self, id: TaskId) -> Result<bool> {
        let pos = self.order_of(id)?;
        if pos + 1 >= self.task_order.len() {
            return Ok(false);
        }
        self.task_order.swap(pos, pos + 1);
        tracing::debug!(task_id = %id, position = pos + 1, "task moved down");
        Ok(true)
    }

    fn order_of(&self, id: TaskId) -> Result<usize> {
        self.task_order
            .iter()
            .position(|t| *t == id)
            .ok_or(Error::TaskNotFound(id))
    }

    /// Pause a task; returns false when it cannot be paused
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] for an unknown task.
    pub fn pause_task(&mut self, id: TaskId) -> Result<bool> {
        let task = self.tasks.get_mut(&id).ok_or(Error::TaskNotFound(id))?;
        task.resume_pending = false;
        let mut actions = Vec::new();
        if !task.stm.pause(&mut actions) {
            return Ok(false);
        }
        let account = task.account;
        tracing::info!(task_id = %id, "task paused");
        self.perform(id, actions);
        self.start_next_task(account);
        self.dispatch();
        Ok(true)
    }

    /// Resume a paused task
    ///
    /// A task that already ran resumes right away unless another task of the
    /// same account owns the account's connections (it is active or still
    /// draining its buffer); then it resumes when that task is done. A task
    /// that never ran goes back to the queue.
    ///
    /// # Arguments
    ///
    /// * `id` - Task to resume
    ///
    /// # Returns
    ///
    /// `true` when the task was resumed or its resume was deferred, `false`
    /// when it is not paused.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] for an unknown task.
    pub fn resume_task(&mut self, id: TaskId) -> Result<bool> {
        let task = self.tasks.get(&id).ok_or(Error::TaskNotFound(id))?;
        if task.stm.state() != State::Paused {
            return Ok(false);
        }
        let account = task.account;
        let started = task.stm.is_started();
        let other_active = self
            .tasks
            .values()
            .any(|t| t.id != id && t.account == account && t.owns_account());

        if started && other_active {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.resume_pending = true;
            }
            tracing::debug!(task_id = %id, "resume deferred until the active task is done");
            return Ok(true);
        }

        let mut actions = Vec::new();
        let resumed = self
            .tasks
            .get_mut(&id)
            .is_some_and(|task| task.stm.resume(&mut actions));
        if resumed {
            tracing::info!(task_id = %id, "task resumed");
            self.perform(id, actions);
            if self.started {
                self.start_next_task(account);
                self.dispatch();
            }
        }
        Ok(resumed)
    }

    // ---------------------------------------------------------------------
    // Global switch
    // ---------------------------------------------------------------------

    /// Open connections and start downloading
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        tracing::info!("engine started");
        self.started = true;
        self.shutdown_pending = false;
        self.speed.start();

        let mut accounts: Vec<AccountId> = self.accounts.keys().copied().collect();
        accounts.sort();
        for account in &accounts {
            self.start_account_connections(*account);
        }
        for account in accounts {
            self.start_next_task(account);
        }
        self.dispatch();
    }

    /// Close every connection
    ///
    /// [`Listener::on_shutdown_complete`] fires once every connection has
    /// closed, possibly from this call when none were open.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        tracing::info!(connections = self.conns.len(), "engine stopping");
        self.started = false;
        self.shutdown_pending = true;
        self.speed.end();
        self.close_all_connections();
        self.check_shutdown_complete();
    }

    /// Whether [`start`](Self::start) is in effect
    pub fn is_started(&self) -> bool {
        self.started
    }

    // ---------------------------------------------------------------------
    // Event processing
    // ---------------------------------------------------------------------

    /// Apply every queued message without blocking
    ///
    /// Returns true while connection actions or pool jobs are outstanding.
    pub fn pump(&mut self) -> bool {
        while let Ok(message) = self.inbox.try_recv() {
            match message {
                Message::Connection { conn, event } => self.on_connection_event(conn, event),
                Message::Job(done) => self.on_job_done(done),
            }
        }
        self.has_pending_work()
    }

    fn has_pending_work(&self) -> bool {
        !self.jobs.is_empty()
            || !self.account_tests.is_empty()
            || self.conns.values().any(Conn::is_busy)
    }

    /// Periodic update; call about once a second
    ///
    /// Advances task runtimes and ETAs, samples transfer rates and replaces
    /// connections that failed long enough ago.
    pub fn tick(&mut self) {
        for task in self.tasks.values_mut() {
            task.tick();
        }
        let bytes = std::mem::take(&mut self.tick_bytes);
        if self.started {
            self.speed.submit(bytes);
        }
        self.tick_connections();

        if self.started {
            let mut accounts: Vec<AccountId> = self.accounts.keys().copied().collect();
            accounts.sort();
            for account in accounts {
                self.start_account_connections(account);
            }
            self.dispatch();
        }
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Snapshots of every task in scheduling order
    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.task_order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .map(Task::info)
            .collect()
    }

    /// Snapshot of one task
    pub fn task(&self, id: TaskId) -> Option<TaskInfo> {
        self.tasks.get(&id).map(Task::info)
    }

    /// Snapshots of every batch
    pub fn batches(&self) -> Vec<BatchInfo> {
        let mut batches: Vec<BatchInfo> = self.batches.values().map(Batch::info).collect();
        batches.sort_by_key(|b| b.id);
        batches
    }

    /// Snapshots of every connection, ordered by id
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut conns: Vec<ConnectionInfo> = self.conns.values().map(Conn::info).collect();
        conns.sort_by_key(|c| c.id);
        conns
    }

    /// Smoothed download rate over all connections, bytes per second
    pub fn total_speed(&self) -> f64 {
        self.speed.bps()
    }

    /// Bytes received but not yet written, over all tasks
    pub fn bytes_queued(&self) -> u64 {
        self.tasks.values().map(|t| t.stm.buffered_bytes()).sum()
    }

    /// Bytes received since the engine was created
    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded
    }

    /// Tasks that are neither complete nor killed
    pub fn num_pending_tasks(&self) -> usize {
        self.tasks.values().filter(|t| !t.is_done()).count()
    }

    // ---------------------------------------------------------------------
    // Scheduling
    // ---------------------------------------------------------------------

    /// Make sure the account has an active task
    ///
    /// Returns the active task, starting the first queued one (or a paused
    /// one waiting to resume) when none is active.
    fn start_next_task(&mut self, account: AccountId) -> Option<TaskId> {
        let candidates: Vec<&Task> = self
            .task_order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|t| t.account == account)
            .collect();
        if let Some(active) = candidates.iter().find(|t| t.stm.is_active()) {
            return Some(active.id);
        }
        if !self.started || candidates.iter().any(|t| t.owns_account()) {
            return None;
        }
        let next = candidates.iter().find(|t| {
            t.stm.state() == State::Queued || (t.stm.state() == State::Paused && t.resume_pending)
        })?;
        let id = next.id;

        let mut actions = Vec::new();
        let task = self.tasks.get_mut(&id)?;
        let changed = if task.resume_pending {
            task.resume_pending = false;
            task.stm.resume(&mut actions)
        } else {
            task.stm.start(&mut actions)
        };
        if !changed {
            return None;
        }
        tracing::info!(task_id = %id, account_id = %account, "task started");
        self.perform(id, actions);
        Some(id)
    }

    /// Carry out the actions a task transition emitted
    fn perform(&mut self, id: TaskId, actions: Vec<TaskAction>) {
        for action in actions {
            tracing::trace!(task_id = %id, action = ?action, "task action");
            match action {
                TaskAction::Prepare => self.prepare_task(id),
                TaskAction::RunCmdList => {
                    if let Some(task) = self.tasks.get_mut(&id) {
                        task.run_cmds = true;
                    }
                }
                TaskAction::StopCmdList => self.stop_cmdlists(id),
                TaskAction::Flush => self.submit_flush(id),
                TaskAction::Cancel => self.submit_cancel(id),
                TaskAction::Finalize => self.submit_finalize(id),
            }
        }
    }

    fn prepare_task(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        let expected = task.pending.len() + task.fill_pending.len();
        task.stm.prepare(expected);
        if expected == 0 {
            self.submit_finalize(id);
        }
    }

    fn stop_cmdlists(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.run_cmds = false;
        }
        for tag in self.cmdlists.values().filter(|tag| tag.task == id) {
            tag.stop.cancel();
        }
    }

    fn check_all_complete(&mut self) {
        if self.all_complete_reported || (self.tasks.is_empty() && self.batches.is_empty()) {
            return;
        }
        if self.num_pending_tasks() == 0 {
            self.all_complete_reported = true;
            tracing::info!("all tasks complete");
            self.listener.on_all_complete();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for conn in self.conns.values() {
            conn.cancel();
        }
        for test in self.account_tests.values() {
            test.handle.cancel();
        }
        self.pool.shutdown();
    }
}
