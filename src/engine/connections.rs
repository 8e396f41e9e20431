//! Connection bookkeeping: spawning, replacing, assigning work and applying
//! connection events

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::Engine;
use super::message::CmdListTag;
use crate::config::Account;
use crate::connection::{
    CmdList, ConnectionContext, ConnectionEvent, ConnectionHandle, ConnectionState, Credentials,
    HostDetails,
};
use crate::error::{ConnectionError, Error, Result};
use crate::listener::{ErrorKind, ErrorReport, ErrorResource};
use crate::speedometer::Speedometer;
use crate::types::{AccountId, CmdListId, ConnectionId, ContentStatus, TaskId};

/// Snapshot of a connection for the host
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Connection id
    pub id: ConnectionId,
    /// Owning account
    pub account: AccountId,
    /// Task whose command list is executing
    pub task: Option<TaskId>,
    /// Lifecycle state
    pub state: ConnectionState,
    /// Last error, while in the error state
    pub error: Option<ConnectionError>,
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Uses TLS
    pub secure: bool,
    /// Bytes received over this connection
    pub bytes_downloaded: u64,
    /// Smoothed receive rate
    pub bps: f64,
    /// Human readable summary
    pub description: String,
}

#[derive(Debug)]
pub(crate) struct Conn {
    pub id: ConnectionId,
    pub account: AccountId,
    pub details: HostDetails,
    /// None once the connection task has ended
    pub handle: Option<ConnectionHandle>,
    pub state: ConnectionState,
    pub task: Option<TaskId>,
    pub cmdlist: Option<CmdListId>,
    pub error: Option<ConnectionError>,
    pub error_ticks: u32,
    /// The engine asked the connection to close
    pub closing: bool,
    /// Added by [`Engine::clone_connection`]; not counted against
    /// `max_connections` and never replaced
    pub extra: bool,
    pub bytes: u64,
    pub tick_bytes: u64,
    pub speed: Speedometer,
}

impl Conn {
    pub(crate) fn cancel(&self) {
        if let Some(handle) = &self.handle {
            handle.cancel();
        }
    }

    /// Connecting, executing or closing
    pub(crate) fn is_busy(&self) -> bool {
        self.handle.is_some() && (self.closing || self.state != ConnectionState::Connected)
    }

    fn is_idle(&self) -> bool {
        self.handle.is_some()
            && !self.closing
            && self.state == ConnectionState::Connected
            && self.cmdlist.is_none()
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        let description = format!(
            "{}:{}{}",
            self.details.host,
            self.details.port,
            if self.details.secure { " (ssl)" } else { "" }
        );
        ConnectionInfo {
            id: self.id,
            account: self.account,
            task: self.task,
            state: self.state,
            error: self.error.clone(),
            host: self.details.host.clone(),
            port: self.details.port,
            secure: self.details.secure,
            bytes_downloaded: self.bytes,
            bps: self.speed.bps(),
            description,
        }
    }
}

/// Connection opened by [`Engine::try_account`]
#[derive(Debug)]
pub(crate) struct AccountTest {
    pub account: Account,
    pub handle: ConnectionHandle,
    pub reported: bool,
}

impl Engine {
    /// Bring the account's connection count to `max_connections`
    pub(super) fn start_account_connections(&mut self, account: AccountId) {
        if !self.started {
            return;
        }
        let Some(acc) = self.accounts.get(&account) else {
            return;
        };
        let Some((server, secure)) = acc.endpoint(self.settings.prefer_secure) else {
            tracing::debug!(account_id = %account, "account has no enabled server");
            return;
        };
        let details = HostDetails {
            account,
            host: server.host.clone(),
            port: server.port,
            secure,
            pipelining: acc.enable_pipelining,
            compression: acc.enable_compression,
            authenticate: false,
        };
        let max = acc.max_connections;

        let mut open: Vec<&Conn> = self
            .conns
            .values()
            .filter(|c| c.account == account && !c.extra && !c.closing)
            .collect();
        let closing = self
            .conns
            .values()
            .filter(|c| c.account == account && !c.extra && c.closing)
            .count();

        if open.len() > max {
            // idle and failed connections go first, newest before oldest
            open.sort_by_key(|c| (c.cmdlist.is_some(), std::cmp::Reverse(c.id)));
            let surplus: Vec<ConnectionId> =
                open.iter().take(open.len() - max).map(|c| c.id).collect();
            tracing::info!(account_id = %account, count = surplus.len(), "closing surplus connections");
            for id in surplus {
                self.close_connection(id);
            }
            return;
        }

        let missing = max.saturating_sub(open.len() + closing);
        for _ in 0..missing {
            self.add_connection(details.clone(), false);
        }
    }

    fn spawn_handle(&mut self, details: HostDetails) -> (ConnectionId, ConnectionHandle) {
        let id = ConnectionId(self.next_conn);
        self.next_conn += 1;
        let context = ConnectionContext {
            connector: Arc::clone(&self.connector),
            throttle: self.throttle.clone(),
            sink: Arc::new(self.mailbox.clone()),
            config: self.config.connection.clone(),
        };
        tracing::debug!(conn_id = %id, account_id = %details.account, host = %details.host, port = details.port, "spawning connection");
        let handle = ConnectionHandle::spawn(id, details, context, &self.runtime);
        (id, handle)
    }

    fn add_connection(&mut self, details: HostDetails, extra: bool) -> ConnectionId {
        let account = details.account;
        let (id, handle) = self.spawn_handle(details.clone());
        self.conns.insert(
            id,
            Conn {
                id,
                account,
                details,
                handle: Some(handle),
                state: ConnectionState::Disconnected,
                task: None,
                cmdlist: None,
                error: None,
                error_ticks: 0,
                closing: false,
                extra,
                bytes: 0,
                tick_bytes: 0,
                speed: Speedometer::new(),
            },
        );
        id
    }

    /// Close one connection
    ///
    /// Articles it was fetching go back to their task. While the engine is
    /// started, the next [`tick`](Self::tick) opens a replacement when the
    /// account drops below `max_connections`; connections added by
    /// [`clone_connection`](Self::clone_connection) are not replaced.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionNotFound`] for an unknown connection.
    pub fn kill_connection(&mut self, id: ConnectionId) -> Result<()> {
        if !self.conns.contains_key(&id) {
            return Err(Error::ConnectionNotFound(id));
        }
        tracing::info!(conn_id = %id, "connection killed");
        self.close_connection(id);
        self.check_shutdown_complete();
        Ok(())
    }

    /// Open one more connection to the same server as `id`
    ///
    /// The copy comes on top of the account's `max_connections` and lives
    /// until it fails or is killed.
    ///
    /// # Returns
    ///
    /// The id of the new connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionNotFound`] for an unknown connection and
    /// [`Error::InvalidState`] while the engine is stopped.
    pub fn clone_connection(&mut self, id: ConnectionId) -> Result<ConnectionId> {
        let details = self
            .conns
            .get(&id)
            .map(|c| c.details.clone())
            .ok_or(Error::ConnectionNotFound(id))?;
        if !self.started {
            return Err(Error::InvalidState(
                "connections can only be cloned while started".to_string(),
            ));
        }
        let clone = self.add_connection(details, true);
        tracing::info!(conn_id = %id, clone = %clone, "connection cloned");
        Ok(clone)
    }

    /// Check that an account can connect and log in
    ///
    /// A separate connection is opened to the account's server and closed
    /// again as soon as it is ready. When the account has a username it logs
    /// in right away, so wrong credentials are caught even on servers that
    /// only ask for them later. The result arrives through
    /// [`Listener::on_account_test`](crate::Listener::on_account_test) from
    /// [`pump`](Self::pump). The account does not need to be configured with
    /// [`set_account`](Self::set_account) and the engine does not need to be
    /// started.
    ///
    /// # Arguments
    ///
    /// * `account` - Account to try; its own credentials are used
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] when the account has no enabled
    /// server.
    pub fn try_account(&mut self, account: &Account) -> Result<()> {
        let Some((server, secure)) = account.endpoint(self.settings.prefer_secure) else {
            return Err(Error::InvalidState(format!(
                "account {} has no enabled server",
                account.id
            )));
        };
        let details = HostDetails {
            account: account.id,
            host: server.host.clone(),
            port: server.port,
            secure,
            pipelining: account.enable_pipelining,
            compression: account.enable_compression,
            authenticate: account.username.is_some(),
        };
        let (id, handle) = self.spawn_handle(details);
        tracing::info!(conn_id = %id, account_id = %account.id, "testing account");
        self.account_tests.insert(
            id,
            AccountTest {
                account: account.clone(),
                handle,
                reported: false,
            },
        );
        Ok(())
    }

    fn on_account_test_event(&mut self, conn_id: ConnectionId, event: ConnectionEvent) {
        let Some(test) = self.account_tests.get_mut(&conn_id) else {
            return;
        };
        let account = test.account.id;
        let result = match event {
            ConnectionEvent::AuthRequest { reply, .. } => {
                let credentials = Credentials {
                    username: test.account.username.clone(),
                    password: test.account.password.clone(),
                };
                if reply.send(credentials).is_err() {
                    tracing::debug!(conn_id = %conn_id, "test connection gone before credentials arrived");
                }
                return;
            }
            ConnectionEvent::Ready => {
                test.handle.cancel();
                Ok(())
            }
            ConnectionEvent::Error(error) => Err(error),
            ConnectionEvent::Closed { .. } => {
                let reported = test.reported;
                self.account_tests.remove(&conn_id);
                if reported {
                    return;
                }
                Err(ConnectionError::network("connection closed before it was ready"))
            }
            _ => return,
        };
        if let Some(test) = self.account_tests.get_mut(&conn_id) {
            if test.reported {
                return;
            }
            test.reported = true;
        }
        match &result {
            Ok(()) => tracing::info!(account_id = %account, "account test succeeded"),
            Err(e) => tracing::info!(account_id = %account, error = %e, "account test failed"),
        }
        self.listener.on_account_test(account, result);
    }

    /// Cancel a connection, or forget it when its task already ended
    fn close_connection(&mut self, id: ConnectionId) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if conn.handle.is_some() {
            conn.closing = true;
            conn.cancel();
        } else {
            self.conns.remove(&id);
        }
    }

    pub(super) fn close_account_connections(&mut self, account: AccountId) {
        let ids: Vec<ConnectionId> = self
            .conns
            .values()
            .filter(|c| c.account == account)
            .map(|c| c.id)
            .collect();
        for id in ids {
            self.close_connection(id);
        }
    }

    pub(super) fn close_all_connections(&mut self) {
        let ids: Vec<ConnectionId> = self.conns.keys().copied().collect();
        for id in ids {
            self.close_connection(id);
        }
    }

    /// Forget connections that failed authentication so they get replaced
    pub(super) fn restart_auth_failed(&mut self, account: AccountId) {
        let failed: Vec<ConnectionId> = self
            .conns
            .values()
            .filter(|c| c.account == account && c.handle.is_none())
            .filter(|c| c.error.as_ref().is_some_and(|e| !e.kind.allows_reconnect()))
            .map(|c| c.id)
            .collect();
        if !failed.is_empty() {
            tracing::info!(account_id = %account, count = failed.len(), "credentials changed; restarting connections");
        }
        for id in failed {
            self.conns.remove(&id);
        }
    }

    /// Sample rates and drop failed connections whose wait is over
    pub(super) fn tick_connections(&mut self) {
        let reconnect_after = self.config.reconnect_after_ticks;
        let mut expired = Vec::new();
        for conn in self.conns.values_mut() {
            if conn.handle.is_some() {
                let bytes = std::mem::take(&mut conn.tick_bytes);
                conn.speed.submit(bytes);
                continue;
            }
            let Some(error) = &conn.error else {
                continue;
            };
            if !error.kind.allows_reconnect() {
                continue;
            }
            conn.error_ticks += 1;
            if conn.error_ticks >= reconnect_after {
                expired.push(conn.id);
            }
        }
        for id in expired {
            tracing::debug!(conn_id = %id, "replacing failed connection");
            self.conns.remove(&id);
        }
    }

    /// Hand work to every idle connection
    pub(super) fn dispatch(&mut self) {
        if !self.started {
            return;
        }
        let mut idle: Vec<ConnectionId> = self
            .conns
            .values()
            .filter(|c| c.is_idle())
            .map(|c| c.id)
            .collect();
        idle.sort();
        for id in idle {
            self.assign(id);
        }
    }

    /// Give the connection a command list; false when there is no work
    fn assign(&mut self, conn_id: ConnectionId) -> bool {
        let Some(account) = self.conns.get(&conn_id).map(|c| c.account) else {
            return false;
        };

        if self.fill_account() == Some(account) {
            let fill_task = self.task_order.iter().copied().find(|id| {
                self.tasks.get(id).is_some_and(|t| {
                    t.account != account && t.run_cmds && !t.fill_pending.is_empty()
                })
            });
            if let Some(task) = fill_task {
                return self.hand_out(conn_id, task, true);
            }
        }

        let mut started_next = false;
        loop {
            let task = self.task_order.iter().copied().find(|id| {
                self.tasks.get(id).is_some_and(|t| {
                    t.account == account
                        && t.stm.is_active()
                        && t.run_cmds
                        && !t.pending.is_empty()
                })
            });
            if let Some(task) = task {
                return self.hand_out(conn_id, task, false);
            }
            if started_next || self.start_next_task(account).is_none() {
                return false;
            }
            started_next = true;
        }
    }

    fn hand_out(&mut self, conn_id: ConnectionId, task_id: TaskId, fill: bool) -> bool {
        let per_list = self.config.articles_per_cmdlist;
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return false;
        };
        let source = if fill {
            &mut task.fill_pending
        } else {
            &mut task.pending
        };
        let take = per_list.min(source.len());
        let articles: Vec<String> = source.drain(..take).collect();
        let groups = task.groups.clone();

        let id = CmdListId(self.next_cmdlist);
        self.next_cmdlist += 1;
        let stop = CancellationToken::new();
        let list = CmdList {
            id,
            task: task_id,
            groups,
            articles: articles.clone(),
            stop: stop.clone(),
        };

        let Some(conn) = self.conns.get_mut(&conn_id) else {
            self.requeue(task_id, list.articles, fill);
            return false;
        };
        let Some(handle) = &conn.handle else {
            self.requeue(task_id, list.articles, fill);
            return false;
        };
        match handle.execute(list) {
            Ok(()) => {
                tracing::debug!(conn_id = %conn_id, task_id = %task_id, cmdlist = %id, articles = take, fill, "command list assigned");
                conn.task = Some(task_id);
                conn.cmdlist = Some(id);
                conn.state = ConnectionState::Active;
                self.cmdlists.insert(
                    id,
                    CmdListTag {
                        task: task_id,
                        conn: conn_id,
                        fill,
                        articles,
                        stop,
                    },
                );
                true
            }
            Err(list) => {
                self.requeue(task_id, list.articles, fill);
                false
            }
        }
    }

    /// Put articles back in front of the task's queue, keeping their order
    pub(super) fn requeue(&mut self, task_id: TaskId, articles: Vec<String>, fill: bool) {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        let target = if fill {
            &mut task.fill_pending
        } else {
            &mut task.pending
        };
        for article in articles.into_iter().rev() {
            target.push_front(article);
        }
    }

    pub(super) fn on_connection_event(&mut self, conn_id: ConnectionId, event: ConnectionEvent) {
        if self.account_tests.contains_key(&conn_id) {
            self.on_account_test_event(conn_id, event);
            return;
        }
        if !self.conns.contains_key(&conn_id) {
            tracing::debug!(conn_id = %conn_id, "event for unknown connection ignored");
            if let ConnectionEvent::CmdListDone {
                cmdlist,
                task,
                unanswered,
                ..
            } = event
            {
                self.finish_cmdlist(cmdlist, task, unanswered, false);
            }
            return;
        }

        match event {
            ConnectionEvent::State(state) => {
                if let Some(conn) = self.conns.get_mut(&conn_id) {
                    conn.state = state;
                }
            }
            ConnectionEvent::Ready => {
                if let Some(conn) = self.conns.get_mut(&conn_id) {
                    conn.state = ConnectionState::Connected;
                    conn.error = None;
                    conn.speed.start();
                }
                if self.started {
                    self.assign(conn_id);
                }
            }
            ConnectionEvent::AuthRequest { account, reply } => {
                let credentials = self
                    .accounts
                    .get(&account)
                    .map(|a| Credentials {
                        username: a.username.clone(),
                        password: a.password.clone(),
                    })
                    .unwrap_or_default();
                tracing::debug!(conn_id = %conn_id, account_id = %account, "answering credential request");
                if reply.send(credentials).is_err() {
                    tracing::debug!(conn_id = %conn_id, "connection gone before credentials arrived");
                }
            }
            ConnectionEvent::Body {
                cmdlist,
                task,
                article,
                status,
                data,
            } => {
                let bytes = data.len() as u64;
                let mut account = None;
                if let Some(conn) = self.conns.get_mut(&conn_id) {
                    conn.bytes += bytes;
                    conn.tick_bytes += bytes;
                    account = Some(conn.account);
                }
                self.tick_bytes += bytes;
                self.bytes_downloaded += bytes;
                if let Some(account) = account.filter(|_| bytes > 0) {
                    self.listener.on_quota(account, bytes);
                }
                let fill = match self.cmdlists.get_mut(&cmdlist) {
                    Some(tag) => {
                        if let Some(pos) = tag.articles.iter().position(|a| *a == article) {
                            tag.articles.remove(pos);
                        }
                        tag.fill
                    }
                    None => false,
                };
                self.on_body(task, article, status, data, fill);
            }
            ConnectionEvent::CmdListDone {
                cmdlist,
                task,
                unanswered,
                no_group,
            } => {
                if let Some(conn) = self.conns.get_mut(&conn_id) {
                    conn.task = None;
                    conn.cmdlist = None;
                    if conn.state == ConnectionState::Active {
                        conn.state = ConnectionState::Connected;
                    }
                }
                self.finish_cmdlist(cmdlist, task, unanswered, no_group);
                if self.started {
                    if let Some(conn) = self.conns.get(&conn_id) {
                        if conn.is_idle() {
                            self.assign(conn_id);
                        }
                    }
                }
            }
            ConnectionEvent::Error(error) => {
                tracing::warn!(conn_id = %conn_id, error = %error, "connection error");
                let closing = self.conns.get(&conn_id).is_some_and(|c| c.closing);
                if let Some(conn) = self.conns.get_mut(&conn_id) {
                    conn.state = ConnectionState::Error;
                    conn.error = Some(error.clone());
                    conn.error_ticks = 0;
                }
                if !closing {
                    self.listener.on_error(ErrorReport {
                        resource: ErrorResource::Connection(conn_id),
                        what: error.message.clone(),
                        kind: ErrorKind::Connection(error.kind),
                    });
                }
            }
            ConnectionEvent::Closed { cancelled } => self.on_connection_closed(conn_id, cancelled),
        }
    }

    /// Return unanswered articles to their task, or count them as missing
    /// when no candidate group exists
    fn finish_cmdlist(
        &mut self,
        cmdlist: CmdListId,
        task: TaskId,
        unanswered: Vec<String>,
        no_group: bool,
    ) {
        let fill = self
            .cmdlists
            .remove(&cmdlist)
            .is_some_and(|tag| tag.fill);
        if !self.tasks.contains_key(&task) {
            tracing::debug!(task_id = %task, cmdlist = %cmdlist, "command list of erased task");
            return;
        }
        if no_group {
            tracing::info!(task_id = %task, cmdlist = %cmdlist, "no candidate group available");
            for article in unanswered {
                self.on_body(task, article, ContentStatus::Unavailable, Vec::new(), fill);
            }
        } else if !unanswered.is_empty() {
            tracing::debug!(task_id = %task, cmdlist = %cmdlist, count = unanswered.len(), "requeueing unanswered articles");
            self.requeue(task, unanswered, fill);
        }
    }

    fn on_connection_closed(&mut self, conn_id: ConnectionId, cancelled: bool) {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };
        conn.handle = None;
        conn.task = None;
        conn.cmdlist = None;
        let account = conn.account;
        let keep = !cancelled && !conn.closing && conn.error.is_some();
        if keep {
            conn.state = ConnectionState::Error;
            tracing::debug!(conn_id = %conn_id, "connection closed after error");
        } else {
            tracing::debug!(conn_id = %conn_id, cancelled, "connection closed");
            self.conns.remove(&conn_id);
        }

        let live = self
            .conns
            .values()
            .any(|c| c.account == account && c.handle.is_some());
        if !live {
            let active: Vec<TaskId> = self
                .tasks
                .values()
                .filter(|t| t.account == account && t.stm.is_active())
                .map(|t| t.id)
                .collect();
            for id in active {
                if let Some(task) = self.tasks.get_mut(&id) {
                    if task.stm.disrupt() {
                        tracing::debug!(task_id = %id, "task lost its connections");
                    }
                }
            }
        }

        self.check_shutdown_complete();
    }

    pub(super) fn check_shutdown_complete(&mut self) {
        if !self.shutdown_pending {
            return;
        }
        if self.conns.values().any(|c| c.handle.is_some()) {
            return;
        }
        self.shutdown_pending = false;
        self.conns.retain(|_, c| c.handle.is_some());
        tracing::info!("engine shutdown complete");
        self.listener.on_shutdown_complete();
    }
}
