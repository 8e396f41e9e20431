//! One NNTP connection running on its own tokio task
//!
//! A connection is spawned with [`ConnectionHandle::spawn`]. It connects,
//! negotiates the session and then waits for [`CmdList`]s. Everything it
//! learns is reported through an [`EventSink`]; it never retries on its own
//! and never touches engine state.
//!
//! ```text
//! spawn ─> Resolving ─> Connecting ─> Initializing ─> Ready ─┬─> execute cmdlist ─> CmdListDone ─┐
//!                                                            └─────────────<──────────────────────┘
//! any error ─> Error + Closed        cancel ─> QUIT + Closed { cancelled: true }
//! ```

/// Socket establishment, plain and TLS
pub mod connector;

pub use connector::{Connector, NntpStream, TcpConnector};

#[cfg(test)]
pub(crate) mod mock;

use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, ConnectionErrorKind};
use crate::session::{
    Command, GroupReply, Interrupt, PING_GROUP, Response, ResponseBuffer, Session, Step,
    classify_body, classify_group,
};
use crate::throttle::Throttle;
use crate::types::{AccountId, CmdListId, ConnectionId, ContentStatus, TaskId};

/// Time allowed for the server to answer QUIT
const QUIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Where a connection is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Looking up the host
    Resolving,
    /// Opening the socket
    Connecting,
    /// Negotiating the NNTP session
    Initializing,
    /// Ready for a command list
    Connected,
    /// Executing a command list
    Active,
    /// Failed; waiting to be replaced
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Resolving => "resolving",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Initializing => "initializing",
            ConnectionState::Connected => "connected",
            ConnectionState::Active => "active",
            ConnectionState::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Server endpoint and protocol options of one connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostDetails {
    /// Account the connection belongs to
    pub account: AccountId,
    /// Server host name
    pub host: String,
    /// Server port
    pub port: u16,
    /// Wrap the socket in TLS
    pub secure: bool,
    /// Send BODY commands back-to-back
    pub pipelining: bool,
    /// The account allows compressed transfers
    pub compression: bool,
    /// Log in right after negotiation instead of waiting for a 480
    pub authenticate: bool,
}

/// Credentials handed to a connection after it asked for them
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// User name; None means the account has none configured
    pub username: Option<String>,
    /// Password
    pub password: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .finish()
    }
}

/// Articles of one task handed to a connection in one go
#[derive(Clone, Debug)]
pub struct CmdList {
    /// Command list id
    pub id: CmdListId,
    /// Task the articles belong to
    pub task: TaskId,
    /// Candidate groups; the first one the server carries is selected
    pub groups: Vec<String>,
    /// Message ids or article numbers
    pub articles: Vec<String>,
    /// Stops issuing further commands; replies already requested are still read
    pub stop: CancellationToken,
}

/// Something a connection reports to the engine
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Lifecycle progress
    State(ConnectionState),
    /// Negotiation done; the connection can take a command list
    Ready,
    /// The server wants credentials; answer on `reply`
    AuthRequest {
        /// Account whose credentials are needed
        account: AccountId,
        /// Rendezvous channel
        reply: oneshot::Sender<Credentials>,
    },
    /// One article reply
    Body {
        /// Command list the article came from
        cmdlist: CmdListId,
        /// Task the article belongs to
        task: TaskId,
        /// Article reference
        article: String,
        /// Whether the article was delivered
        status: ContentStatus,
        /// Dot-unstuffed body; empty unless `status` is success
        data: Vec<u8>,
    },
    /// A command list finished, fully or partially
    CmdListDone {
        /// Command list id
        cmdlist: CmdListId,
        /// Task the list belonged to
        task: TaskId,
        /// Articles that got no reply, in their original order
        unanswered: Vec<String>,
        /// None of the candidate groups exist on the server
        no_group: bool,
    },
    /// The connection failed
    Error(ConnectionError),
    /// The connection task ended; always the last event
    Closed {
        /// Ended because it was cancelled
        cancelled: bool,
    },
}

/// Receiver of connection events
pub trait EventSink: Send + Sync {
    /// Deliver `event` from connection `conn`
    fn post(&self, conn: ConnectionId, event: ConnectionEvent);
}

/// Shared dependencies every connection is spawned with
#[derive(Clone)]
pub struct ConnectionContext {
    /// Stream factory
    pub connector: Arc<dyn Connector>,
    /// Global bandwidth limit
    pub throttle: Throttle,
    /// Where events go
    pub sink: Arc<dyn EventSink>,
    /// Timeouts and limits
    pub config: ConnectionConfig,
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("throttle", &self.throttle)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Engine-side handle of a spawned connection
#[derive(Debug)]
pub struct ConnectionHandle {
    cancel: CancellationToken,
    commands: mpsc::UnboundedSender<CmdList>,
}

impl ConnectionHandle {
    /// Spawn the connection task on `runtime`
    pub fn spawn(
        id: ConnectionId,
        details: HostDetails,
        context: ConnectionContext,
        runtime: &Handle,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = ConnectionTask {
            id,
            buffer: ResponseBuffer::new(context.config.max_response_size),
            details,
            context,
            session: Session::new(),
            stream: None,
            cancel: cancel.clone(),
            commands: rx,
        };
        runtime.spawn(task.run());
        Self {
            cancel,
            commands: tx,
        }
    }

    /// Hand over a command list; gives it back if the connection is gone
    pub fn execute(&self, list: CmdList) -> Result<(), CmdList> {
        self.commands.send(list).map_err(|e| e.0)
    }

    /// Abort whatever the connection is doing and close it
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Default)]
struct Progress {
    answered: Vec<bool>,
    no_group: bool,
}

struct ConnectionTask {
    id: ConnectionId,
    details: HostDetails,
    context: ConnectionContext,
    session: Session,
    buffer: ResponseBuffer,
    stream: Option<Box<dyn NntpStream>>,
    cancel: CancellationToken,
    commands: mpsc::UnboundedReceiver<CmdList>,
}

impl ConnectionTask {
    fn post(&self, event: ConnectionEvent) {
        self.context.sink.post(self.id, event);
    }

    async fn run(mut self) {
        let cancel = self.cancel.clone();
        let connected = tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.connect() => Some(result),
        };
        match connected {
            None => {
                self.return_queued();
                self.post(ConnectionEvent::Closed { cancelled: true });
                return;
            }
            Some(Err(e)) => {
                tracing::warn!(conn_id = %self.id, host = %self.details.host, error = %e, "connection failed");
                self.post(ConnectionEvent::Error(e));
                self.return_queued();
                self.post(ConnectionEvent::Closed { cancelled: false });
                return;
            }
            Some(Ok(())) => {}
        }

        tracing::info!(conn_id = %self.id, host = %self.details.host, port = self.details.port, secure = self.details.secure, "connection ready");
        self.post(ConnectionEvent::Ready);

        let cancelled = match self.serve().await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                tracing::warn!(conn_id = %self.id, error = %e, "connection lost");
                self.post(ConnectionEvent::Error(e));
                false
            }
        };
        if cancelled {
            self.quit().await;
        }
        self.return_queued();
        self.post(ConnectionEvent::Closed { cancelled });
    }

    /// Hand back command lists that were queued but never started
    fn return_queued(&mut self) {
        self.commands.close();
        while let Ok(list) = self.commands.try_recv() {
            tracing::debug!(conn_id = %self.id, cmdlist = %list.id, "returning unstarted command list");
            self.post(done_event(&list, &Progress::default()));
        }
    }

    async fn connect(&mut self) -> Result<(), ConnectionError> {
        let connect_timeout = self.context.config.connect_timeout;
        let connector = Arc::clone(&self.context.connector);

        self.post(ConnectionEvent::State(ConnectionState::Resolving));
        let addrs = tokio::time::timeout(
            connect_timeout,
            connector.resolve(&self.details.host, self.details.port),
        )
        .await
        .map_err(|_| timeout_error("resolve"))??;

        self.post(ConnectionEvent::State(ConnectionState::Connecting));
        tracing::debug!(conn_id = %self.id, host = %self.details.host, addrs = ?addrs, "connecting");
        let stream = tokio::time::timeout(
            connect_timeout,
            connector.connect(&addrs, &self.details.host, self.details.secure),
        )
        .await
        .map_err(|_| timeout_error("connect"))??;
        self.stream = Some(stream);

        self.post(ConnectionEvent::State(ConnectionState::Initializing));
        let welcome = self.read_response(|_| false).await?;
        let step = self.session.on_response(&welcome);
        self.drive(step).await?;

        if self.details.compression {
            // compressed bodies would need a codec this crate does not carry
            let offered = self.session.capabilities().compress_gzip;
            tracing::debug!(conn_id = %self.id, offered, "compression allowed; fetching bodies uncompressed");
        }
        if self.details.authenticate && !self.session.is_authenticated() {
            tracing::debug!(conn_id = %self.id, "logging in");
            let step = self.session.begin_auth();
            self.drive(step).await?;
        }
        Ok(())
    }

    // Returns Ok(true) when cancelled, Ok(false) when the engine dropped the handle
    async fn serve(&mut self) -> Result<bool, ConnectionError> {
        let cancel = self.cancel.clone();
        let ping_interval = self.context.config.ping_interval;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(true),
                list = self.commands.recv() => list,
                _ = tokio::time::sleep(ping_interval) => {
                    self.ping().await?;
                    continue;
                }
            };
            let Some(list) = next else {
                return Ok(false);
            };

            let mut progress = Progress {
                answered: vec![false; list.articles.len()],
                no_group: false,
            };
            let outcome = tokio::select! {
                _ = cancel.cancelled() => None,
                result = self.execute(&list, &mut progress) => Some(result),
            };
            self.post(done_event(&list, &progress));
            match outcome {
                None => return Ok(true),
                Some(Err(e)) => return Err(e),
                Some(Ok(())) => {}
            }
        }
    }

    async fn execute(&mut self, list: &CmdList, progress: &mut Progress) -> Result<(), ConnectionError> {
        if !list.groups.is_empty() {
            let mut selected = false;
            for group in &list.groups {
                let reply = self.command(Command::Group(group.clone()), classify_group).await?;
                if reply == GroupReply::Selected {
                    selected = true;
                    break;
                }
                tracing::debug!(conn_id = %self.id, group = %group, "group not carried");
            }
            if !selected {
                progress.no_group = true;
                return Ok(());
            }
        }

        if self.details.pipelining {
            self.execute_pipelined(list, progress).await
        } else {
            for (i, article) in list.articles.iter().enumerate() {
                if list.stop.is_cancelled() {
                    break;
                }
                let response = self.command_response(Command::Body(article.clone())).await?;
                self.deliver(list, i, article, &response, progress)?;
            }
            Ok(())
        }
    }

    async fn execute_pipelined(
        &mut self,
        list: &CmdList,
        progress: &mut Progress,
    ) -> Result<(), ConnectionError> {
        if list.stop.is_cancelled() || list.articles.is_empty() {
            return Ok(());
        }
        let commands: Vec<Command> = list
            .articles
            .iter()
            .map(|a| Command::Body(a.clone()))
            .collect();
        let wire: String = commands.iter().map(Command::to_wire).collect();
        tracing::debug!(conn_id = %self.id, cmdlist = %list.id, count = commands.len(), "pipelining BODY commands");
        self.write(wire.as_bytes()).await?;

        for (i, (article, command)) in list.articles.iter().zip(&commands).enumerate() {
            let response = self.read_response(|code| command.expects_body(code)).await?;
            if response.code == 480 {
                return Err(ConnectionError::protocol(
                    "authentication requested during pipelined transfer",
                ));
            }
            self.deliver(list, i, article, &response, progress)?;
        }
        Ok(())
    }

    fn deliver(
        &self,
        list: &CmdList,
        index: usize,
        article: &str,
        response: &Response,
        progress: &mut Progress,
    ) -> Result<(), ConnectionError> {
        let status = match classify_body(response) {
            Ok(status) => status,
            Err(Interrupt::Fail(e)) => return Err(e),
            Err(Interrupt::AuthRequired) => {
                return Err(ConnectionError::new(
                    ConnectionErrorKind::AuthenticationFailed,
                    "server still requires authentication after login",
                ));
            }
        };
        if let Some(slot) = progress.answered.get_mut(index) {
            *slot = true;
        }
        let data = match status {
            ContentStatus::Success => response.body.clone().unwrap_or_default(),
            _ => {
                tracing::debug!(conn_id = %self.id, article = %article, code = response.code, "article missing");
                Vec::new()
            }
        };
        self.post(ConnectionEvent::Body {
            cmdlist: list.id,
            task: list.task,
            article: article.to_string(),
            status,
            data,
        });
        Ok(())
    }

    // Send a command and classify the reply, authenticating on 480 and
    // re-issuing the command once
    async fn command<T>(
        &mut self,
        command: Command,
        classify: fn(&Response) -> Result<T, Interrupt>,
    ) -> Result<T, ConnectionError> {
        let response = self.command_response(command).await?;
        match classify(&response) {
            Ok(value) => Ok(value),
            Err(Interrupt::Fail(e)) => Err(e),
            Err(Interrupt::AuthRequired) => Err(ConnectionError::new(
                ConnectionErrorKind::AuthenticationFailed,
                "server still requires authentication after login",
            )),
        }
    }

    // Send a command and return its reply; a 480 triggers authentication and
    // one re-issue, a second 480 is passed through to the caller
    async fn command_response(&mut self, command: Command) -> Result<Response, ConnectionError> {
        let response = self.roundtrip(&command).await?;
        if response.code != 480 {
            return Ok(response);
        }
        tracing::debug!(conn_id = %self.id, command = %command, "authentication required");
        let step = self.session.begin_auth();
        self.drive(step).await?;
        self.roundtrip(&command).await
    }

    async fn roundtrip(&mut self, command: &Command) -> Result<Response, ConnectionError> {
        tracing::trace!(conn_id = %self.id, command = %command, "sending");
        self.write(command.to_wire().as_bytes()).await?;
        self.read_response(|code| command.expects_body(code)).await
    }

    async fn drive(&mut self, mut step: Step) -> Result<(), ConnectionError> {
        loop {
            step = match step {
                Step::Send(command) => {
                    let response = self.roundtrip(&command).await?;
                    self.session.on_response(&response)
                }
                Step::NeedCredentials => {
                    let credentials = self.request_credentials().await?;
                    self.session.credentials(
                        credentials.username.as_deref(),
                        credentials.password.as_deref(),
                    )
                }
                Step::Done => return Ok(()),
                Step::Fail(e) => return Err(e),
            };
        }
    }

    async fn request_credentials(&mut self) -> Result<Credentials, ConnectionError> {
        let (reply, answer) = oneshot::channel();
        self.post(ConnectionEvent::AuthRequest {
            account: self.details.account,
            reply,
        });
        answer
            .await
            .map_err(|_| ConnectionError::protocol("credential request was not answered"))
    }

    async fn ping(&mut self) -> Result<(), ConnectionError> {
        tracing::trace!(conn_id = %self.id, "keep-alive");
        self.command(Command::Group(PING_GROUP.to_string()), classify_group)
            .await
            .map(|_| ())
    }

    async fn quit(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let sent = tokio::time::timeout(QUIT_TIMEOUT, async {
            stream.write_all(Command::Quit.to_wire().as_bytes()).await?;
            stream.flush().await?;
            stream.shutdown().await
        })
        .await;
        if let Ok(Err(e)) = sent {
            tracing::debug!(conn_id = %self.id, error = %e, "QUIT failed");
        }
        self.stream = None;
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ConnectionError::network("not connected"))?;
        stream
            .write_all(bytes)
            .await
            .map_err(|e| ConnectionError::from_io(&e))?;
        stream.flush().await.map_err(|e| ConnectionError::from_io(&e))
    }

    async fn read_response(
        &mut self,
        multiline: impl Fn(u16) -> bool,
    ) -> Result<Response, ConnectionError> {
        let read_timeout = self.context.config.read_timeout;
        loop {
            if let Some(response) = self.buffer.next_response(&multiline)? {
                return Ok(response);
            }
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| ConnectionError::network("not connected"))?;
            let n = tokio::time::timeout(read_timeout, self.buffer.read_from(stream))
                .await
                .map_err(|_| timeout_error("read"))??;
            if n == 0 {
                return Err(ConnectionError::network("connection closed by server"));
            }
            self.context.throttle.acquire_all(n as u64).await;
        }
    }
}

fn done_event(list: &CmdList, progress: &Progress) -> ConnectionEvent {
    let unanswered = list
        .articles
        .iter()
        .zip(progress.answered.iter().chain(std::iter::repeat(&false)))
        .filter(|(_, answered)| !**answered)
        .map(|(article, _)| article.clone())
        .collect();
    ConnectionEvent::CmdListDone {
        cmdlist: list.id,
        task: list.task,
        unanswered,
        no_group: progress.no_group,
    }
}

fn timeout_error(what: &str) -> ConnectionError {
    ConnectionError::new(ConnectionErrorKind::Timeout, format!("{what} timed out"))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
