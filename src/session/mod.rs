//! NNTP session negotiation and reply classification
//!
//! A session is sans-io: it never touches a socket. The connection feeds it
//! framed [`Response`]s and carries out the [`Step`] it returns. Negotiation is
//! a tagged enum advanced by [`advance`]:
//!
//! ```text
//! Welcome -> Capabilities -> [ModeReader] -> Ready
//!                 \______________\___ 480 ___> AwaitCredentials -> AuthUser -> [AuthPass] -> (resume)
//! ```
//!
//! Data commands (GROUP, BODY) are classified with [`classify_group`] and
//! [`classify_body`]; a 480 reply there re-enters the authentication states
//! through [`Session::begin_auth`].

/// Response framing and dot-stuffing
pub mod buffer;

pub use buffer::{Response, ResponseBuffer};

use crate::error::{ConnectionError, ConnectionErrorKind};
use crate::types::ContentStatus;

/// Group selected by the keep-alive ping; it does not need to exist
pub const PING_GROUP: &str = "keeps.me.alive";

/// NNTP command issued by a connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// `CAPABILITIES`
    Capabilities,
    /// `MODE READER`
    ModeReader,
    /// `AUTHINFO USER <name>`
    AuthUser(String),
    /// `AUTHINFO PASS <password>`
    AuthPass(String),
    /// `GROUP <name>`
    Group(String),
    /// `BODY <message-id or number>`
    Body(String),
    /// `QUIT`
    Quit,
}

impl Command {
    /// Wire form including the trailing CRLF
    pub fn to_wire(&self) -> String {
        match self {
            Command::Capabilities => "CAPABILITIES\r\n".to_string(),
            Command::ModeReader => "MODE READER\r\n".to_string(),
            Command::AuthUser(user) => format!("AUTHINFO USER {user}\r\n"),
            Command::AuthPass(pass) => format!("AUTHINFO PASS {pass}\r\n"),
            Command::Group(group) => format!("GROUP {group}\r\n"),
            Command::Body(article) => format!("BODY {}\r\n", article_ref(article)),
            Command::Quit => "QUIT\r\n".to_string(),
        }
    }

    /// Whether a reply with `code` carries a multi-line body
    pub fn expects_body(&self, code: u16) -> bool {
        matches!(
            (self, code),
            (Command::Capabilities, 101) | (Command::Body(_), 222)
        )
    }
}

impl std::fmt::Display for Command {
    /// Log-safe form; the password is masked
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::AuthPass(_) => write!(f, "AUTHINFO PASS ****"),
            other => write!(f, "{}", other.to_wire().trim_end()),
        }
    }
}

/// Format an article reference for BODY
///
/// Article numbers are sent as-is; anything else is a message id and gets
/// angle brackets when it does not already have them.
pub fn article_ref(article: &str) -> String {
    if article.bytes().all(|b| b.is_ascii_digit()) || article.starts_with('<') {
        article.to_string()
    } else {
        format!("<{article}>")
    }
}

/// Server capabilities learned from `CAPABILITIES`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Server wants `MODE READER` before reading commands
    pub mode_reader: bool,
    /// Server is already in reader mode
    pub reader: bool,
    /// Server supports `COMPRESS GZIP`
    pub compress_gzip: bool,
    /// Raw capability lines
    pub lines: Vec<String>,
}

impl Capabilities {
    /// Parse a capabilities body
    pub fn parse(body: &[u8]) -> Self {
        let text = String::from_utf8_lossy(body);
        let mut caps = Capabilities::default();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let upper = line.to_ascii_uppercase();
            let mut words = upper.split_whitespace();
            match words.next() {
                Some("MODE-READER") => caps.mode_reader = true,
                Some("READER") => caps.reader = true,
                Some("COMPRESS") => {
                    if words.any(|w| w == "GZIP") {
                        caps.compress_gzip = true;
                    }
                }
                _ => {}
            }
            caps.lines.push(line.to_string());
        }
        caps
    }
}

/// Negotiation state
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Negotiation {
    /// Waiting for the server greeting
    Welcome,
    /// `CAPABILITIES` sent
    Capabilities,
    /// `MODE READER` sent
    ModeReader,
    /// Server asked for authentication; credentials not supplied yet
    AwaitCredentials {
        /// Command to re-issue once authenticated (None = caller re-issues)
        resume: Option<Command>,
    },
    /// `AUTHINFO USER` sent
    AuthUser {
        /// Password to send if the server asks for it
        password: String,
        /// Command to re-issue once authenticated
        resume: Option<Command>,
    },
    /// `AUTHINFO PASS` sent
    AuthPass {
        /// Command to re-issue once authenticated
        resume: Option<Command>,
    },
    /// Ready for data commands
    Ready,
    /// Negotiation failed; the connection must be dropped
    Failed,
}

/// What the connection must do next
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// Send the command and feed its response back
    Send(Command),
    /// Obtain credentials and call [`Session::credentials`]
    NeedCredentials,
    /// Negotiation or authentication finished
    Done,
    /// Fatal failure
    Fail(ConnectionError),
}

/// Advance the negotiation by one response
pub fn advance(state: Negotiation, response: &Response) -> (Negotiation, Step) {
    let code = response.code;
    if code == 502 && !matches!(state, Negotiation::Ready) {
        return fail(ConnectionError::new(
            ConnectionErrorKind::PermissionDenied,
            format!("{code} {}", response.text),
        ));
    }

    match state {
        Negotiation::Welcome => match code {
            200 | 201 => (Negotiation::Capabilities, Step::Send(Command::Capabilities)),
            400 => fail(ConnectionError::new(
                ConnectionErrorKind::Refused,
                format!("service unavailable: {}", response.text),
            )),
            _ => fail(unexpected("greeting", response)),
        },
        Negotiation::Capabilities => match code {
            101 => {
                let caps = Capabilities::parse(response.body.as_deref().unwrap_or_default());
                if caps.mode_reader {
                    (Negotiation::ModeReader, Step::Send(Command::ModeReader))
                } else {
                    (Negotiation::Ready, Step::Done)
                }
            }
            480 => await_credentials(Some(Command::Capabilities)),
            // servers without CAPABILITIES support are used as they are
            _ => (Negotiation::Ready, Step::Done),
        },
        Negotiation::ModeReader => match code {
            200 | 201 => (Negotiation::Ready, Step::Done),
            480 => await_credentials(Some(Command::ModeReader)),
            _ => fail(unexpected("MODE READER", response)),
        },
        Negotiation::AuthUser { password, resume } => match code {
            281 => resume_after_auth(resume),
            381 => (
                Negotiation::AuthPass { resume },
                Step::Send(Command::AuthPass(password)),
            ),
            481 | 482 => fail(rejected(response)),
            _ => fail(unexpected("AUTHINFO USER", response)),
        },
        Negotiation::AuthPass { resume } => match code {
            281 => resume_after_auth(resume),
            481 | 482 => fail(rejected(response)),
            _ => fail(unexpected("AUTHINFO PASS", response)),
        },
        state @ (Negotiation::AwaitCredentials { .. } | Negotiation::Ready) => {
            (state, Step::Fail(unexpected("idle session", response)))
        }
        Negotiation::Failed => (Negotiation::Failed, Step::Fail(unexpected("failed session", response))),
    }
}

fn fail(err: ConnectionError) -> (Negotiation, Step) {
    (Negotiation::Failed, Step::Fail(err))
}

fn await_credentials(resume: Option<Command>) -> (Negotiation, Step) {
    (Negotiation::AwaitCredentials { resume }, Step::NeedCredentials)
}

fn resume_after_auth(resume: Option<Command>) -> (Negotiation, Step) {
    match resume {
        Some(Command::Capabilities) => (Negotiation::Capabilities, Step::Send(Command::Capabilities)),
        Some(Command::ModeReader) => (Negotiation::ModeReader, Step::Send(Command::ModeReader)),
        _ => (Negotiation::Ready, Step::Done),
    }
}

fn rejected(response: &Response) -> ConnectionError {
    ConnectionError::new(
        ConnectionErrorKind::AuthenticationFailed,
        format!("{} {}", response.code, response.text),
    )
}

fn unexpected(context: &str, response: &Response) -> ConnectionError {
    ConnectionError::protocol(format!(
        "unexpected reply to {context}: {} {}",
        response.code, response.text
    ))
}

/// Per-connection negotiation driver
#[derive(Debug)]
pub struct Session {
    state: Negotiation,
    caps: Capabilities,
    authenticated: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// New session waiting for the server greeting
    pub fn new() -> Self {
        Self {
            state: Negotiation::Welcome,
            caps: Capabilities::default(),
            authenticated: false,
        }
    }

    /// Current negotiation state
    pub fn state(&self) -> &Negotiation {
        &self.state
    }

    /// Capabilities reported by the server (empty until negotiated)
    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    /// Whether data commands may be issued
    pub fn is_ready(&self) -> bool {
        self.state == Negotiation::Ready
    }

    /// Whether the server accepted our credentials
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Feed one response
    pub fn on_response(&mut self, response: &Response) -> Step {
        if self.state == Negotiation::Capabilities && response.code == 101 {
            self.caps = Capabilities::parse(response.body.as_deref().unwrap_or_default());
        }
        if matches!(self.state, Negotiation::AuthUser { .. } | Negotiation::AuthPass { .. })
            && response.code == 281
        {
            self.authenticated = true;
        }
        let state = std::mem::replace(&mut self.state, Negotiation::Failed);
        let (next, step) = advance(state, response);
        self.state = next;
        step
    }

    /// A data command got 480; authenticate before re-issuing it
    pub fn begin_auth(&mut self) -> Step {
        let (next, step) = await_credentials(None);
        self.state = next;
        step
    }

    /// Supply credentials after [`Step::NeedCredentials`]
    ///
    /// Without a username the server's demand cannot be met and the session
    /// fails with an authentication error.
    pub fn credentials(&mut self, username: Option<&str>, password: Option<&str>) -> Step {
        let resume = match std::mem::replace(&mut self.state, Negotiation::Failed) {
            Negotiation::AwaitCredentials { resume } => resume,
            other => {
                self.state = other;
                return Step::Fail(ConnectionError::protocol(
                    "credentials supplied while not authenticating",
                ));
            }
        };
        match username {
            Some(user) => {
                self.state = Negotiation::AuthUser {
                    password: password.unwrap_or_default().to_string(),
                    resume,
                };
                Step::Send(Command::AuthUser(user.to_string()))
            }
            None => Step::Fail(ConnectionError::new(
                ConnectionErrorKind::AuthenticationFailed,
                "server requires authentication but no credentials are configured",
            )),
        }
    }
}

/// Outcome of a data command that did not produce a regular reply
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Interrupt {
    /// Server wants authentication (480)
    AuthRequired,
    /// Fatal failure
    Fail(ConnectionError),
}

/// Reply to `GROUP`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupReply {
    /// Group selected (211)
    Selected,
    /// Group does not exist (411)
    NoSuchGroup,
}

/// Classify a `GROUP` reply
pub fn classify_group(response: &Response) -> Result<GroupReply, Interrupt> {
    match response.code {
        211 => Ok(GroupReply::Selected),
        411 => Ok(GroupReply::NoSuchGroup),
        other => Err(interrupt(other, "GROUP", response)),
    }
}

/// Classify a `BODY` reply
pub fn classify_body(response: &Response) -> Result<ContentStatus, Interrupt> {
    match response.code {
        222 => Ok(ContentStatus::Success),
        420 | 423 | 430 | 451 => {
            if response.text.to_ascii_lowercase().contains("dmca") {
                Ok(ContentStatus::Dmca)
            } else {
                Ok(ContentStatus::Unavailable)
            }
        }
        other => Err(interrupt(other, "BODY", response)),
    }
}

fn interrupt(code: u16, context: &str, response: &Response) -> Interrupt {
    match code {
        480 => Interrupt::AuthRequired,
        502 => Interrupt::Fail(ConnectionError::new(
            ConnectionErrorKind::PermissionDenied,
            format!("{} {}", response.code, response.text),
        )),
        _ => Interrupt::Fail(unexpected(context, response)),
    }
}
