//! Error types for usenet-engine
//!
//! The crate-level [`Error`] covers failures of public engine operations.
//! Connection failures carry a [`ConnectionErrorKind`] so the engine can decide
//! whether a replacement connection may be spawned, and processing failures in
//! the thread pool are captured as [`JobError`] values instead of unwinding
//! into the engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::types::{AccountId, BatchId, ConnectionId, TaskId};

/// Result type alias for usenet-engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for usenet-engine
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "max_connections")
        key: Option<String>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Account not configured
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),

    /// Task not known to the engine
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// Batch not known to the engine
    #[error("batch not found: {0}")]
    BatchNotFound(BatchId),

    /// Connection not known to the engine
    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// Operation not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Connection level failure
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Session file could not be read or written
    #[error("session file error at {}: {message}", path.display())]
    SessionFile {
        /// Path of the session file
        path: PathBuf,
        /// What went wrong
        message: String,
    },

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Classification of connection failures
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionErrorKind {
    /// Hostname could not be resolved
    Resolve,
    /// Server refused the TCP connection
    Refused,
    /// Server rejected the credentials
    AuthenticationFailed,
    /// Server denied access to the account (502)
    PermissionDenied,
    /// Unexpected or malformed protocol response
    Protocol,
    /// Socket or TLS failure
    Network,
    /// Server did not answer in time
    Timeout,
}

impl ConnectionErrorKind {
    /// Whether a replacement connection should be spawned after this failure
    ///
    /// Credential and permission failures repeat on every attempt, so they wait
    /// until the account is updated.
    pub fn allows_reconnect(&self) -> bool {
        !matches!(
            self,
            ConnectionErrorKind::AuthenticationFailed | ConnectionErrorKind::PermissionDenied
        )
    }
}

impl std::fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionErrorKind::Resolve => "resolve",
            ConnectionErrorKind::Refused => "refused",
            ConnectionErrorKind::AuthenticationFailed => "authentication failed",
            ConnectionErrorKind::PermissionDenied => "permission denied",
            ConnectionErrorKind::Protocol => "protocol",
            ConnectionErrorKind::Network => "network",
            ConnectionErrorKind::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

/// Connection failure with its kind and a description
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ConnectionError {
    /// Failure category
    pub kind: ConnectionErrorKind,
    /// Human-readable detail
    pub message: String,
}

impl ConnectionError {
    /// Create a new connection error
    pub fn new(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Protocol violation
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ConnectionErrorKind::Protocol, message)
    }

    /// Socket or TLS failure
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ConnectionErrorKind::Network, message)
    }

    /// Classify an I/O error raised while talking to the server
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        let kind = match err.kind() {
            ErrorKind::ConnectionRefused => ConnectionErrorKind::Refused,
            ErrorKind::TimedOut => ConnectionErrorKind::Timeout,
            _ => ConnectionErrorKind::Network,
        };
        Self::new(kind, err.to_string())
    }
}

/// Failure of a unit of work executed on the thread pool
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum JobError {
    /// The job panicked; the payload message is captured
    #[error("job panicked: {0}")]
    Panicked(String),

    /// Writing the output failed
    #[error("write failed for {}: {message}", path.display())]
    Write {
        /// Output path
        path: PathBuf,
        /// I/O error message
        message: String,
    },

    /// Creating the output directory or file failed
    #[error("cannot create {}: {message}", path.display())]
    Create {
        /// Output path
        path: PathBuf,
        /// I/O error message
        message: String,
    },
}
