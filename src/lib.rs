//! # usenet-engine
//!
//! Download engine core for Usenet (NNTP) clients.
//!
//! The engine fetches article bodies from one or more provider accounts,
//! decodes them and writes the output files. Parsing NZB files, RSS feeds
//! and post-processing are left to the embedding application, which hands
//! the engine [`FileSpec`]s and receives results through a [`Listener`].
//!
//! ## Design
//!
//! - **Single owner** - all state lives in [`Engine`] and is only changed from
//!   the host's context, inside [`Engine::pump`] and the control methods
//! - **Message passing** - connections and decode workers post messages to a
//!   queue and wake the host through [`Listener::async_notify`]
//! - **One task per account** - each account downloads one file at a time,
//!   spread over all of its connections
//! - **Fill servers** - articles an account cannot provide are retried on a
//!   designated fill account
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio::sync::Notify;
//! use usenet_engine::{Account, AccountId, Engine, FileSpec, Listener, Server, run_with_shutdown};
//!
//! struct Wake(Arc<Notify>);
//!
//! impl Listener for Wake {
//!     fn async_notify(&self) {
//!         self.0.notify_one();
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let wake = Arc::new(Notify::new());
//!     let mut engine = Engine::new(Arc::new(Wake(Arc::clone(&wake))))?;
//!
//!     let mut account = Account::new(AccountId(1), "provider");
//!     account.secure_server = Some(Server::new("news.example.com", 563));
//!     account.max_connections = 10;
//!     engine.set_account(account);
//!
//!     let file = FileSpec::new("file.bin", vec!["part1@example.com".into()])
//!         .with_groups(vec!["alt.binaries.test".into()]);
//!     engine.download(AccountId(1), "/downloads", file)?;
//!     engine.start();
//!
//!     run_with_shutdown(&mut engine, &wake).await?;
//!     engine.save_session("/downloads/session.json")?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Server connections and the NNTP command loop
pub mod connection;
/// Decoding and writing article content
pub mod content;
/// The download engine
pub mod engine;
/// Error types
pub mod error;
/// Engine to host callbacks
pub mod listener;
/// NNTP protocol negotiation and response framing
pub mod session;
/// Persisted download sessions
pub mod session_file;
/// Transfer rate measurement and ETA estimation
pub mod speedometer;
/// Task state machine
pub mod task_state;
/// Worker pool for decode and write jobs
pub mod threadpool;
/// Global bandwidth throttle
pub mod throttle;
/// Core identifier and status types
pub mod types;
/// Utility functions
pub mod utils;

use std::time::Duration;

// Re-export commonly used types
pub use config::{Account, ConnectionConfig, EngineConfig, Server, Settings};
pub use connection::{ConnectionState, Connector, TcpConnector};
pub use engine::{BatchInfo, ConnectionInfo, Engine, EngineBuilder, FileSpec, TaskInfo};
pub use error::{ConnectionError, ConnectionErrorKind, Error, JobError, Result};
pub use listener::{
    BatchResult, ErrorKind, ErrorReport, ErrorResource, FileResult, Listener, NullListener,
};
pub use session_file::SessionFile;
pub use task_state::State;
pub use types::{
    AccountId, BatchId, CmdListId, ConnectionId, ContentStatus, FileStatus, TaskErrors, TaskId,
};

/// Drive the engine until a termination signal arrives, then stop it.
///
/// The engine is pumped whenever `wake` is notified and ticked once a
/// second. The host's [`Listener::async_notify`] should call
/// `wake.notify_one()`. After the signal every connection is closed and the
/// queue is drained before returning.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(engine: &mut Engine, wake: &tokio::sync::Notify) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let signal = wait_for_signal();
    tokio::pin!(signal);

    loop {
        tokio::select! {
            _ = &mut signal => break,
            _ = wake.notified() => {
                engine.pump();
            }
            _ = ticker.tick() => {
                engine.pump();
                engine.tick();
            }
        }
    }

    tracing::info!("shutting down engine");
    engine.stop();
    while engine.pump() {
        tokio::select! {
            _ = wake.notified() => {}
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
