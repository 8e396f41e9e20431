//! Test configuration helpers for loading .env credentials and creating test engines

use std::sync::Arc;
use std::time::Duration;

use usenet_engine::{
    Account, AccountId, ConnectionConfig, Engine, EngineConfig, Listener, Server, Settings,
};

use super::assertions::Events;

/// Error type for test configuration
#[derive(Debug)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Config error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// Route engine logs to the test output; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Account pointing at a plain-text server on the loopback interface
pub fn local_account(id: u64, port: u16) -> Account {
    let mut account = Account::new(AccountId(id), format!("local-{id}"));
    account.general_server = Some(Server::new("127.0.0.1", port));
    account.max_connections = 2;
    account
}

/// Engine configuration with timeouts suited to tests
pub fn test_engine_config() -> EngineConfig {
    EngineConfig {
        worker_threads: 2,
        articles_per_cmdlist: 4,
        reconnect_after_ticks: 2,
        connection: ConnectionConfig {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            ..Default::default()
        },
    }
}

/// Engine with the real TCP connector reporting to `events`
pub fn create_engine(events: &Arc<Events>) -> Engine {
    create_engine_with(events, Settings::default())
}

/// Engine with custom settings
pub fn create_engine_with(events: &Arc<Events>, settings: Settings) -> Engine {
    init_tracing();
    let listener: Arc<dyn Listener> = Arc::clone(events) as Arc<dyn Listener>;
    Engine::builder(listener)
        .config(test_engine_config())
        .settings(settings)
        .build()
        .expect("engine should build inside a tokio runtime")
}

/// Load the live provider account from environment variables
///
/// Required environment variables:
/// - `NNTP_HOST` - Server hostname
/// - `NNTP_USERNAME` - Authentication username
/// - `NNTP_PASSWORD` - Authentication password
///
/// Optional environment variables:
/// - `NNTP_PORT_SSL` - TLS port (default: 563)
/// - `NNTP_CONNECTIONS` - Number of connections (default: 4)
pub fn load_live_account() -> Result<Account, ConfigError> {
    dotenvy::dotenv().ok();

    let host = std::env::var("NNTP_HOST")
        .map_err(|_| ConfigError("NNTP_HOST not set in environment".to_string()))?;

    let port: u16 = std::env::var("NNTP_PORT_SSL")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(563);

    let username = std::env::var("NNTP_USERNAME")
        .map_err(|_| ConfigError("NNTP_USERNAME not set in environment".to_string()))?;

    let password = std::env::var("NNTP_PASSWORD")
        .map_err(|_| ConfigError("NNTP_PASSWORD not set in environment".to_string()))?;

    let connections: usize = std::env::var("NNTP_CONNECTIONS")
        .ok()
        .and_then(|c| c.parse().ok())
        .unwrap_or(4);

    let mut account = Account::new(AccountId(1), "live");
    account.secure_server = Some(Server::new(host, port));
    account.username = Some(username);
    account.password = Some(password);
    account.max_connections = connections;
    Ok(account)
}

/// Check if live credentials are available
pub fn has_live_credentials() -> bool {
    load_live_account().is_ok()
}

/// Message id of an article known to exist on the live provider, if configured
pub fn live_test_article() -> Option<(String, String)> {
    dotenvy::dotenv().ok();
    let article = std::env::var("NNTP_TEST_ARTICLE").ok()?;
    let group = std::env::var("NNTP_TEST_GROUP").unwrap_or_else(|_| "alt.binaries.test".to_string());
    Some((article, group))
}
