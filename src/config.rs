//! Configuration types for usenet-engine

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::AccountId;

/// Address of one NNTP server endpoint
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// Server hostname
    pub host: String,

    /// Server port (typically 119 for unencrypted, 563 for TLS)
    pub port: u16,
}

impl Server {
    /// Create a new server address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// A Usenet account: credentials plus the servers and connection limits to use
///
/// Accounts are upserted into the engine by id with
/// [`Engine::set_account`](crate::Engine::set_account) and are never removed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account identifier chosen by the host
    pub id: AccountId,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Username for authentication
    #[serde(default)]
    pub username: Option<String>,

    /// Password for authentication
    #[serde(default)]
    pub password: Option<String>,

    /// Plain-text server (None = disabled)
    #[serde(default)]
    pub general_server: Option<Server>,

    /// Implicit-TLS server (None = disabled)
    #[serde(default)]
    pub secure_server: Option<Server>,

    /// Number of connections to maintain (default: 5)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Allow compressed transfers when the server advertises them
    #[serde(default)]
    pub enable_compression: bool,

    /// Send all BODY commands of a command list before reading responses
    #[serde(default)]
    pub enable_pipelining: bool,

    /// Use this account to re-fetch articles other accounts could not provide
    #[serde(default)]
    pub fill_account: bool,
}

impl Account {
    /// Create an account with default limits and no servers
    pub fn new(id: AccountId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            username: None,
            password: None,
            general_server: None,
            secure_server: None,
            max_connections: default_max_connections(),
            enable_compression: false,
            enable_pipelining: false,
            fill_account: false,
        }
    }

    /// Select the endpoint to connect to
    ///
    /// Returns the server and whether it uses TLS. The secure server wins when
    /// `prefer_secure` is set or the general server is disabled.
    pub fn endpoint(&self, prefer_secure: bool) -> Option<(&Server, bool)> {
        match (&self.general_server, &self.secure_server) {
            (Some(general), Some(secure)) => {
                if prefer_secure {
                    Some((secure, true))
                } else {
                    Some((general, false))
                }
            }
            (None, Some(secure)) => Some((secure, true)),
            (Some(general), None) => Some((general, false)),
            (None, None) => None,
        }
    }

    /// Whether the username or password differ from `other`
    pub fn credentials_differ(&self, other: &Account) -> bool {
        self.username != other.username || self.password != other.password
    }
}

/// Global download policy, changeable at runtime with
/// [`Engine::set_settings`](crate::Engine::set_settings)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Overwrite files that already exist instead of picking a new name
    #[serde(default)]
    pub overwrite_existing_files: bool,

    /// Drop non-binary (text) article content instead of writing a `.txt` file
    #[serde(default)]
    pub discard_text_content: bool,

    /// Prefer the secure server when an account has both
    #[serde(default = "default_true")]
    pub prefer_secure: bool,

    /// Remove completed tasks from the task list immediately
    #[serde(default)]
    pub auto_remove_complete: bool,

    /// Enable the global bandwidth throttle
    #[serde(default)]
    pub enable_throttle: bool,

    /// Throttle rate in bytes per second when enabled
    #[serde(default)]
    pub throttle_bps: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            overwrite_existing_files: false,
            discard_text_content: false,
            prefer_secure: true,
            auto_remove_complete: false,
            enable_throttle: false,
            throttle_bps: 0,
        }
    }
}

impl Settings {
    /// Effective throttle limit (None = unlimited)
    pub fn throttle_limit(&self) -> Option<u64> {
        if self.enable_throttle && self.throttle_bps > 0 {
            Some(self.throttle_bps)
        } else {
            None
        }
    }
}

/// Timeouts and limits applied to every connection
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Time allowed for TCP connect and TLS handshake (default: 30 seconds)
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Time allowed between bytes of a response (default: 15 seconds)
    #[serde(default = "default_read_timeout", with = "duration_serde")]
    pub read_timeout: Duration,

    /// Idle time after which a keep-alive is sent (default: 30 seconds)
    #[serde(default = "default_ping_interval", with = "duration_serde")]
    pub ping_interval: Duration,

    /// Largest single response accepted before it is treated as a protocol fault
    /// (default: 4 MiB)
    #[serde(default = "default_max_response_size")]
    pub max_response_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            read_timeout: default_read_timeout(),
            ping_interval: default_ping_interval(),
            max_response_size: default_max_response_size(),
        }
    }
}

/// Static engine configuration fixed at construction time
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of decode/write worker threads (default: 4)
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Maximum articles per command list handed to a connection (default: 10)
    #[serde(default = "default_articles_per_cmdlist")]
    pub articles_per_cmdlist: usize,

    /// Ticks an errored connection waits before it is replaced (default: 5)
    #[serde(default = "default_reconnect_ticks")]
    pub reconnect_after_ticks: u32,

    /// Per-connection settings
    #[serde(default)]
    pub connection: ConnectionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            articles_per_cmdlist: default_articles_per_cmdlist(),
            reconnect_after_ticks: default_reconnect_ticks(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Reject values the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.worker_threads == 0 {
            return Err(crate::Error::Config {
                message: "worker_threads must be at least 1".to_string(),
                key: Some("worker_threads".to_string()),
            });
        }
        if self.articles_per_cmdlist == 0 {
            return Err(crate::Error::Config {
                message: "articles_per_cmdlist must be at least 1".to_string(),
                key: Some("articles_per_cmdlist".to_string()),
            });
        }
        if self.connection.max_response_size < crate::session::buffer::INITIAL_CAPACITY {
            return Err(crate::Error::Config {
                message: format!(
                    "max_response_size must be at least {} bytes",
                    crate::session::buffer::INITIAL_CAPACITY
                ),
                key: Some("connection.max_response_size".to_string()),
            });
        }
        Ok(())
    }
}

fn default_max_connections() -> usize {
    5
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_ping_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_max_response_size() -> usize {
    4 * 1024 * 1024
}

fn default_worker_threads() -> usize {
    4
}

fn default_articles_per_cmdlist() -> usize {
    10
}

fn default_reconnect_ticks() -> u32 {
    5
}

// Duration serialization helper (seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_defaults_from_json() {
        let account: Account = serde_json::from_str(r#"{"id": 3}"#).unwrap();
        assert_eq!(account.id, AccountId(3));
        assert_eq!(account.max_connections, 5);
        assert!(!account.enable_pipelining);
        assert!(account.general_server.is_none());
    }

    #[test]
    fn test_endpoint_selection() {
        let mut account = Account::new(AccountId(1), "test");
        assert!(account.endpoint(true).is_none(), "no servers configured");

        account.general_server = Some(Server::new("news.example.com", 119));
        let (server, secure) = account.endpoint(true).unwrap();
        assert_eq!(server.port, 119);
        assert!(!secure, "only the general server is enabled");

        account.secure_server = Some(Server::new("ssl.example.com", 563));
        let (server, secure) = account.endpoint(true).unwrap();
        assert_eq!(server.host, "ssl.example.com");
        assert!(secure);

        let (server, secure) = account.endpoint(false).unwrap();
        assert_eq!(server.host, "news.example.com");
        assert!(!secure);
    }

    #[test]
    fn test_credentials_differ() {
        let a = Account::new(AccountId(1), "a");
        let mut b = a.clone();
        assert!(!a.credentials_differ(&b));

        b.password = Some("secret".to_string());
        assert!(a.credentials_differ(&b));
    }

    #[test]
    fn test_throttle_limit() {
        let mut settings = Settings::default();
        assert_eq!(settings.throttle_limit(), None);

        settings.throttle_bps = 1_000_000;
        assert_eq!(settings.throttle_limit(), None, "throttle disabled");

        settings.enable_throttle = true;
        assert_eq!(settings.throttle_limit(), Some(1_000_000));
    }

    #[test]
    fn test_connection_config_durations_in_seconds() {
        let json = serde_json::to_value(ConnectionConfig::default()).unwrap();
        assert_eq!(json["read_timeout"], 15);
        assert_eq!(json["ping_interval"], 30);

        let parsed: ConnectionConfig =
            serde_json::from_str(r#"{"read_timeout": 5}"#).unwrap();
        assert_eq!(parsed.read_timeout, Duration::from_secs(5));
        assert_eq!(parsed.max_response_size, 4 * 1024 * 1024);
    }

    #[test]
    fn test_engine_config_validation() {
        assert!(EngineConfig::default().validate().is_ok());

        let config = EngineConfig {
            worker_threads: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(crate::Error::Config { key: Some(ref k), .. }) if k == "worker_threads"
        ));
    }
}
