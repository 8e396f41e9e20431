//! Opening the byte stream a connection talks NNTP over
//!
//! The [`Connector`] trait is the seam between the connection state machine
//! and the network: production code uses [`TcpConnector`] (TCP plus optional
//! implicit TLS), tests plug in in-memory streams.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::{ConnectionError, ConnectionErrorKind};

/// Bidirectional stream carrying an NNTP session
///
/// Only `Send` is required: a stream is owned by one connection task and
/// only ever used through `&mut`, so futures that hold it must never borrow
/// their owner immutably across an `.await`.
pub trait NntpStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> NntpStream for T {}

/// Opens streams to NNTP servers
#[async_trait]
pub trait Connector: Send + Sync {
    /// Resolve `host` to socket addresses
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, ConnectionError>;

    /// Connect to one of `addrs`, wrapping the stream in TLS when `secure`
    async fn connect(
        &self,
        addrs: &[SocketAddr],
        host: &str,
        secure: bool,
    ) -> Result<Box<dyn NntpStream>, ConnectionError>;
}

/// TCP connector with rustls for secure servers
#[derive(Clone)]
pub struct TcpConnector {
    tls: Arc<TlsConnector>,
}

impl std::fmt::Debug for TcpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnector")
            .field("tls", &"<TlsConnector>")
            .finish()
    }
}

impl TcpConnector {
    /// Build a connector trusting the Mozilla root certificates
    pub fn new() -> crate::Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| crate::Error::Config {
                message: format!("TLS setup failed: {e}"),
                key: None,
            })?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            tls: Arc::new(TlsConnector::from(Arc::new(config))),
        })
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, ConnectionError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| {
                ConnectionError::new(ConnectionErrorKind::Resolve, format!("{host}: {e}"))
            })?
            .collect();
        if addrs.is_empty() {
            return Err(ConnectionError::new(
                ConnectionErrorKind::Resolve,
                format!("{host}: no addresses"),
            ));
        }
        Ok(addrs)
    }

    async fn connect(
        &self,
        addrs: &[SocketAddr],
        host: &str,
        secure: bool,
    ) -> Result<Box<dyn NntpStream>, ConnectionError> {
        let mut last_error = ConnectionError::network("no address to connect to");
        let mut tcp = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "connect attempt failed");
                    last_error = ConnectionError::from_io(&e);
                }
            }
        }
        let tcp = tcp.ok_or(last_error)?;
        if let Err(e) = tcp.set_nodelay(true) {
            tracing::debug!(error = %e, "failed to set TCP_NODELAY");
        }

        if !secure {
            return Ok(Box::new(tcp));
        }
        let name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| ConnectionError::network(format!("invalid TLS name {host}: {e}")))?;
        let stream = self
            .tls
            .connect(name, tcp)
            .await
            .map_err(|e| ConnectionError::network(format!("TLS handshake failed: {e}")))?;
        Ok(Box::new(stream))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_refused_connection_is_classified() {
        // bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = TcpConnector::new().unwrap();
        let err = connector
            .connect(&[addr], "127.0.0.1", false)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, ConnectionErrorKind::Refused);
    }

    #[tokio::test]
    async fn test_resolve_numeric_address() {
        let connector = TcpConnector::new().unwrap();
        let addrs = connector.resolve("127.0.0.1", 119).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:119".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_plain_connect_succeeds() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let connector = TcpConnector::new().unwrap();
        assert!(connector.connect(&[addr], "127.0.0.1", false).await.is_ok());
    }
}
