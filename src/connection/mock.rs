//! In-memory NNTP server and connector shared by the unit tests

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

use super::{Connector, NntpStream};
use crate::error::{ConnectionError, ConnectionErrorKind};
use crate::session::buffer::stuff;

#[derive(Clone, Debug, Default)]
pub(crate) struct MockServer {
    pub login: Option<(String, String)>,
    pub mode_reader: bool,
    pub groups: Vec<String>,
    pub articles: HashMap<String, Vec<u8>>,
    pub dmca: Vec<String>,
    /// Stop answering BODY after this many replies
    pub stall_after: Option<usize>,
}

impl MockServer {
    pub(crate) fn with_group(group: &str) -> Self {
        Self {
            groups: vec![group.to_string()],
            ..Default::default()
        }
    }

    pub(crate) fn article(mut self, id: &str, body: &[u8]) -> Self {
        self.articles.insert(format!("<{id}>"), body.to_vec());
        self
    }
}

pub(crate) async fn serve(stream: DuplexStream, server: MockServer) {
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();
    let mut authed = server.login.is_none();
    let mut user = String::new();
    let mut bodies = 0;

    if write.write_all(b"200 mock news server ready\r\n").await.is_err() {
        return;
    }
    while let Ok(Some(line)) = lines.next_line().await {
        let (verb, arg) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        let reply: Vec<u8> = match verb.to_ascii_uppercase().as_str() {
            "CAPABILITIES" => {
                let mut caps = String::from("101 Capability list:\r\nVERSION 2\r\n");
                caps.push_str(if server.mode_reader { "MODE-READER\r\n" } else { "READER\r\n" });
                caps.push_str(".\r\n");
                caps.into_bytes()
            }
            "MODE" => b"200 reader mode\r\n".to_vec(),
            "AUTHINFO" => match arg.split_once(' ') {
                Some(("USER", name)) => {
                    user = name.to_string();
                    b"381 password required\r\n".to_vec()
                }
                Some(("PASS", pass)) => match &server.login {
                    Some((u, p)) if *u == user && p == pass => {
                        authed = true;
                        b"281 authentication accepted\r\n".to_vec()
                    }
                    _ => b"481 authentication rejected\r\n".to_vec(),
                },
                _ => b"501 syntax error\r\n".to_vec(),
            },
            "QUIT" => {
                let _ = write.write_all(b"205 bye\r\n").await;
                return;
            }
            _ if !authed => b"480 authentication required\r\n".to_vec(),
            "GROUP" => {
                if server.groups.iter().any(|g| g == arg) {
                    format!("211 1 1 1 {arg}\r\n").into_bytes()
                } else {
                    b"411 no such group\r\n".to_vec()
                }
            }
            "BODY" => {
                if server.stall_after.is_some_and(|n| bodies >= n) {
                    continue;
                }
                bodies += 1;
                if server.dmca.iter().any(|d| d == arg) {
                    b"451 removed due to DMCA notice\r\n".to_vec()
                } else if let Some(body) = server.articles.get(arg) {
                    let mut reply = b"222 0 body follows\r\n".to_vec();
                    reply.extend_from_slice(&stuff(body));
                    reply.extend_from_slice(b".\r\n");
                    reply
                } else {
                    b"430 no such article\r\n".to_vec()
                }
            }
            _ => b"500 unknown command\r\n".to_vec(),
        };
        if write.write_all(&reply).await.is_err() {
            return;
        }
    }
}

/// Hands out in-memory streams to a [`MockServer`] chosen by host name
#[derive(Debug, Default)]
pub(crate) struct MockConnector {
    pub server: MockServer,
    pub hosts: HashMap<String, MockServer>,
    pub fail_resolve: bool,
    pub refuse: bool,
    pub connects: Arc<AtomicUsize>,
}

impl MockConnector {
    pub(crate) fn new(server: MockServer) -> Self {
        Self {
            server,
            ..Default::default()
        }
    }

    pub(crate) fn host(mut self, host: &str, server: MockServer) -> Self {
        self.hosts.insert(host.to_string(), server);
        self
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn resolve(&self, host: &str, _port: u16) -> Result<Vec<SocketAddr>, ConnectionError> {
        if self.fail_resolve {
            return Err(ConnectionError::new(
                ConnectionErrorKind::Resolve,
                format!("{host}: unknown host"),
            ));
        }
        Ok(vec![SocketAddr::from(([127, 0, 0, 1], 119))])
    }

    async fn connect(
        &self,
        _addrs: &[SocketAddr],
        host: &str,
        _secure: bool,
    ) -> Result<Box<dyn NntpStream>, ConnectionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            return Err(ConnectionError::new(
                ConnectionErrorKind::Refused,
                format!("{host}: connection refused"),
            ));
        }
        let server = self.hosts.get(host).unwrap_or(&self.server).clone();
        let (client, remote) = tokio::io::duplex(256 * 1024);
        tokio::spawn(serve(remote, server));
        Ok(Box::new(client))
    }
}
