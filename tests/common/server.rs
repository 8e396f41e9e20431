//! Minimal NNTP server on a loopback `TcpListener`

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use usenet_engine::session::buffer::stuff;

/// What the mock server carries and how it behaves
#[derive(Clone, Debug, Default)]
pub struct ServerConfig {
    /// Required AUTHINFO user and password
    pub login: Option<(String, String)>,
    /// Groups that GROUP accepts
    pub groups: Vec<String>,
    /// Article bodies keyed by message id without brackets
    pub articles: HashMap<String, Vec<u8>>,
}

impl ServerConfig {
    /// Server carrying `group`
    pub fn with_group(group: &str) -> Self {
        Self {
            groups: vec![group.to_string()],
            ..Default::default()
        }
    }

    /// Add an article
    pub fn article(mut self, id: &str, body: impl Into<Vec<u8>>) -> Self {
        self.articles.insert(id.to_string(), body.into());
        self
    }

    /// Add several articles
    pub fn articles(mut self, articles: Vec<(String, Vec<u8>)>) -> Self {
        self.articles.extend(articles);
        self
    }

    /// Require a login
    pub fn login(mut self, user: &str, pass: &str) -> Self {
        self.login = Some((user.to_string(), pass.to_string()));
        self
    }
}

/// Running mock server; stops when dropped
pub struct MockNntpServer {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    bodies: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockNntpServer {
    /// Bind to an ephemeral loopback port and start accepting
    pub async fn start(config: ServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let bodies = Arc::new(AtomicUsize::new(0));
        let config = Arc::new(config);

        let task = {
            let connections = Arc::clone(&connections);
            let bodies = Arc::clone(&bodies);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(handle(stream, Arc::clone(&config), Arc::clone(&bodies)));
                }
            })
        };

        Self {
            addr,
            connections,
            bodies,
            task,
        }
    }

    /// Port the server listens on
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// BODY commands answered with an article
    pub fn bodies_served(&self) -> usize {
        self.bodies.load(Ordering::SeqCst)
    }
}

impl Drop for MockNntpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A loopback port nothing listens on
pub async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn handle(stream: TcpStream, config: Arc<ServerConfig>, bodies: Arc<AtomicUsize>) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let mut authed = config.login.is_none();
    let mut user = String::new();

    if write.write_all(b"200 mock server ready\r\n").await.is_err() {
        return;
    }
    while let Ok(Some(line)) = lines.next_line().await {
        let (verb, arg) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        let reply: Vec<u8> = match verb.to_ascii_uppercase().as_str() {
            "CAPABILITIES" => b"101 Capability list:\r\nVERSION 2\r\nREADER\r\n.\r\n".to_vec(),
            "MODE" => b"200 reader mode\r\n".to_vec(),
            "AUTHINFO" => match arg.split_once(' ') {
                Some(("USER", name)) => {
                    user = name.to_string();
                    b"381 password required\r\n".to_vec()
                }
                Some(("PASS", pass)) => match &config.login {
                    Some((u, p)) if *u == user && p == pass => {
                        authed = true;
                        b"281 authentication accepted\r\n".to_vec()
                    }
                    _ => b"481 authentication failed\r\n".to_vec(),
                },
                _ => b"501 syntax error\r\n".to_vec(),
            },
            "QUIT" => {
                let _ = write.write_all(b"205 closing connection\r\n").await;
                return;
            }
            _ if !authed => b"480 authentication required\r\n".to_vec(),
            "GROUP" => {
                if config.groups.iter().any(|g| g == arg) {
                    format!("211 100 1 100 {arg}\r\n").into_bytes()
                } else {
                    b"411 no such newsgroup\r\n".to_vec()
                }
            }
            "BODY" => {
                let id = arg.trim_start_matches('<').trim_end_matches('>');
                match config.articles.get(id) {
                    Some(body) => {
                        bodies.fetch_add(1, Ordering::SeqCst);
                        let mut reply = format!("222 0 {arg}\r\n").into_bytes();
                        reply.extend_from_slice(&stuff(body));
                        reply.extend_from_slice(b".\r\n");
                        reply
                    }
                    None => b"430 no such article\r\n".to_vec(),
                }
            }
            _ => b"500 command not recognized\r\n".to_vec(),
        };
        if write.write_all(&reply).await.is_err() {
            return;
        }
    }
}
