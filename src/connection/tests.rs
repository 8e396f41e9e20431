//! Tests for the connection task against an in-memory NNTP server.

use super::mock::{MockConnector, MockServer};
use super::*;

// -----------------------------------------------------------------------
// Harness
// -----------------------------------------------------------------------

struct ChannelSink(mpsc::UnboundedSender<ConnectionEvent>);

impl EventSink for ChannelSink {
    fn post(&self, _conn: ConnectionId, event: ConnectionEvent) {
        let _ = self.0.send(event);
    }
}

fn details(pipelining: bool) -> HostDetails {
    HostDetails {
        account: AccountId(1),
        host: "news.example.com".to_string(),
        port: 119,
        secure: false,
        pipelining,
        compression: false,
        authenticate: false,
    }
}

fn spawn_with(
    connector: MockConnector,
    details: HostDetails,
) -> (ConnectionHandle, mpsc::UnboundedReceiver<ConnectionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let context = ConnectionContext {
        connector: Arc::new(connector),
        throttle: Throttle::new(None),
        sink: Arc::new(ChannelSink(tx)),
        config: ConnectionConfig::default(),
    };
    let handle = ConnectionHandle::spawn(ConnectionId(1), details, context, &Handle::current());
    (handle, rx)
}

fn spawn_connection(
    connector: MockConnector,
    pipelining: bool,
) -> (ConnectionHandle, mpsc::UnboundedReceiver<ConnectionEvent>) {
    spawn_with(connector, details(pipelining))
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a connection event")
        .expect("event channel closed")
}

// Skip lifecycle state events until something else arrives
async fn next_non_state(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
    loop {
        match next_event(rx).await {
            ConnectionEvent::State(_) => continue,
            other => return other,
        }
    }
}

fn cmdlist(groups: &[&str], articles: &[&str]) -> CmdList {
    CmdList {
        id: CmdListId(7),
        task: TaskId(3),
        groups: groups.iter().map(|g| g.to_string()).collect(),
        articles: articles.iter().map(|a| a.to_string()).collect(),
        stop: CancellationToken::new(),
    }
}

// -----------------------------------------------------------------------
// Lifecycle
// -----------------------------------------------------------------------

#[tokio::test]
async fn connection_walks_through_states_to_ready() {
    let (_handle, mut rx) = spawn_connection(MockConnector::new(MockServer::default()), false);

    assert!(matches!(
        next_event(&mut rx).await,
        ConnectionEvent::State(ConnectionState::Resolving)
    ));
    assert!(matches!(
        next_event(&mut rx).await,
        ConnectionEvent::State(ConnectionState::Connecting)
    ));
    assert!(matches!(
        next_event(&mut rx).await,
        ConnectionEvent::State(ConnectionState::Initializing)
    ));
    assert!(matches!(next_event(&mut rx).await, ConnectionEvent::Ready));
}

#[tokio::test]
async fn mode_reader_is_negotiated_when_advertised() {
    let server = MockServer {
        mode_reader: true,
        ..MockServer::with_group("alt.test")
    }
    .article("a@test", b"data\r\n");
    let (handle, mut rx) = spawn_connection(MockConnector::new(server), false);
    assert!(matches!(next_non_state(&mut rx).await, ConnectionEvent::Ready));

    handle.execute(cmdlist(&["alt.test"], &["a@test"])).unwrap();
    match next_non_state(&mut rx).await {
        ConnectionEvent::Body { status, .. } => assert_eq!(status, ContentStatus::Success),
        other => panic!("expected body, got {other:?}"),
    }
}

#[tokio::test]
async fn resolve_failure_reports_error_then_closes() {
    let connector = MockConnector {
        fail_resolve: true,
        ..Default::default()
    };
    let (_handle, mut rx) = spawn_connection(connector, false);

    match next_non_state(&mut rx).await {
        ConnectionEvent::Error(e) => assert_eq!(e.kind, ConnectionErrorKind::Resolve),
        other => panic!("expected error, got {other:?}"),
    }
    assert!(matches!(
        next_non_state(&mut rx).await,
        ConnectionEvent::Closed { cancelled: false }
    ));
}

#[tokio::test]
async fn cancel_closes_with_cancelled_flag() {
    let (handle, mut rx) = spawn_connection(MockConnector::new(MockServer::default()), false);
    assert!(matches!(next_non_state(&mut rx).await, ConnectionEvent::Ready));

    handle.cancel();
    assert!(matches!(
        next_non_state(&mut rx).await,
        ConnectionEvent::Closed { cancelled: true }
    ));
}

// -----------------------------------------------------------------------
// Command lists
// -----------------------------------------------------------------------

async fn run_cmdlist(pipelining: bool) {
    let server = MockServer::with_group("alt.binaries.test")
        .article("one@test", b"first body\r\n..dotted line\r\n")
        .article("two@test", b"second body\r\n");
    let (handle, mut rx) = spawn_connection(MockConnector::new(server), pipelining);
    assert!(matches!(next_non_state(&mut rx).await, ConnectionEvent::Ready));

    handle
        .execute(cmdlist(
            &["alt.missing", "alt.binaries.test"],
            &["one@test", "gone@test", "two@test"],
        ))
        .unwrap();

    let mut bodies = Vec::new();
    loop {
        match next_non_state(&mut rx).await {
            ConnectionEvent::Body {
                article,
                status,
                data,
                task,
                ..
            } => {
                assert_eq!(task, TaskId(3));
                bodies.push((article, status, data));
            }
            ConnectionEvent::CmdListDone {
                cmdlist,
                unanswered,
                no_group,
                ..
            } => {
                assert_eq!(cmdlist, CmdListId(7));
                assert!(unanswered.is_empty());
                assert!(!no_group);
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    assert_eq!(bodies.len(), 3);
    assert_eq!(bodies[0].0, "one@test");
    assert_eq!(bodies[0].1, ContentStatus::Success);
    assert_eq!(bodies[0].2, b"first body\r\n..dotted line\r\n");
    assert_eq!(bodies[1].1, ContentStatus::Unavailable);
    assert!(bodies[1].2.is_empty());
    assert_eq!(bodies[2].2, b"second body\r\n");
}

#[tokio::test]
async fn sequential_cmdlist_delivers_every_article() {
    run_cmdlist(false).await;
}

#[tokio::test]
async fn pipelined_cmdlist_delivers_every_article() {
    run_cmdlist(true).await;
}

#[tokio::test]
async fn dmca_reply_is_classified() {
    let server = MockServer {
        dmca: vec!["<taken@test>".to_string()],
        ..MockServer::with_group("alt.test")
    };
    let (handle, mut rx) = spawn_connection(MockConnector::new(server), false);
    assert!(matches!(next_non_state(&mut rx).await, ConnectionEvent::Ready));

    handle.execute(cmdlist(&["alt.test"], &["taken@test"])).unwrap();
    match next_non_state(&mut rx).await {
        ConnectionEvent::Body { status, .. } => assert_eq!(status, ContentStatus::Dmca),
        other => panic!("expected body, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_groups_report_no_group() {
    let server = MockServer::with_group("alt.other").article("a@test", b"x\r\n");
    let (handle, mut rx) = spawn_connection(MockConnector::new(server), false);
    assert!(matches!(next_non_state(&mut rx).await, ConnectionEvent::Ready));

    handle.execute(cmdlist(&["alt.nope", "alt.neither"], &["a@test"])).unwrap();
    match next_non_state(&mut rx).await {
        ConnectionEvent::CmdListDone {
            unanswered,
            no_group,
            ..
        } => {
            assert!(no_group);
            assert_eq!(unanswered, vec!["a@test".to_string()]);
        }
        other => panic!("expected cmdlist done, got {other:?}"),
    }
}

#[tokio::test]
async fn stopped_cmdlist_leaves_articles_unanswered() {
    let server = MockServer::with_group("alt.test")
        .article("a@test", b"x\r\n")
        .article("b@test", b"y\r\n");
    let (handle, mut rx) = spawn_connection(MockConnector::new(server), false);
    assert!(matches!(next_non_state(&mut rx).await, ConnectionEvent::Ready));

    let list = cmdlist(&["alt.test"], &["a@test", "b@test"]);
    list.stop.cancel();
    handle.execute(list).unwrap();

    match next_non_state(&mut rx).await {
        ConnectionEvent::CmdListDone { unanswered, .. } => {
            assert_eq!(unanswered, vec!["a@test".to_string(), "b@test".to_string()]);
        }
        other => panic!("expected cmdlist done, got {other:?}"),
    }
}

#[tokio::test]
async fn queued_cmdlists_are_returned_on_cancel() {
    let server = MockServer {
        stall_after: Some(0),
        ..MockServer::with_group("alt.test")
    };
    let (handle, mut rx) = spawn_connection(MockConnector::new(server), false);
    assert!(matches!(next_non_state(&mut rx).await, ConnectionEvent::Ready));

    handle.execute(cmdlist(&["alt.test"], &["a@test"])).unwrap();
    let mut queued = cmdlist(&["alt.test"], &["b@test", "c@test"]);
    queued.id = CmdListId(8);
    handle.execute(queued).unwrap();

    // let the first list reach its stalled BODY before cancelling
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.cancel();

    let mut returned = Vec::new();
    loop {
        match next_non_state(&mut rx).await {
            ConnectionEvent::CmdListDone {
                cmdlist,
                unanswered,
                ..
            } => returned.push((cmdlist, unanswered)),
            ConnectionEvent::Closed { cancelled } => {
                assert!(cancelled);
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(returned.len(), 2);
    assert_eq!(returned[0], (CmdListId(7), vec!["a@test".to_string()]));
    assert_eq!(
        returned[1],
        (CmdListId(8), vec!["b@test".to_string(), "c@test".to_string()])
    );
    assert!(handle.execute(cmdlist(&[], &["d@test"])).is_err());
}

// -----------------------------------------------------------------------
// Authentication
// -----------------------------------------------------------------------

fn auth_server() -> MockServer {
    MockServer {
        login: Some(("alice".to_string(), "s3cret".to_string())),
        ..MockServer::with_group("alt.test")
    }
    .article("a@test", b"payload\r\n")
}

#[tokio::test]
async fn auth_request_is_answered_and_command_reissued() {
    let (handle, mut rx) = spawn_connection(MockConnector::new(auth_server()), false);
    assert!(matches!(next_non_state(&mut rx).await, ConnectionEvent::Ready));

    handle.execute(cmdlist(&["alt.test"], &["a@test"])).unwrap();
    match next_non_state(&mut rx).await {
        ConnectionEvent::AuthRequest { account, reply } => {
            assert_eq!(account, AccountId(1));
            reply
                .send(Credentials {
                    username: Some("alice".to_string()),
                    password: Some("s3cret".to_string()),
                })
                .unwrap();
        }
        other => panic!("expected auth request, got {other:?}"),
    }
    match next_non_state(&mut rx).await {
        ConnectionEvent::Body { status, data, .. } => {
            assert_eq!(status, ContentStatus::Success);
            assert_eq!(data, b"payload\r\n");
        }
        other => panic!("expected body, got {other:?}"),
    }
}

#[tokio::test]
async fn wrong_password_is_authentication_failure() {
    let (handle, mut rx) = spawn_connection(MockConnector::new(auth_server()), false);
    assert!(matches!(next_non_state(&mut rx).await, ConnectionEvent::Ready));

    handle.execute(cmdlist(&["alt.test"], &["a@test"])).unwrap();
    if let ConnectionEvent::AuthRequest { reply, .. } = next_non_state(&mut rx).await {
        reply
            .send(Credentials {
                username: Some("alice".to_string()),
                password: Some("wrong".to_string()),
            })
            .unwrap();
    } else {
        panic!("expected auth request");
    }

    // the interrupted list comes back unanswered before the error
    match next_non_state(&mut rx).await {
        ConnectionEvent::CmdListDone { unanswered, .. } => assert_eq!(unanswered.len(), 1),
        other => panic!("expected cmdlist done, got {other:?}"),
    }
    match next_non_state(&mut rx).await {
        ConnectionEvent::Error(e) => {
            assert_eq!(e.kind, ConnectionErrorKind::AuthenticationFailed);
            assert!(!e.kind.allows_reconnect());
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert!(matches!(
        next_non_state(&mut rx).await,
        ConnectionEvent::Closed { cancelled: false }
    ));
}

#[tokio::test]
async fn missing_username_is_authentication_failure() {
    let (handle, mut rx) = spawn_connection(MockConnector::new(auth_server()), false);
    assert!(matches!(next_non_state(&mut rx).await, ConnectionEvent::Ready));

    handle.execute(cmdlist(&["alt.test"], &["a@test"])).unwrap();
    if let ConnectionEvent::AuthRequest { reply, .. } = next_non_state(&mut rx).await {
        reply.send(Credentials::default()).unwrap();
    } else {
        panic!("expected auth request");
    }

    let _done = next_non_state(&mut rx).await;
    match next_non_state(&mut rx).await {
        ConnectionEvent::Error(e) => assert_eq!(e.kind, ConnectionErrorKind::AuthenticationFailed),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn eager_login_happens_before_ready() {
    let details = HostDetails {
        authenticate: true,
        compression: true,
        ..details(false)
    };
    let (_handle, mut rx) = spawn_with(MockConnector::new(auth_server()), details);

    match next_non_state(&mut rx).await {
        ConnectionEvent::AuthRequest { reply, .. } => reply
            .send(Credentials {
                username: Some("alice".to_string()),
                password: Some("s3cret".to_string()),
            })
            .unwrap(),
        other => panic!("expected auth request, got {other:?}"),
    }
    assert!(matches!(next_non_state(&mut rx).await, ConnectionEvent::Ready));
}

#[tokio::test]
async fn eager_login_with_wrong_password_never_gets_ready() {
    let details = HostDetails {
        authenticate: true,
        ..details(false)
    };
    let (_handle, mut rx) = spawn_with(MockConnector::new(auth_server()), details);

    if let ConnectionEvent::AuthRequest { reply, .. } = next_non_state(&mut rx).await {
        reply
            .send(Credentials {
                username: Some("alice".to_string()),
                password: Some("wrong".to_string()),
            })
            .unwrap();
    } else {
        panic!("expected auth request");
    }
    match next_non_state(&mut rx).await {
        ConnectionEvent::Error(e) => assert_eq!(e.kind, ConnectionErrorKind::AuthenticationFailed),
        other => panic!("expected error, got {other:?}"),
    }
}

fn assert_send<T: Send>(_: &T) {}

#[tokio::test]
async fn connection_future_is_send_while_it_holds_a_stream() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let (_commands, rx) = mpsc::unbounded_channel();
    let task = ConnectionTask {
        id: ConnectionId(1),
        buffer: ResponseBuffer::new(1024 * 1024),
        details: details(false),
        context: ConnectionContext {
            connector: Arc::new(MockConnector::default()),
            throttle: Throttle::new(None),
            sink: Arc::new(ChannelSink(tx)),
            config: ConnectionConfig::default(),
        },
        session: Session::new(),
        stream: Some(Box::new(tokio::io::duplex(64).0)),
        cancel: CancellationToken::new(),
        commands: rx,
    };
    assert_send(&task.run());
}

#[test]
fn credentials_debug_masks_password() {
    let creds = Credentials {
        username: Some("alice".to_string()),
        password: Some("s3cret".to_string()),
    };
    let printed = format!("{creds:?}");
    assert!(printed.contains("alice"));
    assert!(!printed.contains("s3cret"));
}
