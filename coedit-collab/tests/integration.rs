//! Integration tests for end-to-end document sync.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use chrono::{Duration as ChronoDuration, Utc};
use coedit_collab::client::{ClientLink, LinkConfig, LinkEvent, LinkState, ReconnectPolicy, SendOutcome};
use coedit_collab::conflict::CONFLICT_DETAILS;
use coedit_collab::hub::HubHandle;
use coedit_collab::protocol::{ClientMessage, ServerMessage, Timestamp};
use coedit_collab::server::{ServerConfig, SyncServer};
use coedit_collab::surface::SharedBuffer;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port, return its URL and hub handle.
async fn start_test_server(initial_content: &str) -> (String, HubHandle) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = SyncServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        initial_content: initial_content.to_string(),
        ..ServerConfig::default()
    });
    let handle = server.handle();
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    (format!("ws://127.0.0.1:{port}"), handle)
}

async fn connect(url: &str) -> Ws {
    let (ws, _) = timeout(Duration::from_secs(2), tokio_tungstenite::connect_async(url))
        .await
        .expect("connect timed out")
        .expect("should connect to server");
    ws
}

/// Next server message, skipping control frames.
async fn recv(ws: &mut Ws) -> ServerMessage {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("no message within timeout")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return ServerMessage::decode(text.as_str()).unwrap();
        }
    }
}

/// Assert nothing arrives for a short while.
async fn assert_silent(ws: &mut Ws) {
    let result = timeout(Duration::from_millis(150), ws.next()).await;
    assert!(result.is_err(), "unexpected message: {result:?}");
}

async fn send_edit(ws: &mut Ws, content: &str, timestamp: Timestamp) {
    let frame = ClientMessage::edit(content, timestamp, "tester").encode().unwrap();
    ws.send(Message::text(frame)).await.unwrap();
}

/// Wait until the roster has `n` members.
async fn recv_roster_of(ws: &mut Ws, n: usize) -> Vec<coedit_collab::ConnectionId> {
    loop {
        if let ServerMessage::UserListUpdate { users } = recv(ws).await {
            if users.len() == n {
                return users;
            }
        }
    }
}

async fn wait_for_event(
    events: &mut mpsc::Receiver<LinkEvent>,
    pred: impl Fn(&LinkEvent) -> bool,
) -> LinkEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not seen within timeout")
}

#[tokio::test]
async fn test_new_connection_gets_initial_state_then_roster() {
    let (url, handle) = start_test_server("seed text").await;
    let mut ws = connect(&url).await;

    match recv(&mut ws).await {
        ServerMessage::InitialState { content, .. } => assert_eq!(content, "seed text"),
        other => panic!("expected initialState, got {other:?}"),
    }
    let roster = recv_roster_of(&mut ws, 1).await;
    assert_eq!(handle.roster().await.unwrap(), roster);
}

#[tokio::test]
async fn test_stale_edit_is_rejected_and_fresh_edit_relayed() {
    let (url, handle) = start_test_server("Initial document content").await;
    let mut alice = connect(&url).await;
    recv(&mut alice).await;
    recv_roster_of(&mut alice, 1).await;
    let mut bob = connect(&url).await;
    recv(&mut bob).await;
    recv_roster_of(&mut bob, 2).await;
    recv_roster_of(&mut alice, 2).await;

    let t1 = Utc::now() + ChronoDuration::seconds(10);
    send_edit(&mut alice, "hello", t1).await;

    assert_eq!(
        recv(&mut bob).await,
        ServerMessage::UpdateDocument {
            content: "hello".to_string()
        }
    );
    assert_silent(&mut alice).await;

    send_edit(&mut bob, "world", t1 - ChronoDuration::seconds(1)).await;

    assert_eq!(
        recv(&mut bob).await,
        ServerMessage::ConflictDetected {
            details: CONFLICT_DETAILS.to_string(),
            current_content: "hello".to_string(),
        }
    );
    assert_silent(&mut alice).await;

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.content, "hello");
    assert_eq!(snapshot.last_updated, t1);
}

#[tokio::test]
async fn test_equal_timestamp_is_accepted() {
    let (url, handle) = start_test_server("start").await;
    let mut alice = connect(&url).await;
    recv(&mut alice).await;
    recv_roster_of(&mut alice, 1).await;
    let t1 = Utc::now() + ChronoDuration::seconds(5);

    send_edit(&mut alice, "first", t1).await;
    send_edit(&mut alice, "second", t1).await;
    assert_silent(&mut alice).await;

    assert_eq!(handle.snapshot().await.unwrap().content, "second");
    assert_eq!(handle.stats().await.unwrap().edits_accepted, 2);
}

#[tokio::test]
async fn test_disconnect_shrinks_roster() {
    let (url, handle) = start_test_server("doc").await;
    let mut alice = connect(&url).await;
    recv(&mut alice).await;
    let alone = recv_roster_of(&mut alice, 1).await;

    let mut bob = connect(&url).await;
    recv(&mut bob).await;
    let both = recv_roster_of(&mut alice, 2).await;
    assert_eq!(both[0], alone[0]);

    bob.close(None).await.unwrap();

    assert_eq!(recv_roster_of(&mut alice, 1).await, alone);
    assert_eq!(handle.roster().await.unwrap(), alone);
}

#[tokio::test]
async fn test_bad_frames_do_not_close_connection() {
    let (url, handle) = start_test_server("doc").await;
    let mut alice = connect(&url).await;
    recv(&mut alice).await;
    let mut bob = connect(&url).await;
    recv(&mut bob).await;
    recv_roster_of(&mut bob, 2).await;

    alice.send(Message::text("not json at all")).await.unwrap();
    alice.send(Message::text(r#"{"type":"cursor","line":3}"#)).await.unwrap();
    alice.send(Message::text(r#"{"content":"no type"}"#)).await.unwrap();
    send_edit(&mut alice, "still here", Utc::now() + ChronoDuration::seconds(5)).await;

    assert_eq!(
        recv(&mut bob).await,
        ServerMessage::UpdateDocument {
            content: "still here".to_string()
        }
    );

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.malformed_messages, 2);
    assert_eq!(stats.unknown_messages, 1);
    assert_eq!(stats.active_connections, 2);
}

#[tokio::test]
async fn test_late_joiner_gets_current_content() {
    let (url, _handle) = start_test_server("old").await;
    let mut alice = connect(&url).await;
    recv(&mut alice).await;
    let t1 = Utc::now() + ChronoDuration::seconds(5);
    send_edit(&mut alice, "new", t1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut carol = connect(&url).await;
    match recv(&mut carol).await {
        ServerMessage::InitialState {
            content,
            last_updated,
        } => {
            assert_eq!(content, "new");
            assert_eq!(last_updated, t1);
        }
        other => panic!("expected initialState, got {other:?}"),
    }
}

#[tokio::test]
async fn test_client_link_receives_and_sends_updates() {
    let (url, handle) = start_test_server("doc").await;
    let buffer = SharedBuffer::new("");
    let mut link = ClientLink::start(
        LinkConfig {
            server_url: url.clone(),
            ..LinkConfig::default()
        },
        buffer.clone(),
        "alice".to_string(),
    );
    let mut events = link.take_event_rx().unwrap();
    wait_for_event(&mut events, |e| *e == LinkEvent::Status(LinkState::Open)).await;
    wait_for_event(&mut events, |e| matches!(e, LinkEvent::InitialState { .. })).await;

    let mut bob = connect(&url).await;
    recv(&mut bob).await;
    wait_for_event(&mut events, |e| matches!(e, LinkEvent::Roster(users) if users.len() == 2)).await;
    assert_eq!(link.roster().await.len(), 2);

    send_edit(&mut bob, "from bob", Utc::now()).await;
    wait_for_event(&mut events, |e| matches!(e, LinkEvent::DocumentReplaced { .. })).await;
    assert_eq!(buffer.text(), "from bob");

    // Keep the link's clock ahead of the edit bob just made.
    tokio::time::sleep(Duration::from_millis(5)).await;
    buffer.set_text("from alice");
    assert_eq!(link.send_edit().await.unwrap(), SendOutcome::Sent);
    loop {
        if let ServerMessage::UpdateDocument { content } = recv(&mut bob).await {
            assert_eq!(content, "from alice");
            break;
        }
    }
    assert_eq!(handle.snapshot().await.unwrap().content, "from alice");

    link.shutdown().await;
}

#[tokio::test]
async fn test_client_link_conflict_resets_surface() {
    let (url, _handle) = start_test_server("doc").await;
    let mut bob = connect(&url).await;
    recv(&mut bob).await;
    send_edit(&mut bob, "future", Utc::now() + ChronoDuration::hours(1)).await;

    let buffer = SharedBuffer::new("");
    let mut link = ClientLink::start(
        LinkConfig {
            server_url: url,
            reconnect: ReconnectPolicy::Fixed(Duration::from_millis(50)),
            ..LinkConfig::default()
        },
        buffer.clone(),
        "alice".to_string(),
    );
    let mut events = link.take_event_rx().unwrap();
    wait_for_event(&mut events, |e| *e == LinkEvent::Status(LinkState::Open)).await;

    buffer.set_text("my stale idea");
    link.send_edit().await.unwrap();

    let event = wait_for_event(&mut events, |e| matches!(e, LinkEvent::Conflict { .. })).await;
    assert_eq!(
        event,
        LinkEvent::Conflict {
            details: CONFLICT_DETAILS.to_string(),
            current_content: "future".to_string(),
        }
    );
    assert_eq!(buffer.text(), "future");
    let notice = wait_for_event(&mut events, |e| matches!(e, LinkEvent::Notice(_))).await;
    match notice {
        LinkEvent::Notice(notice) => {
            assert_eq!(notice.text, format!("Conflict detected: {CONFLICT_DETAILS}"))
        }
        other => panic!("expected notice, got {other:?}"),
    }

    link.shutdown().await;
}

/// Forwards one connection at a time to `upstream`. A message on the first
/// sender severs the current connection; the next connection is only
/// accepted after a message on the second.
async fn start_relay(upstream: String) -> (String, mpsc::Sender<()>, mpsc::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (cut_tx, mut cut_rx) = mpsc::channel::<()>(1);
    let (resume_tx, mut resume_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        let mut first = true;
        loop {
            if !first && resume_rx.recv().await.is_none() {
                break;
            }
            first = false;
            let (mut inbound, _) = listener.accept().await.unwrap();
            let mut outbound = TcpStream::connect(&upstream).await.unwrap();
            tokio::select! {
                _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {}
                _ = cut_rx.recv() => {}
            }
        }
    });
    (url, cut_tx, resume_tx)
}

#[tokio::test]
async fn test_client_link_reopens_with_current_content() {
    let (url, handle) = start_test_server("before outage").await;
    let (relay_url, cut, resume) = start_relay(url.trim_start_matches("ws://").to_string()).await;

    let buffer = SharedBuffer::new("");
    let mut link = ClientLink::start(
        LinkConfig {
            server_url: relay_url,
            reconnect: ReconnectPolicy::Fixed(Duration::from_millis(50)),
            ..LinkConfig::default()
        },
        buffer.clone(),
        "alice".to_string(),
    );
    let mut events = link.take_event_rx().unwrap();
    match wait_for_event(&mut events, |e| matches!(e, LinkEvent::InitialState { .. })).await {
        LinkEvent::InitialState { content, .. } => assert_eq!(content, "before outage"),
        other => panic!("expected initialState, got {other:?}"),
    }

    cut.send(()).await.unwrap();
    wait_for_event(&mut events, |e| *e == LinkEvent::Status(LinkState::Reconnecting)).await;
    wait_for_event(&mut events, |e| *e == LinkEvent::Status(LinkState::Connecting)).await;

    // Edit the document while the link is down.
    let mut bob = connect(&url).await;
    recv(&mut bob).await;
    let t1 = Utc::now() + ChronoDuration::seconds(5);
    send_edit(&mut bob, "during outage", t1).await;
    timeout(Duration::from_secs(2), async {
        while handle.snapshot().await.unwrap().content != "during outage" {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("edit not applied");

    resume.send(()).await.unwrap();
    wait_for_event(&mut events, |e| *e == LinkEvent::Status(LinkState::Open)).await;
    match wait_for_event(&mut events, |e| matches!(e, LinkEvent::InitialState { .. })).await {
        LinkEvent::InitialState {
            content,
            last_updated,
        } => {
            assert_eq!(content, "during outage");
            assert_eq!(last_updated, t1);
        }
        other => panic!("expected initialState, got {other:?}"),
    }

    link.shutdown().await;
}
