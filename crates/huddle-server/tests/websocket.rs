//! End-to-end WebSocket tests against a live listener.

use chrono::Duration as TokenTtl;
use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{InboundFrame, OutboundFrame};
use huddle_server::{serve, AppState, Config};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tenvis_huddle_core::SqlDirectory;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
    addr: SocketAddr,
    state: Arc<AppState>,
    directory: SqlDirectory,
}

async fn start(config: Config) -> Server {
    let state = AppState::from_config(config).unwrap();
    let directory = SqlDirectory::new(state.store.clone());
    for (id, name) in [(1, "alice"), (2, "bob"), (3, "carol")] {
        directory.upsert_user(id, name, None).await.unwrap();
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, state.clone()));

    Server {
        addr,
        state,
        directory,
    }
}

impl Server {
    async fn connect(&self, user_id: i64) -> Socket {
        let token = self
            .state
            .tokens
            .issue(user_id, TokenTtl::hours(1))
            .unwrap();
        let (socket, _) = connect_async(format!("ws://{}/ws?token={token}", self.addr))
            .await
            .unwrap();
        socket
    }

    async fn wait_for_clients(&self, count: usize) {
        for _ in 0..200 {
            if self.state.hub.stats().await.unwrap().clients == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} connected clients");
    }
}

async fn send(socket: &mut Socket, frame: &InboundFrame) {
    socket
        .send(Message::Text(serde_json::to_string(frame).unwrap()))
        .await
        .unwrap();
}

async fn next_frame(socket: &mut Socket) -> OutboundFrame {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn assert_silent(socket: &mut Socket) {
    let next = tokio::time::timeout(Duration::from_millis(200), socket.next()).await;
    assert!(next.is_err(), "unexpected frame: {next:?}");
}

#[tokio::test]
async fn conversation_message_reaches_participants_only() {
    let server = start(Config::for_tests()).await;
    let direct = server
        .state
        .conversations
        .create_direct(1, 2)
        .await
        .unwrap();

    let mut alice = server.connect(1).await;
    let mut bob = server.connect(2).await;
    let mut carol = server.connect(3).await;
    server.wait_for_clients(3).await;

    send(&mut alice, &InboundFrame::to_conversation(direct.id, "hello bob")).await;

    let received = next_frame(&mut bob).await;
    assert_eq!(received.content, "hello bob");
    assert_eq!(received.conversation_id, Some(direct.id));
    assert_eq!(received.sender.username, "alice");

    let echoed = next_frame(&mut alice).await;
    assert_eq!(echoed.id, received.id);
    assert_silent(&mut carol).await;
}

#[tokio::test]
async fn malformed_frames_keep_the_socket_open() {
    let server = start(Config::for_tests()).await;
    let direct = server
        .state
        .conversations
        .create_direct(1, 2)
        .await
        .unwrap();

    let mut alice = server.connect(1).await;
    let mut bob = server.connect(2).await;
    server.wait_for_clients(2).await;

    alice
        .send(Message::Text("{not json".to_string()))
        .await
        .unwrap();
    send(&mut alice, &InboundFrame::to_conversation(direct.id, "   ")).await;
    send(
        &mut alice,
        &InboundFrame {
            content: "nowhere".into(),
            ..InboundFrame::default()
        },
    )
    .await;
    // not a member of this conversation
    send(&mut alice, &InboundFrame::to_conversation(direct.id + 100, "x")).await;
    send(&mut alice, &InboundFrame::to_conversation(direct.id, "still here")).await;

    assert_eq!(next_frame(&mut bob).await.content, "still here");

    let page = server
        .state
        .messages
        .get_messages(direct.id, 2, 10, None)
        .await
        .unwrap();
    assert_eq!(page.total, 1);
}

#[tokio::test]
async fn legacy_direct_respects_blocks() {
    let server = start(Config::for_tests()).await;
    server.directory.block_user(2, 3).await.unwrap();

    let mut alice = server.connect(1).await;
    let mut bob = server.connect(2).await;
    let mut carol = server.connect(3).await;
    server.wait_for_clients(3).await;

    send(&mut carol, &InboundFrame::to_recipient(2, "blocked")).await;
    send(&mut alice, &InboundFrame::to_recipient(2, "psst")).await;

    let received = next_frame(&mut bob).await;
    assert_eq!(received.content, "psst");
    assert_eq!(received.recipient_id, Some(2));
    assert_eq!(next_frame(&mut alice).await.content, "psst");
    assert_silent(&mut carol).await;
}

#[tokio::test]
async fn legacy_team_message_reaches_team() {
    let server = start(Config::for_tests()).await;
    server.directory.add_team_member(7, 1).await.unwrap();
    server.directory.add_team_member(7, 2).await.unwrap();

    let mut alice = server.connect(1).await;
    let mut bob = server.connect(2).await;
    let mut carol = server.connect(3).await;
    server.wait_for_clients(3).await;

    send(&mut carol, &InboundFrame::to_team(7, "not on the team")).await;
    send(&mut alice, &InboundFrame::to_team(7, "standup")).await;

    let received = next_frame(&mut bob).await;
    assert_eq!(received.content, "standup");
    assert_eq!(received.team_id, Some(7));
    assert_silent(&mut carol).await;
}

#[tokio::test]
async fn rest_send_is_broadcast() {
    let server = start(Config::for_tests()).await;
    let direct = server
        .state
        .conversations
        .create_direct(1, 2)
        .await
        .unwrap();

    let mut bob = server.connect(2).await;
    server.wait_for_clients(1).await;

    let sent = server
        .state
        .messages
        .send_message(direct.id, 1, "over http")
        .await
        .unwrap();
    server.state.publish(&sent).await;

    assert_eq!(next_frame(&mut bob).await.id, sent.message.id);
}

#[tokio::test]
async fn bad_token_is_refused() {
    let server = start(Config::for_tests()).await;
    let result = connect_async(format!("ws://{}/ws?token=bogus", server.addr)).await;
    assert!(result.is_err());

    let result = connect_async(format!("ws://{}/ws", server.addr)).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn unknown_user_is_refused() {
    let server = start(Config::for_tests()).await;
    let token = server
        .state
        .tokens
        .issue(404, TokenTtl::hours(1))
        .unwrap();
    let result = connect_async(format!("ws://{}/ws?token={token}", server.addr)).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn oversized_frames_are_skipped_then_refused() {
    let mut config = Config::for_tests();
    config.limits.max_message_size = 1024;
    let server = start(config).await;
    let direct = server
        .state
        .conversations
        .create_direct(1, 2)
        .await
        .unwrap();

    let mut alice = server.connect(1).await;
    let mut bob = server.connect(2).await;
    server.wait_for_clients(2).await;

    // over the codec limit but under the socket ceiling
    send(
        &mut alice,
        &InboundFrame::to_conversation(direct.id, "x".repeat(2000)),
    )
    .await;
    send(&mut alice, &InboundFrame::to_conversation(direct.id, "fits")).await;
    assert_eq!(next_frame(&mut bob).await.content, "fits");

    // past the ceiling the socket itself gives up
    let _ = alice
        .send(Message::Text("y".repeat(8 * 1024)))
        .await;
    server.wait_for_clients(1).await;
}

#[tokio::test]
async fn expired_snapshot_closes_with_reconnect_code() {
    let mut config = Config::for_tests();
    config.session.snapshot_ttl_secs = 1;
    let server = start(config).await;

    let mut alice = server.connect(1).await;
    let close = loop {
        let message = tokio::time::timeout(Duration::from_secs(5), alice.next())
            .await
            .expect("connection was not closed")
            .expect("socket closed without a close frame")
            .unwrap();
        if let Message::Close(frame) = message {
            break frame;
        }
    };

    let code: u16 = close.expect("close frame without a code").code.into();
    assert_eq!(code, 4000);
    server.wait_for_clients(0).await;
}
