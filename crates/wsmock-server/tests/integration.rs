//! End-to-end tests driving `MockServer` with a real WebSocket client.

use std::collections::HashSet;
use std::time::Duration;

use assert_matches::assert_matches;
use futures::future::join_all;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use wsmock_server::{Matcher, MessageFrame, MockError, MockServer, MockServerConfig, Responder};

const TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

fn client_ids(server: &MockServer) -> HashSet<String> {
    server
        .list_clients()
        .into_iter()
        .map(|info| info.client_id.as_str().to_owned())
        .collect()
}

/// Connect a client and wait until the server has registered it.
async fn connect(server: &MockServer) -> (WsStream, String) {
    let before = client_ids(server);
    let (ws, _) = timeout(TIMEOUT, connect_async(server.url()))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    let id = timeout(TIMEOUT, async {
        loop {
            if let Some(id) = client_ids(server).difference(&before).next() {
                return id.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client never registered");
    (ws, id)
}

/// Next text or binary message, skipping control frames.
async fn next_data(ws: &mut WsStream) -> Message {
    timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(msg)) => return msg,
                other => panic!("stream ended: {other:?}"),
            }
        }
    })
    .await
    .expect("no message within timeout")
}

async fn next_text(ws: &mut WsStream) -> String {
    match next_data(ws).await {
        Message::Text(t) => t.as_str().to_owned(),
        other => panic!("expected text, got {other:?}"),
    }
}

/// Assert no data frame arrives for a short while.
async fn assert_silent(ws: &mut WsStream) {
    let res = timeout(QUIET, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                other => return other,
            }
        }
    })
    .await;
    assert!(res.is_err(), "unexpected frame: {res:?}");
}

/// Wait until the stream reports close, error, or end.
async fn assert_closed(ws: &mut WsStream) {
    timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_) | Ok(Message::Close(_))) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await
    .expect("connection was not closed");
}

/// Poll received history until it holds at least `n` frames.
async fn received_at_least(server: &MockServer, id: Option<&str>, n: usize) -> Vec<MessageFrame> {
    timeout(TIMEOUT, async {
        loop {
            let frames = server.received_messages(id).await.unwrap();
            if frames.len() >= n {
                return frames;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("history never filled")
}

async fn wait_for_count(server: &MockServer, n: usize) {
    timeout(TIMEOUT, async {
        while server.num_connections() != n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection count never reached target");
}

// ── Instances ──

#[tokio::test]
async fn concurrent_starts_get_distinct_ports() {
    let servers: Vec<MockServer> = join_all((0..10).map(|_| MockServer::start()))
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    let ports: HashSet<u16> = servers.iter().map(MockServer::port).collect();
    let urls: HashSet<&str> = servers.iter().map(MockServer::url).collect();
    assert_eq!(ports.len(), 10);
    assert_eq!(urls.len(), 10);

    for server in &servers {
        server.stop().await;
    }
}

#[tokio::test]
async fn instances_are_isolated() {
    let a = MockServer::start().await.unwrap();
    let b = MockServer::start().await.unwrap();
    a.reply_with("ping", "from a");

    let (mut ws_b, id_b) = connect(&b).await;
    ws_b.send(Message::text("ping")).await.unwrap();
    assert_silent(&mut ws_b).await;

    assert_eq!(a.num_connections(), 0);
    assert_eq!(b.num_connections(), 1);
    assert_matches!(
        a.send_message(&id_b, "x"),
        Err(MockError::ClientNotFound { .. })
    );

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn occupied_port_fails_with_port_bind() {
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let taken = blocker.local_addr().unwrap().port();
    let config = MockServerConfig {
        max_bind_attempts: 3,
        ..MockServerConfig::default()
    }
    .with_port_range(taken..=taken);

    let err = MockServer::start_with(config).await.unwrap_err();
    assert_matches!(err, MockError::PortBind { attempts: 3, last_port, .. } if last_port == taken);
}

#[tokio::test]
async fn custom_path_is_served() {
    let config = MockServerConfig {
        path: "/socket".into(),
        ..MockServerConfig::default()
    };
    let server = MockServer::start_with(config).await.unwrap();
    assert!(server.url().ends_with("/socket"));
    let (_ws, _id) = connect(&server).await;
    assert!(server.is_connected());
    server.stop().await;
}

// ── Auto-replies ──

#[tokio::test]
async fn exact_rule_replies_ping_with_pong() {
    let server = MockServer::start().await.unwrap();
    server.reply_with("ping", "pong");
    let (mut ws, _id) = connect(&server).await;

    ws.send(Message::text("ping")).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "pong");

    ws.send(Message::text("something else")).await.unwrap();
    assert_silent(&mut ws).await;

    server.stop().await;
}

#[tokio::test]
async fn exact_rule_takes_precedence_over_filter() {
    let server = MockServer::start().await.unwrap();
    server.reply_with(Matcher::predicate(|_: &MessageFrame| true), "filter");
    server.reply_with("ping", "exact");
    let (mut ws, _id) = connect(&server).await;

    ws.send(Message::text("ping")).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "exact");

    ws.send(Message::text("other")).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "filter");

    server.stop().await;
}

#[tokio::test]
async fn first_registered_filter_wins() {
    let server = MockServer::start().await.unwrap();
    server.reply_with(
        Matcher::predicate(|f: &MessageFrame| f.as_text().is_some_and(|t| t.starts_with('a'))),
        "first",
    );
    server.reply_with(Matcher::predicate(|_: &MessageFrame| true), "second");
    let (mut ws, _id) = connect(&server).await;

    ws.send(Message::text("abc")).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "first");
    ws.send(Message::text("xyz")).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "second");

    server.stop().await;
}

#[tokio::test]
async fn filter_transform_builds_reply_from_inbound() {
    let server = MockServer::start().await.unwrap();
    server.reply_with(
        Matcher::predicate(|f: &MessageFrame| f.as_text().is_some_and(|t| t.starts_with("ping"))),
        Responder::transform(|f: &MessageFrame| {
            format!("{} pong", f.as_text().unwrap_or_default())
        }),
    );
    let (mut ws, id) = connect(&server).await;

    ws.send(Message::text("ping")).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "ping pong");

    let sent = server.sent_messages(Some(&id)).await.unwrap();
    assert_eq!(sent, vec![MessageFrame::text("ping pong")]);

    server.stop().await;
}

#[tokio::test]
async fn structured_rule_ignores_key_order() {
    let server = MockServer::start().await.unwrap();
    server.reply_with(json!({"a": 1, "b": 2}), json!({"ok": true}));
    let (mut ws, id) = connect(&server).await;

    ws.send(Message::text(r#"{"b": 2, "a": 1}"#)).await.unwrap();
    let reply: Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(reply, json!({"ok": true}));

    let received = server.received_messages(Some(&id)).await.unwrap();
    assert_eq!(received, vec![MessageFrame::structured(json!({"a": 1, "b": 2}))]);

    server.stop().await;
}

#[tokio::test]
async fn binary_rule_replies_with_binary() {
    let server = MockServer::start().await.unwrap();
    server.reply_with(MessageFrame::binary(vec![1, 2, 3]), MessageFrame::binary(vec![4, 5]));
    let (mut ws, _id) = connect(&server).await;

    ws.send(Message::binary(vec![1, 2, 3])).await.unwrap();
    match next_data(&mut ws).await {
        Message::Binary(b) => assert_eq!(b.as_ref(), &[4, 5]),
        other => panic!("expected binary, got {other:?}"),
    }

    // Same bytes as text are a different frame.
    ws.send(Message::text("\u{1}\u{2}\u{3}")).await.unwrap();
    assert_silent(&mut ws).await;

    server.stop().await;
}

#[tokio::test]
async fn client_ping_is_recorded_and_matched() {
    let server = MockServer::start().await.unwrap();
    server.reply_with(MessageFrame::ping(b"hb".to_vec()), "heartbeat seen");
    let (mut ws, id) = connect(&server).await;

    ws.send(Message::Ping(b"hb".to_vec().into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "heartbeat seen");

    let received = received_at_least(&server, Some(&id), 1).await;
    assert_eq!(received, vec![MessageFrame::ping(b"hb".to_vec())]);

    server.stop().await;
}

#[tokio::test]
async fn rule_added_mid_session_applies_to_later_frames() {
    let server = MockServer::start().await.unwrap();
    let (mut ws, _id) = connect(&server).await;

    ws.send(Message::text("ping")).await.unwrap();
    assert_silent(&mut ws).await;

    server.reply_with("ping", "pong");
    ws.send(Message::text("ping")).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "pong");

    server.clear_rules();
    ws.send(Message::text("ping")).await.unwrap();
    assert_silent(&mut ws).await;

    server.stop().await;
}

#[tokio::test]
async fn panicking_predicate_is_treated_as_no_match() {
    let server = MockServer::start().await.unwrap();
    server.reply_with(
        Matcher::predicate(|_: &MessageFrame| panic!("predicate blew up")),
        "never",
    );
    server.reply_with(Matcher::predicate(|_: &MessageFrame| true), "fallback");
    let (mut ws, _id) = connect(&server).await;

    ws.send(Message::text("x")).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "fallback");
    assert_eq!(server.num_connections(), 1);

    server.stop().await;
}

// ── Explicit sends ──

#[tokio::test]
async fn send_message_delivers_exact_frame() {
    let server = MockServer::start().await.unwrap();
    let (mut ws, id) = connect(&server).await;

    server.send_message(&id, "Hello!").unwrap();
    assert_eq!(next_text(&mut ws).await, "Hello!");
    assert_silent(&mut ws).await;

    let sent = server.sent_messages(Some(&id)).await.unwrap();
    assert_eq!(sent, vec![MessageFrame::text("Hello!")]);

    server.stop().await;
}

#[tokio::test]
async fn send_json_delivers_structured_text() {
    let server = MockServer::start().await.unwrap();
    let (mut ws, id) = connect(&server).await;

    server
        .send_json(&id, &json!({"kind": "update", "items": [1, 2]}))
        .unwrap();
    let got: Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(got, json!({"items": [1, 2], "kind": "update"}));

    server.stop().await;
}

#[tokio::test]
async fn send_message_round_trips_nested_structure() {
    let server = MockServer::start().await.unwrap();
    let (mut ws, id) = connect(&server).await;

    let original = json!({
        "user": {"name": "ada", "roles": ["admin", "dev"]},
        "items": [{"id": 1, "tags": []}, {"id": 2, "tags": ["x"]}],
        "active": true,
    });
    server.send_message(&id, original.clone()).unwrap();

    let got: Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(got, original);
    assert_eq!(
        server.sent_messages(Some(&id)).await.unwrap(),
        vec![MessageFrame::structured(original)]
    );

    server.stop().await;
}

#[tokio::test]
async fn oversized_ping_is_invalid_payload() {
    let server = MockServer::start().await.unwrap();
    let (mut ws, id) = connect(&server).await;

    let err = server
        .send_message(&id, MessageFrame::ping(vec![0u8; 200]))
        .unwrap_err();
    assert_matches!(err, MockError::InvalidPayload(_));
    assert_silent(&mut ws).await;
    assert!(server.sent_messages(Some(&id)).await.unwrap().is_empty());
    assert!(server.is_connected());

    server.stop().await;
}

#[tokio::test]
async fn unknown_client_is_not_found() {
    let server = MockServer::start().await.unwrap();
    let (_ws, _id) = connect(&server).await;

    assert_matches!(
        server.send_message("nonexistent-id", "hi"),
        Err(MockError::ClientNotFound { client_id }) if client_id == "nonexistent-id"
    );
    assert_matches!(
        server.sent_messages(Some("nonexistent-id")).await,
        Err(MockError::ClientNotFound { .. })
    );

    server.stop().await;
}

// ── Histories ──

#[tokio::test]
async fn received_history_preserves_arrival_order() {
    let server = MockServer::start().await.unwrap();
    let (mut ws, id) = connect(&server).await;

    for text in ["one", "two", "three"] {
        ws.send(Message::text(text)).await.unwrap();
    }
    let received = received_at_least(&server, Some(&id), 3).await;
    assert_eq!(
        received,
        vec![
            MessageFrame::text("one"),
            MessageFrame::text("two"),
            MessageFrame::text("three"),
        ]
    );

    server.stop().await;
}

#[tokio::test]
async fn aggregate_history_spans_all_clients() {
    let server = MockServer::start().await.unwrap();
    let (mut ws_a, id_a) = connect(&server).await;
    let (mut ws_b, id_b) = connect(&server).await;

    ws_a.send(Message::text("from a")).await.unwrap();
    ws_b.send(Message::text("from b")).await.unwrap();
    let _ = received_at_least(&server, Some(&id_a), 1).await;
    let _ = received_at_least(&server, Some(&id_b), 1).await;

    let all = server.received_messages(None).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.contains(&MessageFrame::text("from a")));
    assert!(all.contains(&MessageFrame::text("from b")));

    server.send_message(&id_a, "to a").unwrap();
    assert_eq!(next_text(&mut ws_a).await, "to a");
    assert_eq!(
        server.sent_messages(None).await.unwrap(),
        vec![MessageFrame::text("to a")]
    );

    server.stop().await;
}

// ── Lifecycle ──

#[tokio::test]
async fn clients_are_listed_then_removed_on_disconnect() {
    let server = MockServer::start().await.unwrap();
    let (mut ws_a, id_a) = connect(&server).await;
    let (ws_b, id_b) = connect(&server).await;

    assert!(server.wait_for_connections(2, TIMEOUT).await);
    let clients = server.list_clients();
    assert_eq!(clients.len(), 2);
    assert!(clients.iter().all(|c| c.alive));
    let listed: HashSet<String> = clients.iter().map(|c| c.client_id.to_string()).collect();
    assert_eq!(listed, HashSet::from([id_a.clone(), id_b]));

    ws_a.close(None).await.unwrap();
    wait_for_count(&server, 1).await;
    assert_matches!(
        server.send_message(&id_a, "late"),
        Err(MockError::ClientNotFound { .. })
    );

    drop(ws_b);
    wait_for_count(&server, 0).await;
    assert!(!server.is_connected());

    server.stop().await;
}

#[tokio::test]
async fn disconnect_client_closes_from_server_side() {
    let server = MockServer::start().await.unwrap();
    let (mut ws, id) = connect(&server).await;

    server.disconnect_client(&id).unwrap();
    assert_closed(&mut ws).await;
    wait_for_count(&server, 0).await;

    server.stop().await;
}

#[tokio::test]
async fn stop_drops_clients_and_listener() {
    let server = MockServer::start().await.unwrap();
    let (mut ws, _id) = connect(&server).await;
    let url = server.url().to_owned();

    server.stop().await;
    assert_closed(&mut ws).await;
    assert_eq!(server.num_connections(), 0);
    assert!(connect_async(url.as_str()).await.is_err());

    // Second stop is a no-op.
    server.stop().await;
}

/// Queue 1 MiB frames to a client that never reads until the worker stalls.
///
/// Returns once the mailbox has stayed full for a while, which means the
/// worker is stuck writing to the peer.
async fn stall_worker(server: &MockServer, id: &str) {
    let frame = MessageFrame::binary(vec![0u8; 1 << 20]);
    let started = std::time::Instant::now();
    let mut consecutive_full = 0;
    for _ in 0..1_000 {
        let attempt = std::time::Instant::now();
        match server.send_message(id, frame.clone()) {
            Ok(()) => consecutive_full = 0,
            Err(MockError::MailboxFull { .. }) => consecutive_full += 1,
            Err(other) => panic!("unexpected send error: {other}"),
        }
        assert!(attempt.elapsed() < Duration::from_millis(100), "send_message blocked");
        if consecutive_full >= 20 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("worker never stalled after {:?}", started.elapsed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backed_up_client_does_not_block_sends() {
    let config = MockServerConfig {
        mailbox_capacity: 4,
        query_timeout_ms: 200,
        ..MockServerConfig::default()
    };
    let server = MockServer::start_with(config).await.unwrap();
    let (_ws, id) = connect(&server).await;

    stall_worker(&server, &id).await;
    assert_matches!(
        server.send_message(&id, "one more"),
        Err(MockError::MailboxFull { client_id }) if client_id == id
    );

    // History queries against the stalled worker degrade to empty.
    let history = timeout(TIMEOUT, server.received_messages(Some(&id)))
        .await
        .expect("history query blocked");
    assert!(history.unwrap().is_empty());

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_terminates_worker_stuck_writing() {
    let config = MockServerConfig {
        mailbox_capacity: 4,
        shutdown_timeout_ms: 5_000,
        ..MockServerConfig::default()
    };
    let server = MockServer::start_with(config).await.unwrap();
    let (_ws, id) = connect(&server).await;
    stall_worker(&server, &id).await;

    let started = std::time::Instant::now();
    timeout(TIMEOUT, server.stop()).await.expect("stop hung");
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "stop waited for the full shutdown timeout"
    );
    assert_eq!(server.num_connections(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_reaches_worker_stuck_writing() {
    let config = MockServerConfig {
        mailbox_capacity: 4,
        ..MockServerConfig::default()
    };
    let server = MockServer::start_with(config).await.unwrap();
    let (_ws, id) = connect(&server).await;
    stall_worker(&server, &id).await;

    server.disconnect_client(&id).unwrap();
    wait_for_count(&server, 0).await;

    server.stop().await;
}

#[tokio::test]
async fn wait_for_connections_times_out_without_clients() {
    let server = MockServer::start().await.unwrap();
    assert!(!server.wait_for_connections(1, QUIET).await);
    server.stop().await;
}
