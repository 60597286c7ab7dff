//! RelayClient against an in-process WebSocket server standing in for the relay.

mod common;

use std::time::Duration;

use chrono::Utc;
use common::{collect_until, eventually, fast_backoff, wait_for, WAIT};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tally_bridge::vmix::{InputDescriptor, InputMap, InputSetSnapshot, TallySnapshot};
use tally_bridge::{
    ConnectionError, ConnectionState, DisconnectReason, RelayClient, RelayEvent, RelayOptions,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type ServerWs = WebSocketStream<TcpStream>;

fn options() -> RelayOptions {
    RelayOptions {
        connect_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_secs(3600),
        liveness_timeout: None,
        backoff: fast_backoff(),
    }
}

async fn listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    (listener, format!("ws://127.0.0.1:{port}/ws"))
}

/// Accept one WebSocket and return it with the request URI.
async fn accept(listener: &TcpListener) -> (ServerWs, String) {
    let (stream, _) = tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("client connected in time")
        .expect("accept");
    let mut uri = String::new();
    let ws = tokio_tungstenite::accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            uri = request.uri().to_string();
            Ok(response)
        },
    )
    .await
    .expect("handshake");
    (ws, uri)
}

/// Next text frame as JSON, skipping control frames.
async fn next_json(ws: &mut ServerWs) -> Value {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(&text).expect("client sends JSON");
                }
                Some(Ok(_)) => {}
                other => panic!("connection ended: {other:?}"),
            }
        }
    })
    .await
    .expect("frame in time")
}

async fn send_text(ws: &mut ServerWs, text: &str) {
    ws.send(Message::Text(text.to_string())).await.expect("send");
}

async fn connected(options: RelayOptions) -> (RelayClient, TcpListener, ServerWs, String) {
    let (listener, url) = listener().await;
    let client = RelayClient::new(options);
    let (result, (mut ws, _)) = tokio::join!(
        client.connect(&url, "studio", Some("tok")),
        accept(&listener)
    );
    result.expect("connects");
    let register = next_json(&mut ws).await;
    assert_eq!(register["type"], "register");
    (client, listener, ws, url)
}

fn inputs() -> InputMap {
    let mut inputs = InputMap::new();
    inputs.insert(3, InputDescriptor::new(3, "Stage Left", None, "Camera", "Running", "0"));
    inputs
}

#[tokio::test]
async fn test_registers_with_session_in_query_and_first_frame() {
    let (listener, url) = listener().await;
    let client = RelayClient::new(options());
    let mut events = client.subscribe();

    let (result, (mut ws, uri)) = tokio::join!(
        client.connect(&url, "studio", Some("tok")),
        accept(&listener)
    );
    result.expect("connects");

    assert!(uri.starts_with("/ws?"));
    assert!(uri.contains("sessionId=studio"));
    assert!(uri.contains("token=tok"));

    let register = next_json(&mut ws).await;
    assert_eq!(register["type"], "register");
    assert_eq!(register["sessionId"], "studio");
    assert_eq!(register["role"], "pd");
    assert!(register["timestamp"].is_string());

    assert!(matches!(events.try_recv(), Ok(RelayEvent::Connected)));
    let status = client.status();
    assert!(status.is_connected);
    assert_eq!(status.url.as_deref(), Some(url.as_str()));
    assert_eq!(status.session_id.as_deref(), Some("studio"));

    client.disconnect().await;
}

#[tokio::test]
async fn test_forwards_tally_and_inputs() {
    let (client, _listener, mut ws, _) = connected(options()).await;

    let tally = TallySnapshot {
        program: Some(3),
        preview: Some(1),
        inputs: inputs(),
        captured_at: Utc::now(),
        raw_status_line: None,
    };
    assert!(client.send_tally_data(&tally));

    let frame = next_json(&mut ws).await;
    assert_eq!(frame["type"], "tally_update");
    assert_eq!(frame["sessionId"], "studio");
    assert_eq!(frame["program"], 3);
    assert_eq!(frame["preview"], 1);
    assert_eq!(frame["inputs"]["3"]["title"], "Stage Left");
    assert_eq!(frame["vmixTimestamp"], tally.captured_at.timestamp_millis());

    let set = InputSetSnapshot {
        inputs: inputs(),
        device_version: "27.0".into(),
        captured_at: Utc::now(),
    };
    assert!(client.send_inputs_data(&set));

    let frame = next_json(&mut ws).await;
    assert_eq!(frame["type"], "inputs_update");
    assert_eq!(frame["vmixVersion"], "27.0");
    assert_eq!(frame["inputs"]["3"]["shortTitle"], "Stage Left");

    client.disconnect().await;
}

#[tokio::test]
async fn test_inbound_dispatch_survives_unknown_and_malformed_frames() {
    let (client, _listener, mut ws, _) = connected(options()).await;
    let mut events = client.subscribe();

    send_text(&mut ws, r#"{"type":"connected","clientId":"c-1"}"#).await;
    send_text(&mut ws, r#"{"type":"pong"}"#).await;
    send_text(&mut ws, r#"{"type":"viewer_count","count":4}"#).await;
    send_text(&mut ws, "{definitely not json").await;
    send_text(&mut ws, r#"{"type":"session_registered","sessionId":"studio"}"#).await;
    send_text(&mut ws, r#"{"type":"error","message":"quota exceeded"}"#).await;

    let seen = collect_until(&mut events, |e| matches!(e, RelayEvent::Error(_))).await;
    assert_eq!(seen.len(), 2);
    assert!(matches!(&seen[0], RelayEvent::SessionRegistered(m) if m["sessionId"] == "studio"));
    assert!(matches!(
        &seen[1],
        RelayEvent::Error(ConnectionError::Server(message)) if message == "quota exceeded"
    ));

    assert_eq!(client.status().connection_id.as_deref(), Some("c-1"));
    assert!(client.is_connected());

    // Still usable after the junk
    assert!(client.test_connection());
    assert_eq!(next_json(&mut ws).await["type"], "ping");

    client.disconnect().await;
}

#[tokio::test]
async fn test_transport_ping_is_answered() {
    let (client, _listener, mut ws, _) = connected(options()).await;

    ws.send(Message::Ping(vec![7, 7, 7])).await.expect("send ping");
    let pong = tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Pong(payload))) => return payload,
                Some(Ok(_)) => {}
                other => panic!("connection ended: {other:?}"),
            }
        }
    })
    .await
    .expect("pong in time");
    assert_eq!(pong, vec![7, 7, 7]);

    client.disconnect().await;
}

#[tokio::test]
async fn test_heartbeat_pings() {
    let (client, _listener, mut ws, _) = connected(RelayOptions {
        heartbeat_interval: Duration::from_millis(30),
        ..options()
    })
    .await;

    let ping = next_json(&mut ws).await;
    assert_eq!(ping["type"], "ping");
    assert!(ping["timestamp"].is_string());

    client.disconnect().await;
}

#[tokio::test]
async fn test_update_session_re_registers() {
    let (client, _listener, mut ws, _) = connected(options()).await;

    assert!(client.update_session("studio-b", None));
    let register = next_json(&mut ws).await;
    assert_eq!(register["type"], "register");
    assert_eq!(register["sessionId"], "studio-b");

    client.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_forgets_session_and_connection_id() {
    let (client, listener, mut ws, url) = connected(options()).await;

    send_text(&mut ws, r#"{"type":"connected","clientId":"c-1"}"#).await;
    eventually(|| client.status().connection_id.as_deref() == Some("c-1")).await;

    client.disconnect().await;
    let status = client.status();
    assert_eq!(status.session_id, None);
    assert_eq!(status.connection_id, None);

    let (result, (mut ws, _)) = tokio::join!(
        client.connect(&url, "studio2", None),
        accept(&listener)
    );
    result.expect("connects");
    let status = client.status();
    assert_eq!(status.session_id.as_deref(), Some("studio2"));
    assert_eq!(status.connection_id, None);

    let register = next_json(&mut ws).await;
    assert_eq!(register["sessionId"], "studio2");
    send_text(&mut ws, r#"{"type":"connected","clientId":"c-2"}"#).await;
    eventually(|| client.status().connection_id.as_deref() == Some("c-2")).await;

    client.disconnect().await;
}

#[tokio::test]
async fn test_reconnect_re_registers() {
    let (client, listener, mut ws, _) = connected(options()).await;
    let mut events = client.subscribe();

    send_text(&mut ws, r#"{"type":"connected","clientId":"c-1"}"#).await;
    eventually(|| client.status().connection_id.is_some()).await;
    drop(ws);

    wait_for(&mut events, |e| {
        matches!(e, RelayEvent::Disconnected(DisconnectReason::ConnectionLost))
    })
    .await;
    wait_for(&mut events, |e| matches!(e, RelayEvent::Reconnecting { attempt: 1, .. })).await;

    let (mut second, uri) = accept(&listener).await;
    assert!(uri.contains("sessionId=studio"));
    let register = next_json(&mut second).await;
    assert_eq!(register["type"], "register");
    assert_eq!(register["sessionId"], "studio");

    wait_for(&mut events, |e| matches!(e, RelayEvent::Connected)).await;
    let status = client.status();
    assert_eq!(status.reconnect_attempts, 0);
    // The old connection's id does not carry over
    assert_eq!(status.connection_id, None);

    // Sends made once Connected is reported reach the new socket
    assert!(client.test_connection());
    assert_eq!(next_json(&mut second).await["type"], "ping");

    client.disconnect().await;
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    let (client, listener, ws, _) = connected(options()).await;
    let mut events = client.subscribe();

    drop(listener);
    drop(ws);

    let seen = collect_until(&mut events, |e| matches!(e, RelayEvent::ReconnectExhausted { .. })).await;
    let attempts = seen
        .iter()
        .filter(|e| matches!(e, RelayEvent::Reconnecting { .. }))
        .count();
    assert_eq!(attempts, 3);
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let tally = TallySnapshot::from_status_code("1", InputMap::new());
    assert!(!client.send_tally_data(&tally));
}

#[tokio::test]
async fn test_silent_server_trips_liveness_timeout() {
    let (client, _listener, _ws, _) = connected(RelayOptions {
        liveness_timeout: Some(Duration::from_millis(100)),
        ..options()
    })
    .await;
    let mut events = client.subscribe();

    let seen = collect_until(&mut events, |e| {
        matches!(e, RelayEvent::Disconnected(DisconnectReason::ConnectionLost))
    })
    .await;
    assert!(seen
        .iter()
        .any(|e| matches!(e, RelayEvent::Error(ConnectionError::Transport(_)))));

    client.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_closes_and_stays_down() {
    let (client, listener, mut ws, _) = connected(options()).await;
    let mut events = client.subscribe();

    client.disconnect().await;

    let closed = tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    assert!(matches!(
        events.try_recv(),
        Ok(RelayEvent::Disconnected(DisconnectReason::Requested))
    ));
    assert!(!client.send_inputs_data(&InputSetSnapshot {
        inputs: InputMap::new(),
        device_version: "27".into(),
        captured_at: Utc::now(),
    }));

    let reconnect = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
    assert!(reconnect.is_err());
}

#[tokio::test]
async fn test_connect_timeout_without_handshake() {
    // Accepts TCP but never answers the WebSocket upgrade
    let (_listener, url) = listener().await;
    let client = RelayClient::new(RelayOptions {
        connect_timeout: Duration::from_millis(100),
        ..options()
    });

    let err = client.connect(&url, "s", None).await.unwrap_err();
    assert!(matches!(err, ConnectionError::ConnectTimeout { .. }));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_connect_while_connecting_is_rejected() {
    let (listener, url) = listener().await;
    let client = RelayClient::new(options());

    let first = client.connect(&url, "s", None);
    let second = async {
        eventually(|| client.state() == ConnectionState::Connecting).await;
        let tally = TallySnapshot::from_status_code("10", InputMap::new());
        assert!(!client.send_tally_data(&tally));
        assert!(!client.test_connection());
        client.connect(&url, "s", None).await
    };
    let (first, second, _server) = tokio::join!(first, second, accept(&listener));

    first.expect("first connect wins");
    assert_eq!(second.unwrap_err(), ConnectionError::AlreadyConnecting);

    client.disconnect().await;
}
