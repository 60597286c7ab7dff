//! End to end: fake mixer -> Bridge -> fake relay.

mod common;

use std::time::Duration;

use common::WAIT;
use futures_util::StreamExt;
use serde_json::Value;
use tally_bridge::{Bridge, BridgeSettings, RelayClient, VmixClient, VmixOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

async fn next_json<S>(ws: &mut S) -> Value
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).expect("JSON"),
                Some(Ok(_)) => {}
                other => panic!("relay connection ended: {other:?}"),
            }
        }
    })
    .await
    .expect("frame in time")
}

#[tokio::test]
async fn test_forwards_mixer_tally_to_relay() {
    let mixer = TcpListener::bind("127.0.0.1:0").await.expect("bind mixer");
    let relay = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");

    let settings = BridgeSettings {
        vmix_host: "127.0.0.1".into(),
        vmix_port: mixer.local_addr().expect("addr").port(),
        relay_url: format!("ws://127.0.0.1:{}/ws", relay.local_addr().expect("addr").port()),
        session_id: "studio".into(),
        auth_token: None,
        auto_connect: false,
    };
    let bridge = Bridge::new(
        VmixClient::new(VmixOptions {
            xml_poll_interval: Duration::from_secs(3600),
            backup_interval: None,
            ..VmixOptions::default()
        }),
        RelayClient::default(),
    );

    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();
    let running = tokio::spawn(async move { bridge.run(&settings, &stop).await });

    // Relay comes up first
    let (stream, _) = tokio::time::timeout(WAIT, relay.accept())
        .await
        .expect("relay dialed")
        .expect("accept");
    let mut ws = tokio_tungstenite::accept_async(stream).await.expect("handshake");
    assert_eq!(next_json(&mut ws).await["type"], "register");

    // Then the mixer
    let (stream, _) = tokio::time::timeout(WAIT, mixer.accept())
        .await
        .expect("mixer dialed")
        .expect("accept");
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    assert_eq!(lines.next_line().await.expect("read").as_deref(), Some("SUBSCRIBE TALLY"));

    writer
        .write_all(b"<vmix><version>27</version><inputs><input number=\"1\" title=\"Cam\" state=\"Running\"/></inputs></vmix>\r\n")
        .await
        .expect("write");

    let inputs = next_json(&mut ws).await;
    assert_eq!(inputs["type"], "inputs_update");
    assert_eq!(inputs["sessionId"], "studio");
    assert_eq!(inputs["inputs"]["1"]["title"], "Cam");

    let tally = next_json(&mut ws).await;
    assert_eq!(tally["type"], "tally_update");
    assert_eq!(tally["program"], 1);

    writer.write_all(b"0120\r\n").await.expect("write");
    let tally = next_json(&mut ws).await;
    assert_eq!(tally["program"], 2);
    assert_eq!(tally["preview"], 3);

    shutdown.cancel();
    tokio::time::timeout(WAIT, running)
        .await
        .expect("bridge stops")
        .expect("no panic")
        .expect("clean exit");

    // Mixer gets unsubscribed on the way out
    let mut rest = Vec::new();
    while let Ok(Some(line)) = lines.next_line().await {
        rest.push(line);
    }
    assert!(rest.iter().any(|l| l == "UNSUBSCRIBE TALLY"));
}
