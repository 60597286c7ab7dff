//! WebSocket transport for the relay connection.
//!
//! Wraps `tokio-tungstenite` in a writer/reader pair so the relay client's
//! `tokio::select!` loop never touches tungstenite types directly, and
//! builds the relay endpoint URL from configuration.

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio_tungstenite::tungstenite::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Inbound frame, reduced to what the relay protocol uses.
#[derive(Debug, PartialEq, Eq)]
pub enum WsMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Close frame; the reason is empty when the peer sent none.
    Close {
        /// Close code (1005 when absent).
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// Ping, pong, binary or raw frame. Pings are answered by tungstenite
    /// itself on the next read or write.
    Other,
}

/// Write half.
#[derive(Debug)]
pub struct WsWriter {
    sink: SplitSink<WsStream, Message>,
}

impl WsWriter {
    /// Send a text frame.
    ///
    /// # Errors
    ///
    /// Fails if the connection is closed or the write errors.
    pub async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink
            .send(Message::Text(text))
            .await
            .context("failed to send text frame")
    }

    /// Send a close frame and close the sink.
    ///
    /// # Errors
    ///
    /// Fails if the close handshake cannot be written.
    pub async fn close(&mut self) -> Result<()> {
        self.sink
            .send(Message::Close(None))
            .await
            .context("failed to send close frame")?;
        self.sink.close().await.context("failed to close sink")
    }
}

/// Read half.
#[derive(Debug)]
pub struct WsReader {
    stream: SplitStream<WsStream>,
}

impl WsReader {
    /// Next frame, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<Result<WsMessage>> {
        let message = match self.stream.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(anyhow::Error::new(e).context("WebSocket read failed"))),
        };

        Some(Ok(match message {
            Message::Text(text) => WsMessage::Text(text),
            Message::Close(frame) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.into_owned()))
                    .unwrap_or((1005, String::new()));
                WsMessage::Close { code, reason }
            }
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {
                WsMessage::Other
            }
        }))
    }
}

/// Open a WebSocket to `url` and split it.
///
/// # Errors
///
/// Fails on an invalid URL, DNS/TCP/TLS failure or a rejected handshake.
pub async fn connect(url: &Url) -> Result<(WsWriter, WsReader)> {
    let (stream, response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .with_context(|| format!("WebSocket handshake with {} failed", redact(url)))?;
    log::debug!("[Relay] Handshake complete ({})", response.status());

    let (sink, stream) = stream.split();
    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Build the relay endpoint URL.
///
/// `http(s)` schemes become `ws(s)`. `sessionId` and, when present,
/// `token` are set as query parameters, replacing any existing values and
/// keeping every other parameter.
///
/// # Errors
///
/// Fails if `base` does not parse or uses a scheme other than
/// `ws`, `wss`, `http` or `https`.
pub fn build_relay_url(base: &str, session_id: &str, token: Option<&str>) -> Result<Url> {
    let mut url = Url::parse(base).with_context(|| format!("invalid relay URL: {base}"))?;

    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => anyhow::bail!("unsupported relay URL scheme: {other}"),
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        anyhow::bail!("cannot convert {base} to a WebSocket URL");
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != "sessionId" && key != "token")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    {
        let mut query = url.query_pairs_mut();
        query.clear();
        query.extend_pairs(kept);
        query.append_pair("sessionId", session_id);
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            query.append_pair("token", token);
        }
    }

    Ok(url)
}

/// URL safe for logs: the token value is masked.
#[must_use]
pub fn redact(url: &Url) -> String {
    let mut shown = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| {
            let value = if key == "token" {
                "***".to_string()
            } else {
                value.into_owned()
            };
            (key.into_owned(), value)
        })
        .collect();
    if !pairs.is_empty() {
        shown.query_pairs_mut().clear().extend_pairs(pairs);
    }
    shown.to_string()
}
