//! Persistent WebSocket client for the tally relay.
//!
//! # Architecture
//!
//! ```text
//!   RelayClient (handle)                  connection task (one per connect())
//!         │                                       │
//!         │ connect() ── handshake + register ───►│ select! {
//!         │ send_tally_data() ── Outbound ───────►│   inbound frames → dispatch
//!         │ send_inputs_data() ── Outbound ──────►│   30s heartbeat ping
//!         │ disconnect() ── cancel token ────────►│   liveness deadline
//!         │                                       │   outbound queue
//!         │◄─────── broadcast<RelayEvent> ────────│ }
//!                                                 │ on close: backoff + reconnect
//!                                                 │ (re-registers the session)
//! ```
//!
//! `send_*` never block: they queue an envelope for the task and report
//! whether the connection was open when they did.

// Rust guideline compliant 2026-02

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Url;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, Instant, MissedTickBehavior, Sleep};

use super::messages::{InboundMessage, OutboundMessage};
use crate::backoff::Backoff;
use crate::connection::{
    establish, join_with_grace, lock, sleep_unless_cancelled, ConnectionError, ConnectionState,
    DisconnectReason, Lifecycle, ReconnectPlan, Ticket,
};
use crate::constants::{
    CONNECT_TIMEOUT, EVENT_CHANNEL_CAPACITY, HEARTBEAT_INTERVAL, LIVENESS_TIMEOUT,
    SHUTDOWN_GRACE,
};
use crate::vmix::{InputSetSnapshot, TallySnapshot};
use crate::ws::{self, WsMessage, WsReader, WsWriter};

/// Tunables for [`RelayClient`].
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Handshake timeout.
    pub connect_timeout: Duration,
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// Treat the connection as lost after this long without any inbound
    /// frame. `None` relies on transport close/error signaling only.
    pub liveness_timeout: Option<Duration>,
    /// Reconnect schedule.
    pub backoff: Backoff,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            liveness_timeout: Some(LIVENESS_TIMEOUT),
            backoff: Backoff::default(),
        }
    }
}

/// Event emitted by [`RelayClient`].
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// Connected and registered (also after every successful reconnect).
    Connected,
    /// Non-terminal error, including server-reported errors.
    Error(ConnectionError),
    /// The connection went down.
    Disconnected(DisconnectReason),
    /// The server acknowledged the session registration.
    SessionRegistered(serde_json::Value),
    /// A reconnect is scheduled.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// Reconnection gave up; call `connect()` again to recover.
    ReconnectExhausted {
        /// Attempts made.
        attempts: u32,
    },
}

/// Snapshot of the client's connection status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStatus {
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Shorthand for `state == Connected`.
    pub is_connected: bool,
    /// Relay URL of the last `connect()`, as given.
    pub url: Option<String>,
    /// Current session id.
    pub session_id: Option<String>,
    /// Server-assigned connection id, once acknowledged.
    pub connection_id: Option<String>,
    /// Reconnect attempts since the last successful connect.
    pub reconnect_attempts: u32,
}

/// Session credentials and server-assigned identity.
#[derive(Clone)]
struct RelaySession {
    session_id: String,
    auth_token: Option<String>,
    connection_id: Option<String>,
}

impl std::fmt::Debug for RelaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySession")
            .field("session_id", &self.session_id)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "***"))
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

#[derive(Debug)]
struct Shared {
    lifecycle: Lifecycle,
    url: Option<String>,
    session: Option<RelaySession>,
    outbound: Option<mpsc::UnboundedSender<OutboundMessage>>,
}

impl Shared {
    /// Endpoint for the current URL and session.
    fn endpoint(&self) -> Result<(Url, String), ConnectionError> {
        let base = self.url.clone().unwrap_or_default();
        let session = self.session.as_ref();
        let session_id = session.map(|s| s.session_id.clone()).unwrap_or_default();
        let token = session.and_then(|s| s.auth_token.as_deref());

        let url = ws::build_relay_url(&base, &session_id, token).map_err(|e| {
            ConnectionError::Connect {
                target: base.clone(),
                reason: format!("{e:#}"),
            }
        })?;
        Ok((url, session_id))
    }
}

#[derive(Debug)]
struct Inner {
    shared: Mutex<Shared>,
    events: broadcast::Sender<RelayEvent>,
    options: RelayOptions,
}

impl Inner {
    fn emit(&self, event: RelayEvent) {
        let _ = self.events.send(event);
    }
}

/// An open, registered connection.
struct Socket {
    writer: WsWriter,
    reader: WsReader,
}

#[derive(Debug, PartialEq, Eq)]
enum SessionExit {
    Shutdown,
    Lost,
}

/// Client for the relay WebSocket protocol.
///
/// Dropping the client cancels its connection task.
#[derive(Debug)]
pub struct RelayClient {
    inner: Arc<Inner>,
}

impl Default for RelayClient {
    fn default() -> Self {
        Self::new(RelayOptions::default())
    }
}

impl RelayClient {
    /// Create an idle client.
    #[must_use]
    pub fn new(options: RelayOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let backoff = options.backoff.clone();
        Self {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared {
                    lifecycle: Lifecycle::new(backoff),
                    url: None,
                    session: None,
                    outbound: None,
                }),
                events,
                options,
            }),
        }
    }

    /// Subscribe to client events.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.inner.events.subscribe()
    }

    /// Connect, register the session and start the heartbeat.
    ///
    /// Resolves immediately if already connected. Fails with
    /// [`ConnectionError::AlreadyConnecting`] if a connect is in flight.
    pub async fn connect(
        &self,
        url: &str,
        session_id: &str,
        auth_token: Option<&str>,
    ) -> Result<(), ConnectionError> {
        let (ticket, endpoint) = {
            let mut shared = lock(&self.inner.shared);
            let Some(ticket) = shared.lifecycle.begin_connect()? else {
                log::debug!("[Relay] connect() while connected, nothing to do");
                return Ok(());
            };
            shared.url = Some(url.to_string());
            shared.session = Some(RelaySession {
                session_id: session_id.to_string(),
                auth_token: auth_token.map(str::to_string),
                connection_id: None,
            });
            (ticket, shared.endpoint())
        };

        let result = match endpoint {
            Ok((endpoint, session_id)) => {
                log::info!("[Relay] Connecting to {}", ws::redact(&endpoint));
                open_socket(&self.inner, &endpoint, &session_id, &ticket).await
            }
            Err(e) => Err(e),
        };

        let socket = match result {
            Ok(socket) => socket,
            Err(e) => {
                let current = lock(&self.inner.shared)
                    .lifecycle
                    .transition(ticket.generation, ConnectionState::Disconnected);
                if current {
                    log::error!("[Relay] Connection failed: {}", e);
                    self.inner.emit(RelayEvent::Error(e.clone()));
                }
                return Err(e);
            }
        };

        {
            let mut shared = lock(&self.inner.shared);
            if !shared.lifecycle.mark_connected(ticket.generation) {
                return Err(ConnectionError::Cancelled);
            }
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            shared.outbound = Some(outbound_tx);

            log::info!("[Relay] Connected, registered session {}", session_id);
            self.inner.emit(RelayEvent::Connected);

            let task = tokio::spawn(run_connection_loop(
                Arc::clone(&self.inner),
                ticket.clone(),
                socket,
                outbound_rx,
            ));
            shared.lifecycle.attach_task(ticket.generation, task);
        }
        Ok(())
    }

    /// Disconnect and stay disconnected.
    ///
    /// Stops the heartbeat and any pending reconnect, closes the socket and
    /// forgets the session. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let (previous, task) = {
            let mut shared = lock(&self.inner.shared);
            shared.outbound = None;
            shared.session = None;
            shared.lifecycle.shutdown()
        };

        if let Some(task) = task {
            join_with_grace(task, SHUTDOWN_GRACE).await;
        }

        if previous != ConnectionState::Disconnected {
            log::info!("[Relay] Disconnected");
            self.inner
                .emit(RelayEvent::Disconnected(DisconnectReason::Requested));
        }
    }

    /// Forward a tally snapshot.
    ///
    /// Returns `false` (and logs) when not connected.
    pub fn send_tally_data(&self, snapshot: &TallySnapshot) -> bool {
        let sent = self.queue(|session_id| OutboundMessage::tally(session_id, snapshot));
        if sent {
            log::debug!(
                "[Relay] Tally update queued (program={:?}, preview={:?})",
                snapshot.program,
                snapshot.preview
            );
        }
        sent
    }

    /// Forward an input set.
    ///
    /// Returns `false` (and logs) when not connected.
    pub fn send_inputs_data(&self, snapshot: &InputSetSnapshot) -> bool {
        let sent = self.queue(|session_id| OutboundMessage::inputs(session_id, snapshot));
        if sent {
            log::debug!("[Relay] Inputs update queued ({} inputs)", snapshot.inputs.len());
        }
        sent
    }

    /// Replace the session credentials; re-registers right away if connected.
    ///
    /// The new session is also what later reconnects register with. The
    /// connection id is kept since the socket stays the same. Returns
    /// whether a re-registration was queued.
    pub fn update_session(&self, session_id: &str, auth_token: Option<&str>) -> bool {
        {
            let mut shared = lock(&self.inner.shared);
            let connection_id = shared.session.take().and_then(|s| s.connection_id);
            shared.session = Some(RelaySession {
                session_id: session_id.to_string(),
                auth_token: auth_token.map(str::to_string),
                connection_id,
            });
        }
        log::info!("[Relay] Session updated to {}", session_id);
        self.queue(OutboundMessage::register)
    }

    /// Send one heartbeat ping now. `false` if not connected.
    pub fn test_connection(&self) -> bool {
        self.queue(|_| OutboundMessage::ping())
    }

    fn queue(&self, build: impl FnOnce(&str) -> OutboundMessage) -> bool {
        let shared = lock(&self.inner.shared);
        let (Some(session), Some(outbound)) = (&shared.session, &shared.outbound) else {
            log::warn!("[Relay] Not connected, message not sent");
            return false;
        };
        if shared.lifecycle.state() != ConnectionState::Connected {
            log::warn!(
                "[Relay] Not connected ({}), message not sent",
                shared.lifecycle.state()
            );
            return false;
        }
        outbound.send(build(&session.session_id)).is_ok()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.shared).lifecycle.state()
    }

    /// Whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connection status for diagnostics.
    pub fn status(&self) -> RelayStatus {
        let shared = lock(&self.inner.shared);
        let state = shared.lifecycle.state();
        RelayStatus {
            state,
            is_connected: state == ConnectionState::Connected,
            url: shared.url.clone(),
            session_id: shared.session.as_ref().map(|s| s.session_id.clone()),
            connection_id: shared
                .session
                .as_ref()
                .and_then(|s| s.connection_id.clone()),
            reconnect_attempts: shared.lifecycle.attempts(),
        }
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        lock(&self.inner.shared).lifecycle.shutdown();
    }
}

/// Handshake and send `register` as the first frame.
async fn open_socket(
    inner: &Inner,
    endpoint: &Url,
    session_id: &str,
    ticket: &Ticket,
) -> Result<Socket, ConnectionError> {
    let target = ws::redact(endpoint);
    let (mut writer, reader) = establish(
        &target,
        inner.options.connect_timeout,
        &ticket.cancel,
        ws::connect(endpoint),
    )
    .await?;

    let register = OutboundMessage::register(session_id)
        .to_json()
        .map_err(|e| ConnectionError::Connect {
            target: target.clone(),
            reason: format!("failed to encode register: {e}"),
        })?;
    writer
        .send_text(register)
        .await
        .map_err(|e| ConnectionError::Connect {
            target,
            reason: format!("{e:#}"),
        })?;

    Ok(Socket { writer, reader })
}

async fn run_connection_loop(
    inner: Arc<Inner>,
    ticket: Ticket,
    mut socket: Socket,
    mut outbound: mpsc::UnboundedReceiver<OutboundMessage>,
) {
    loop {
        if run_session(&inner, &ticket, socket, &mut outbound).await == SessionExit::Shutdown {
            return;
        }

        if !lock(&inner.shared).lifecycle.is_current(ticket.generation) {
            return;
        }
        inner.emit(RelayEvent::Disconnected(DisconnectReason::ConnectionLost));

        let Some((next, queue)) = reconnect(&inner, &ticket).await else {
            return;
        };
        socket = next;

        let mut stale = 0;
        while outbound.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            log::debug!("[Relay] Dropped {} messages queued before the reconnect", stale);
        }
        outbound = queue;
        inner.emit(RelayEvent::Connected);
    }
}

/// Retry with backoff. On success the client is `Connected` again with a
/// fresh outbound queue, so nothing sent from here on lands in the old one.
async fn reconnect(
    inner: &Inner,
    ticket: &Ticket,
) -> Option<(Socket, mpsc::UnboundedReceiver<OutboundMessage>)> {
    loop {
        let plan = lock(&inner.shared)
            .lifecycle
            .plan_reconnect(ticket.generation);

        let retry = match plan {
            ReconnectPlan::Retry(retry) => retry,
            ReconnectPlan::Exhausted(attempts) => {
                log::error!("[Relay] Giving up after {} reconnect attempts", attempts);
                inner.emit(RelayEvent::ReconnectExhausted { attempts });
                return None;
            }
            ReconnectPlan::Stopped => return None,
        };

        log::info!(
            "[Relay] Reconnecting in {}ms (attempt {}/{})",
            retry.delay.as_millis(),
            retry.attempt,
            inner.options.backoff.max_attempts()
        );
        inner.emit(RelayEvent::Reconnecting {
            attempt: retry.attempt,
            delay: retry.delay,
        });

        if !sleep_unless_cancelled(retry.delay, &ticket.cancel).await {
            return None;
        }

        // Latest session wins: update_session() during an outage applies here
        let endpoint = {
            let mut shared = lock(&inner.shared);
            if !shared
                .lifecycle
                .transition(ticket.generation, ConnectionState::Connecting)
            {
                return None;
            }
            // The server assigns a new id to every connection
            if let Some(session) = shared.session.as_mut() {
                session.connection_id = None;
            }
            shared.endpoint()
        };

        let result = match endpoint {
            Ok((endpoint, session_id)) => open_socket(inner, &endpoint, &session_id, ticket).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(socket) => {
                let mut shared = lock(&inner.shared);
                if !shared.lifecycle.mark_connected(ticket.generation) {
                    return None;
                }
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                shared.outbound = Some(outbound_tx);
                log::info!("[Relay] Reconnected, session re-registered");
                return Some((socket, outbound_rx));
            }
            Err(ConnectionError::Cancelled) => return None,
            Err(e) => {
                log::warn!("[Relay] Reconnect attempt {} failed: {}", retry.attempt, e);
                inner.emit(RelayEvent::Error(e));
            }
        }
    }
}

async fn run_session(
    inner: &Inner,
    ticket: &Ticket,
    socket: Socket,
    outbound: &mut mpsc::UnboundedReceiver<OutboundMessage>,
) -> SessionExit {
    let Socket {
        mut writer,
        mut reader,
    } = socket;

    let period = inner.options.heartbeat_interval;
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let liveness_timeout = inner.options.liveness_timeout;
    let mut liveness: Option<Pin<Box<Sleep>>> =
        liveness_timeout.map(|timeout| Box::pin(tokio::time::sleep(timeout)));

    loop {
        tokio::select! {
            () = ticket.cancel.cancelled() => {
                if let Err(e) = writer.close().await {
                    log::debug!("[Relay] Close handshake failed: {:#}", e);
                }
                return SessionExit::Shutdown;
            }

            frame = reader.recv() => {
                if let (Some(deadline), Some(timeout)) = (liveness.as_mut(), liveness_timeout) {
                    deadline.as_mut().reset(Instant::now() + timeout);
                }
                match frame {
                    None => {
                        log::warn!("[Relay] Connection closed");
                        return SessionExit::Lost;
                    }
                    Some(Err(e)) => {
                        log::warn!("[Relay] {:#}", e);
                        inner.emit(RelayEvent::Error(ConnectionError::Transport(format!("{e:#}"))));
                        return SessionExit::Lost;
                    }
                    Some(Ok(WsMessage::Text(text))) => handle_text(inner, &text),
                    Some(Ok(WsMessage::Close { code, reason })) => {
                        log::warn!("[Relay] Server closed connection: {} {}", code, reason);
                        return SessionExit::Lost;
                    }
                    Some(Ok(WsMessage::Other)) => {}
                }
            }

            () = expire(&mut liveness) => {
                let silence = liveness_timeout.unwrap_or_default();
                log::warn!("[Relay] No frames for {}s, treating connection as lost", silence.as_secs());
                inner.emit(RelayEvent::Error(ConnectionError::Transport(format!(
                    "no frames received for {}s",
                    silence.as_secs()
                ))));
                return SessionExit::Lost;
            }

            _ = heartbeat.tick() => {
                if !send(inner, &mut writer, &OutboundMessage::ping()).await {
                    return SessionExit::Lost;
                }
            }

            Some(message) = outbound.recv() => {
                if !send(inner, &mut writer, &message).await {
                    return SessionExit::Lost;
                }
            }
        }
    }
}

/// Wait for the liveness deadline; pends forever when liveness is off.
async fn expire(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(deadline) => deadline.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Write one envelope; `false` means the connection is unusable.
async fn send(inner: &Inner, writer: &mut WsWriter, message: &OutboundMessage) -> bool {
    let text = match message.to_json() {
        Ok(text) => text,
        Err(e) => {
            log::error!("[Relay] Failed to encode {}: {}", message.kind(), e);
            return true;
        }
    };
    match writer.send_text(text).await {
        Ok(()) => {
            log::trace!("[Relay] > {}", message.kind());
            true
        }
        Err(e) => {
            log::warn!("[Relay] Failed to send {}: {:#}", message.kind(), e);
            inner.emit(RelayEvent::Error(ConnectionError::Transport(format!("{e:#}"))));
            false
        }
    }
}

/// Dispatch one inbound text frame.
fn handle_text(inner: &Inner, text: &str) {
    let message = match InboundMessage::decode(text) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("[Relay] Dropping undecodable frame: {}", e);
            return;
        }
    };

    match message {
        InboundMessage::Connected { client_id } => {
            log::info!("[Relay] Server acknowledged connection (id {:?})", client_id);
            if let Some(session) = lock(&inner.shared).session.as_mut() {
                session.connection_id = client_id;
            }
        }
        InboundMessage::SessionRegistered(message) => {
            log::info!(
                "[Relay] Session registered: {}",
                message
                    .get("sessionId")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("?")
            );
            inner.emit(RelayEvent::SessionRegistered(message));
        }
        InboundMessage::Pong => log::trace!("[Relay] < pong"),
        InboundMessage::Error { message } => {
            log::error!("[Relay] Server error: {}", message);
            inner.emit(RelayEvent::Error(ConnectionError::Server(message)));
        }
        InboundMessage::Unknown(kind) => {
            log::debug!("[Relay] Ignoring message of unknown type {:?}", kind);
        }
    }
}
