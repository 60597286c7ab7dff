//! Persistent vMix TCP API client.
//!
//! # Architecture
//!
//! ```text
//!   VmixClient (handle)                 connection task (one per connect())
//!         │                                      │
//!         │ connect() ── open + SUBSCRIBE ──────►│ select! {
//!         │ request_tally() ── Command ─────────►│   socket read → StreamParser
//!         │ disconnect() ── cancel token ───────►│   5s  XML poll
//!         │                                      │   30s HTTP backup query
//!         │◄──────── broadcast<VmixEvent> ───────│   commands / cancellation
//!         │                                      │ }
//!                                                │ on close: backoff + reconnect
//! ```
//!
//! The task exclusively owns the socket, the parser buffer and the last-known
//! inputs cache. The handle only sees lifecycle state, behind a mutex that is
//! never held across an await.

// Rust guideline compliant 2026-02

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use super::backup::BackupQuery;
use super::document::VmixDocument;
use super::framing::{Frame, StreamParser};
use super::types::{InputMap, InputSetSnapshot, TallySnapshot};
use crate::backoff::Backoff;
use crate::connection::{
    establish, join_with_grace, lock, sleep_unless_cancelled, ConnectionError, ConnectionState,
    DisconnectReason, Lifecycle, ReconnectPlan, Ticket,
};
use crate::constants::{
    CONNECT_TIMEOUT, EVENT_CHANNEL_CAPACITY, HTTP_BACKUP_INTERVAL, SHUTDOWN_GRACE,
    VMIX_HTTP_PORT, XML_POLL_INTERVAL,
};

const CMD_SUBSCRIBE_TALLY: &[u8] = b"SUBSCRIBE TALLY\r\n";
const CMD_UNSUBSCRIBE_TALLY: &[u8] = b"UNSUBSCRIBE TALLY\r\n";
const CMD_TALLY: &[u8] = b"TALLY\r\n";
const CMD_XML: &[u8] = b"XML\r\n";

/// Tunables for [`VmixClient`]. Defaults match the device protocol.
#[derive(Debug, Clone)]
pub struct VmixOptions {
    /// Port of the HTTP web API used for the backup query.
    pub http_port: u16,
    /// Handshake timeout.
    pub connect_timeout: Duration,
    /// Full-document poll interval on the persistent channel.
    pub xml_poll_interval: Duration,
    /// Backup HTTP query interval; `None` disables the backup channel.
    pub backup_interval: Option<Duration>,
    /// Reconnect schedule.
    pub backoff: Backoff,
}

impl Default for VmixOptions {
    fn default() -> Self {
        Self {
            http_port: VMIX_HTTP_PORT,
            connect_timeout: CONNECT_TIMEOUT,
            xml_poll_interval: XML_POLL_INTERVAL,
            backup_interval: Some(HTTP_BACKUP_INTERVAL),
            backoff: Backoff::default(),
        }
    }
}

/// Event emitted by [`VmixClient`].
#[derive(Debug, Clone)]
pub enum VmixEvent {
    /// New program/preview state.
    Tally(TallySnapshot),
    /// The set of inputs changed.
    Inputs(InputSetSnapshot),
    /// Non-terminal error (transport, parse, failed reconnect attempt).
    Error(ConnectionError),
    /// The connection went down.
    Disconnected(DisconnectReason),
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
pub struct VmixStatus {
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Shorthand for `state == Connected`.
    pub is_connected: bool,
    /// Whether `SUBSCRIBE TALLY` is active on the current connection.
    pub is_subscribed: bool,
    /// Device host of the last `connect()`.
    pub host: Option<String>,
    /// Device TCP port of the last `connect()`.
    pub tcp_port: Option<u16>,
    /// HTTP API port used for backup queries.
    pub http_port: u16,
    /// Reconnect attempts since the last successful connect.
    pub reconnect_attempts: u32,
}

/// Device address.
#[derive(Debug, Clone)]
struct Target {
    host: String,
    port: u16,
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// On-demand requests from the handle to the connection task.
#[derive(Debug, Clone, Copy)]
enum Command {
    Tally,
    Document,
}

impl Command {
    fn bytes(self) -> &'static [u8] {
        match self {
            Self::Tally => CMD_TALLY,
            Self::Document => CMD_XML,
        }
    }
}

#[derive(Debug)]
struct Shared {
    lifecycle: Lifecycle,
    host: Option<String>,
    tcp_port: Option<u16>,
    subscribed: bool,
    commands: Option<mpsc::UnboundedSender<Command>>,
}

#[derive(Debug)]
struct Inner {
    shared: Mutex<Shared>,
    events: broadcast::Sender<VmixEvent>,
    options: VmixOptions,
}

impl Inner {
    fn emit(&self, event: VmixEvent) {
        // No subscribers is fine: events are fire-and-forget
        let _ = self.events.send(event);
    }
}

/// An open, subscribed connection.
struct Session {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

/// How a session ended.
#[derive(Debug, PartialEq, Eq)]
enum SessionExit {
    /// `disconnect()` was called.
    Shutdown,
    /// The device went away.
    Lost,
}

/// Client for the vMix TCP API.
///
/// Dropping the client cancels its connection task.
#[derive(Debug)]
pub struct VmixClient {
    inner: Arc<Inner>,
}

impl Default for VmixClient {
    fn default() -> Self {
        Self::new(VmixOptions::default())
    }
}

impl VmixClient {
    /// Create an idle client.
    #[must_use]
    pub fn new(options: VmixOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let backoff = options.backoff.clone();
        Self {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared {
                    lifecycle: Lifecycle::new(backoff),
                    host: None,
                    tcp_port: None,
                    subscribed: false,
                    commands: None,
                }),
                events,
                options,
            }),
        }
    }

    /// Subscribe to client events.
    pub fn subscribe(&self) -> broadcast::Receiver<VmixEvent> {
        self.inner.events.subscribe()
    }

    /// Connect to the device, subscribe to tally pushes and start polling.
    ///
    /// Resolves immediately if already connected. Fails with
    /// [`ConnectionError::AlreadyConnecting`] if a connect is in flight.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), ConnectionError> {
        let ticket = {
            let mut shared = lock(&self.inner.shared);
            let Some(ticket) = shared.lifecycle.begin_connect()? else {
                log::debug!("[Vmix] connect() while connected, nothing to do");
                return Ok(());
            };
            shared.host = Some(host.to_string());
            shared.tcp_port = Some(port);
            ticket
        };

        let target = Target {
            host: host.to_string(),
            port,
        };
        log::info!("[Vmix] Connecting to {}", target);

        let session = match open_session(&self.inner, &target, &ticket).await {
            Ok(session) => session,
            Err(e) => {
                let current = lock(&self.inner.shared)
                    .lifecycle
                    .transition(ticket.generation, ConnectionState::Disconnected);
                if current {
                    log::error!("[Vmix] Connection to {} failed: {}", target, e);
                    self.inner.emit(VmixEvent::Error(e.clone()));
                }
                return Err(e);
            }
        };

        let mut shared = lock(&self.inner.shared);
        if !shared.lifecycle.mark_connected(ticket.generation) {
            return Err(ConnectionError::Cancelled);
        }
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        shared.subscribed = true;
        shared.commands = Some(command_tx);

        let task = tokio::spawn(run_connection_loop(
            Arc::clone(&self.inner),
            target.clone(),
            ticket.clone(),
            session,
            command_rx,
        ));
        shared.lifecycle.attach_task(ticket.generation, task);

        log::info!("[Vmix] Connected to {}", target);
        Ok(())
    }

    /// Disconnect and stay disconnected.
    ///
    /// Sends `UNSUBSCRIBE TALLY`, stops both refresh timers and any pending
    /// reconnect, and closes the socket. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let (previous, task) = {
            let mut shared = lock(&self.inner.shared);
            shared.subscribed = false;
            shared.commands = None;
            shared.lifecycle.shutdown()
        };

        if let Some(task) = task {
            join_with_grace(task, SHUTDOWN_GRACE).await;
        }

        if previous != ConnectionState::Disconnected {
            log::info!("[Vmix] Disconnected");
            self.inner
                .emit(VmixEvent::Disconnected(DisconnectReason::Requested));
        }
    }

    /// Ask the device for a one-shot tally line. `false` if not connected.
    pub fn request_tally(&self) -> bool {
        self.send_command(Command::Tally)
    }

    /// Ask the device for a full XML document now. `false` if not connected.
    pub fn request_full_document(&self) -> bool {
        self.send_command(Command::Document)
    }

    fn send_command(&self, command: Command) -> bool {
        let shared = lock(&self.inner.shared);
        if shared.lifecycle.state() != ConnectionState::Connected {
            log::debug!("[Vmix] Not connected, dropping {:?} request", command);
            return false;
        }
        shared
            .commands
            .as_ref()
            .is_some_and(|tx| tx.send(command).is_ok())
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
    pub fn status(&self) -> VmixStatus {
        let shared = lock(&self.inner.shared);
        let state = shared.lifecycle.state();
        VmixStatus {
            state,
            is_connected: state == ConnectionState::Connected,
            is_subscribed: shared.subscribed && state == ConnectionState::Connected,
            host: shared.host.clone(),
            tcp_port: shared.tcp_port,
            http_port: self.inner.options.http_port,
            reconnect_attempts: shared.lifecycle.attempts(),
        }
    }
}

impl Drop for VmixClient {
    fn drop(&mut self) {
        lock(&self.inner.shared).lifecycle.shutdown();
    }
}

/// Open the socket and issue the initial subscribe + document request.
async fn open_session(
    inner: &Inner,
    target: &Target,
    ticket: &Ticket,
) -> Result<Session, ConnectionError> {
    let stream = establish(
        &target.to_string(),
        inner.options.connect_timeout,
        &ticket.cancel,
        async {
            TcpStream::connect((target.host.as_str(), target.port))
                .await
                .context("TCP connect failed")
        },
    )
    .await?;

    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("[Vmix] Could not set TCP_NODELAY: {}", e);
    }

    let (reader, mut writer) = stream.into_split();
    for command in [CMD_SUBSCRIBE_TALLY, CMD_XML] {
        writer
            .write_all(command)
            .await
            .map_err(|e| ConnectionError::Connect {
                target: target.to_string(),
                reason: format!("failed to send initial commands: {e}"),
            })?;
    }
    log::debug!("[Vmix] Subscribed to tally, requested full state");

    Ok(Session { reader, writer })
}

/// Drive one connection generation: sessions plus reconnects.
async fn run_connection_loop(
    inner: Arc<Inner>,
    target: Target,
    ticket: Ticket,
    mut session: Session,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    loop {
        if run_session(&inner, &target, &ticket, session, &mut commands).await
            == SessionExit::Shutdown
        {
            return;
        }

        {
            let mut shared = lock(&inner.shared);
            if !shared.lifecycle.is_current(ticket.generation) {
                return;
            }
            shared.subscribed = false;
        }
        inner.emit(VmixEvent::Disconnected(DisconnectReason::ConnectionLost));

        match reconnect(&inner, &target, &ticket).await {
            Some(next) => session = next,
            None => return,
        }
    }
}

/// Retry with backoff until a session opens, attempts run out, or the
/// generation is cancelled.
async fn reconnect(inner: &Inner, target: &Target, ticket: &Ticket) -> Option<Session> {
    loop {
        let plan = lock(&inner.shared)
            .lifecycle
            .plan_reconnect(ticket.generation);

        let retry = match plan {
            ReconnectPlan::Retry(retry) => retry,
            ReconnectPlan::Exhausted(attempts) => {
                log::error!(
                    "[Vmix] Giving up on {} after {} reconnect attempts",
                    target,
                    attempts
                );
                inner.emit(VmixEvent::ReconnectExhausted { attempts });
                return None;
            }
            ReconnectPlan::Stopped => return None,
        };

        log::info!(
            "[Vmix] Reconnecting to {} in {}ms (attempt {}/{})",
            target,
            retry.delay.as_millis(),
            retry.attempt,
            inner.options.backoff.max_attempts()
        );
        inner.emit(VmixEvent::Reconnecting {
            attempt: retry.attempt,
            delay: retry.delay,
        });

        if !sleep_unless_cancelled(retry.delay, &ticket.cancel).await {
            return None;
        }
        if !lock(&inner.shared)
            .lifecycle
            .transition(ticket.generation, ConnectionState::Connecting)
        {
            return None;
        }

        match open_session(inner, target, ticket).await {
            Ok(session) => {
                let mut shared = lock(&inner.shared);
                if !shared.lifecycle.mark_connected(ticket.generation) {
                    return None;
                }
                shared.subscribed = true;
                log::info!("[Vmix] Reconnected to {}", target);
                return Some(session);
            }
            Err(ConnectionError::Cancelled) => return None,
            Err(e) => {
                log::warn!("[Vmix] Reconnect attempt {} failed: {}", retry.attempt, e);
                inner.emit(VmixEvent::Error(e));
            }
        }
    }
}

/// Read, parse and poll on one open connection until it ends.
async fn run_session(
    inner: &Inner,
    target: &Target,
    ticket: &Ticket,
    session: Session,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> SessionExit {
    let Session {
        mut reader,
        mut writer,
    } = session;

    let mut parser = StreamParser::new();
    // Last known inputs; starts empty on every (re)connect
    let mut inputs: Option<InputMap> = None;
    let mut read_buf = vec![0u8; 16 * 1024];

    let poll_period = inner.options.xml_poll_interval;
    let mut xml_poll = interval_at(Instant::now() + poll_period, poll_period);
    xml_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let backup = inner.options.backup_interval.and_then(|period| {
        match BackupQuery::new(&target.host, inner.options.http_port) {
            Ok(query) => {
                let mut tick = interval_at(Instant::now() + period, period);
                tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                Some((query, tick))
            }
            Err(e) => {
                log::warn!("[Vmix] HTTP backup disabled: {:#}", e);
                None
            }
        }
    });
    let (backup, mut backup_tick): (Option<BackupQuery>, Option<Interval>) = backup.unzip();
    let (backup_tx, mut backup_rx) = mpsc::channel(1);
    let mut backup_in_flight = false;

    loop {
        tokio::select! {
            () = ticket.cancel.cancelled() => {
                if let Err(e) = writer.write_all(CMD_UNSUBSCRIBE_TALLY).await {
                    log::debug!("[Vmix] Failed to send UNSUBSCRIBE TALLY: {}", e);
                }
                let _ = writer.shutdown().await;
                return SessionExit::Shutdown;
            }

            read = reader.read(&mut read_buf) => match read {
                Ok(0) => {
                    log::warn!("[Vmix] Connection closed by {}", target);
                    return SessionExit::Lost;
                }
                Ok(n) => {
                    for frame in parser.push(&read_buf[..n]) {
                        handle_frame(inner, frame, &mut inputs);
                    }
                }
                Err(e) => {
                    log::warn!("[Vmix] Read error from {}: {}", target, e);
                    inner.emit(VmixEvent::Error(ConnectionError::Transport(e.to_string())));
                    return SessionExit::Lost;
                }
            },

            _ = xml_poll.tick() => {
                if let Err(e) = writer.write_all(CMD_XML).await {
                    log::warn!("[Vmix] Failed to request XML: {}", e);
                    inner.emit(VmixEvent::Error(ConnectionError::Transport(e.to_string())));
                    return SessionExit::Lost;
                }
            }

            () = next_tick(&mut backup_tick), if !backup_in_flight => {
                if let Some(query) = backup.clone() {
                    backup_in_flight = true;
                    let tx = backup_tx.clone();
                    let cancel = ticket.cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            () = cancel.cancelled() => {}
                            result = query.fetch_inputs() => {
                                let _ = tx.send(result).await;
                            }
                        }
                    });
                }
            }

            Some(result) = backup_rx.recv() => {
                backup_in_flight = false;
                match result {
                    Ok(Some(set)) => apply_input_set(inner, set, &mut inputs),
                    Ok(None) => log::trace!("[Vmix] HTTP backup document has no inputs"),
                    Err(e) => log::warn!("[Vmix] HTTP backup query failed: {:#}", e),
                }
            }

            Some(command) = commands.recv() => {
                if let Err(e) = writer.write_all(command.bytes()).await {
                    log::warn!("[Vmix] Failed to send {:?} request: {}", command, e);
                    inner.emit(VmixEvent::Error(ConnectionError::Transport(e.to_string())));
                    return SessionExit::Lost;
                }
            }
        }
    }
}

/// Tick an optional interval; pends forever when there is none.
async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Turn one framed message into events.
fn handle_frame(inner: &Inner, frame: Frame, inputs: &mut Option<InputMap>) {
    match frame {
        Frame::StatusCode(code) => {
            let snapshot =
                TallySnapshot::from_status_code(&code, inputs.clone().unwrap_or_default());
            log::debug!(
                "[Vmix] Tally {} (program={:?}, preview={:?})",
                code,
                snapshot.program,
                snapshot.preview
            );
            inner.emit(VmixEvent::Tally(snapshot));
        }
        Frame::Line(line) => log::trace!("[Vmix] < {}", line),
        Frame::Document(xml) => match VmixDocument::parse(&xml) {
            Ok(document) => {
                let captured_at = Utc::now();
                if let Some(set) = document.input_set(captured_at) {
                    apply_input_set(inner, set, inputs);
                }
                let tally = document.tally(inputs.clone().unwrap_or_default(), captured_at);
                inner.emit(VmixEvent::Tally(tally));
            }
            Err(e) => {
                log::warn!("[Vmix] Dropping malformed XML document: {}", e);
                inner.emit(VmixEvent::Error(ConnectionError::Parse {
                    what: "vMix XML document",
                    reason: e.to_string(),
                }));
            }
        },
        Frame::Overflow(bytes) => {
            log::warn!("[Vmix] Dropped {} bytes of unterminated input", bytes);
            inner.emit(VmixEvent::Error(ConnectionError::Parse {
                what: "vMix XML document",
                reason: format!("no line or document end after {bytes} bytes"),
            }));
        }
    }
}

/// Replace the inputs cache, emitting only when the set actually changed.
fn apply_input_set(inner: &Inner, set: InputSetSnapshot, cache: &mut Option<InputMap>) {
    if cache.as_ref() == Some(&set.inputs) {
        log::trace!("[Vmix] Inputs unchanged");
        return;
    }
    log::info!(
        "[Vmix] Inputs changed: {} inputs (vMix {})",
        set.inputs.len(),
        set.device_version
    );
    *cache = Some(set.inputs.clone());
    inner.emit(VmixEvent::Inputs(set));
}
