//! Connection lifecycle shared by the vMix and relay clients.
//!
//! Both clients follow the same state machine:
//!
//! ```text
//!   Disconnected ──connect()──► Connecting ──ok──► Connected
//!        ▲                          │                 │
//!        │                        error         unexpected close
//!        │                          │                 │
//!        ├──────────────────────────┘                 ▼
//!        │◄──── attempts exhausted / disconnect() ── Reconnecting
//!        │                                            │
//!        │                                  delay elapsed (backoff)
//!        │                                            ▼
//!        └────────────────────────────────────── Connecting
//! ```
//!
//! # Generations
//!
//! Every explicit `connect()` starts a new *generation* with its own
//! [`CancellationToken`]. A background connection task only mutates shared
//! state while its generation is current, so a timer or reconnect delay that
//! fires after `disconnect()` (or after a newer `connect()`) is a no-op.

// Rust guideline compliant 2026-02

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::{Backoff, Retry};

/// Connection state of a single client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Idle: never connected, deliberately disconnected, or gave up.
    #[default]
    Disconnected,
    /// A connect attempt (initial or retry) is in flight.
    Connecting,
    /// The connection is established.
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Errors surfaced by the protocol clients.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// No handshake within the connect timeout.
    #[error("connection to {target} timed out after {}s", timeout.as_secs())]
    ConnectTimeout {
        /// Address or URL being connected to.
        target: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },
    /// Transport failure while connecting (refused, DNS, handshake, bad URL).
    #[error("failed to connect to {target}: {reason}")]
    Connect {
        /// Address or URL being connected to.
        target: String,
        /// Underlying cause.
        reason: String,
    },
    /// `connect()` was called while another attempt was in flight.
    #[error("a connection attempt is already in progress")]
    AlreadyConnecting,
    /// `disconnect()` was called before the pending `connect()` resolved.
    #[error("connection attempt cancelled by disconnect")]
    Cancelled,
    /// A message could not be decoded; the message was dropped.
    #[error("failed to parse {what}: {reason}")]
    Parse {
        /// What was being parsed (e.g. "vMix XML document").
        what: &'static str,
        /// Decoder error.
        reason: String,
    },
    /// Read or write failure on an established connection.
    #[error("transport error: {0}")]
    Transport(String),
    /// Error message reported by the remote server.
    #[error("server error: {0}")]
    Server(String),
}

/// Why a client reported `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called.
    Requested,
    /// The connection dropped unexpectedly; the reconnect policy takes over.
    ConnectionLost,
}

/// Outcome of asking the lifecycle to schedule a reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReconnectPlan {
    /// Wait `retry.delay`, then try again.
    Retry(Retry),
    /// Attempts ran out; the client is now `Disconnected`.
    Exhausted(u32),
    /// The generation was superseded (disconnect or a newer connect).
    Stopped,
}

/// Permission to run one connection generation.
#[derive(Debug, Clone)]
pub(crate) struct Ticket {
    pub(crate) generation: u64,
    pub(crate) cancel: CancellationToken,
}

/// Lifecycle bookkeeping owned by a client's shared state.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: ConnectionState,
    backoff: Backoff,
    generation: u64,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Lifecycle {
    pub(crate) fn new(backoff: Backoff) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            backoff,
            generation: 0,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.backoff.attempts()
    }

    /// Begin an explicit connect.
    ///
    /// Returns `Ok(None)` when already connected (no-op success) and
    /// rejects reentrant calls while a connect is in flight. A pending
    /// reconnect is superseded: its generation is cancelled and the
    /// attempt counter starts over.
    pub(crate) fn begin_connect(&mut self) -> Result<Option<Ticket>, ConnectionError> {
        match self.state {
            ConnectionState::Connected => return Ok(None),
            ConnectionState::Connecting => return Err(ConnectionError::AlreadyConnecting),
            ConnectionState::Reconnecting | ConnectionState::Disconnected => {}
        }

        self.cancel.cancel();
        self.task = None;
        self.generation += 1;
        self.cancel = CancellationToken::new();
        self.backoff.reset();
        self.state = ConnectionState::Connecting;

        Ok(Some(self.ticket()))
    }

    fn ticket(&self) -> Ticket {
        Ticket {
            generation: self.generation,
            cancel: self.cancel.clone(),
        }
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && !self.cancel.is_cancelled()
    }

    /// Move to `state` if `generation` is still current.
    pub(crate) fn transition(&mut self, generation: u64, state: ConnectionState) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.state = state;
        true
    }

    /// Record a successful (re)connect.
    pub(crate) fn mark_connected(&mut self, generation: u64) -> bool {
        if !self.transition(generation, ConnectionState::Connected) {
            return false;
        }
        self.backoff.reset();
        true
    }

    /// Store the background task driving `generation`.
    pub(crate) fn attach_task(&mut self, generation: u64, task: JoinHandle<()>) {
        if self.generation == generation {
            self.task = Some(task);
        } else {
            task.abort();
        }
    }

    /// Schedule the next reconnect for `generation`.
    pub(crate) fn plan_reconnect(&mut self, generation: u64) -> ReconnectPlan {
        if !self.is_current(generation) {
            return ReconnectPlan::Stopped;
        }
        if let Some(retry) = self.backoff.schedule() {
            self.state = ConnectionState::Reconnecting;
            ReconnectPlan::Retry(retry)
        } else {
            self.state = ConnectionState::Disconnected;
            ReconnectPlan::Exhausted(self.backoff.attempts())
        }
    }

    /// Deliberate shutdown: disarm reconnection, cancel the generation.
    ///
    /// Returns the state before shutdown and the task to await.
    pub(crate) fn shutdown(&mut self) -> (ConnectionState, Option<JoinHandle<()>>) {
        let previous = self.state;
        self.backoff.disarm();
        self.cancel.cancel();
        self.state = ConnectionState::Disconnected;
        (previous, self.task.take())
    }
}

/// Lock a client's shared state, recovering from a poisoned mutex.
///
/// Shared state is plain data updated in short critical sections; a panic
/// mid-update cannot leave it more inconsistent than a dropped connection.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run a connect future under the connect timeout, aborting on cancellation.
pub(crate) async fn establish<T, F>(
    target: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    connect: F,
) -> Result<T, ConnectionError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    tokio::select! {
        () = cancel.cancelled() => Err(ConnectionError::Cancelled),
        result = tokio::time::timeout(timeout, connect) => match result {
            Err(_) => Err(ConnectionError::ConnectTimeout {
                target: target.to_string(),
                timeout,
            }),
            Ok(Err(e)) => Err(ConnectionError::Connect {
                target: target.to_string(),
                reason: format!("{e:#}"),
            }),
            Ok(Ok(value)) => Ok(value),
        },
    }
}

/// Wait out a reconnect delay; `false` if cancelled first.
pub(crate) async fn sleep_unless_cancelled(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

/// Await a connection task for at most `grace`, then abort it.
pub(crate) async fn join_with_grace(task: JoinHandle<()>, grace: Duration) {
    let abort = task.abort_handle();
    if tokio::time::timeout(grace, task).await.is_err() {
        log::debug!("Connection task did not stop within {:?}, aborting", grace);
        abort.abort();
    }
}
