//! Forwarding loop between the vMix client and the relay client.
//!
//! The bridge owns both clients, connects them, and relays every tally and
//! input-set event from the mixer to the relay. It carries no protocol logic
//! of its own.

// Rust guideline compliant 2026-02

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::config::Config;
use crate::relay::{RelayClient, RelayEvent};
use crate::vmix::{InputSetSnapshot, TallySnapshot, VmixClient, VmixEvent};

/// Where to connect.
#[derive(Clone)]
pub struct BridgeSettings {
    /// vMix host.
    pub vmix_host: String,
    /// vMix TCP API port.
    pub vmix_port: u16,
    /// Relay WebSocket URL.
    pub relay_url: String,
    /// Relay session id.
    pub session_id: String,
    /// Relay auth token.
    pub auth_token: Option<String>,
    /// Retry unreachable endpoints indefinitely instead of failing.
    pub auto_connect: bool,
}

impl std::fmt::Debug for BridgeSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeSettings")
            .field("vmix_host", &self.vmix_host)
            .field("vmix_port", &self.vmix_port)
            .field("relay_url", &self.relay_url)
            .field("session_id", &self.session_id)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "***"))
            .field("auto_connect", &self.auto_connect)
            .finish()
    }
}

impl From<&Config> for BridgeSettings {
    fn from(config: &Config) -> Self {
        Self {
            vmix_host: config.vmix_host.clone(),
            vmix_port: config.vmix_port,
            relay_url: config.relay_url.clone(),
            session_id: config.session_id.trim().to_string(),
            auth_token: config.token.clone(),
            auto_connect: config.auto_connect,
        }
    }
}

/// Latest state seen from the mixer, replayed after a relay reconnect.
#[derive(Debug, Default)]
struct LastKnown {
    tally: Option<TallySnapshot>,
    inputs: Option<InputSetSnapshot>,
}

/// Connects a vMix client to a relay client and forwards state.
#[derive(Debug)]
pub struct Bridge {
    vmix: VmixClient,
    relay: RelayClient,
    retry: Backoff,
}

impl Bridge {
    /// Create a bridge over two idle clients.
    #[must_use]
    pub fn new(vmix: VmixClient, relay: RelayClient) -> Self {
        Self {
            vmix,
            relay,
            retry: Backoff::default(),
        }
    }

    /// Override the delay schedule used by `auto_connect` retries.
    #[must_use]
    pub fn with_retry(mut self, retry: Backoff) -> Self {
        self.retry = retry;
        self
    }

    /// The vMix client.
    pub fn vmix(&self) -> &VmixClient {
        &self.vmix
    }

    /// The relay client.
    pub fn relay(&self) -> &RelayClient {
        &self.relay
    }

    /// Connect both ends and forward until `shutdown` fires.
    ///
    /// Both clients are disconnected before this returns.
    ///
    /// # Errors
    ///
    /// Fails when no session id is configured, or when an endpoint is
    /// unreachable and `auto_connect` is off.
    pub async fn run(&self, settings: &BridgeSettings, shutdown: &CancellationToken) -> Result<()> {
        if settings.session_id.is_empty() {
            anyhow::bail!("no relay session id configured (set session_id or TALLY_BRIDGE_SESSION_ID)");
        }

        // Subscribe before connecting so no early event is missed
        let mut vmix_events = self.vmix.subscribe();
        let mut relay_events = self.relay.subscribe();

        let result = self
            .run_inner(settings, shutdown, &mut vmix_events, &mut relay_events)
            .await;

        self.vmix.disconnect().await;
        self.relay.disconnect().await;
        log::info!("[Bridge] Stopped");
        result
    }

    async fn run_inner(
        &self,
        settings: &BridgeSettings,
        shutdown: &CancellationToken,
        vmix_events: &mut broadcast::Receiver<VmixEvent>,
        relay_events: &mut broadcast::Receiver<RelayEvent>,
    ) -> Result<()> {
        if !self.connect_relay(settings, shutdown).await? {
            return Ok(());
        }
        if !self.connect_vmix(settings, shutdown).await? {
            return Ok(());
        }

        log::info!(
            "[Bridge] Forwarding tally from {}:{} to session {}",
            settings.vmix_host,
            settings.vmix_port,
            settings.session_id
        );

        let mut last = LastKnown::default();
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return Ok(()),

                event = vmix_events.recv() => match event {
                    Ok(event) => {
                        let gave_up = self.on_vmix_event(event, &mut last);
                        if gave_up && settings.auto_connect && !self.connect_vmix(settings, shutdown).await? {
                            return Ok(());
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!("[Bridge] Fell behind, {} vMix events dropped", missed);
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },

                event = relay_events.recv() => match event {
                    Ok(event) => {
                        let gave_up = self.on_relay_event(event, &last);
                        if gave_up && settings.auto_connect && !self.connect_relay(settings, shutdown).await? {
                            return Ok(());
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!("[Bridge] Fell behind, {} relay events dropped", missed);
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    /// Handle one mixer event. Returns `true` when the client gave up.
    fn on_vmix_event(&self, event: VmixEvent, last: &mut LastKnown) -> bool {
        match event {
            VmixEvent::Tally(tally) => {
                if self.relay.is_connected() {
                    self.relay.send_tally_data(&tally);
                }
                last.tally = Some(tally);
            }
            VmixEvent::Inputs(inputs) => {
                if self.relay.is_connected() {
                    self.relay.send_inputs_data(&inputs);
                }
                last.inputs = Some(inputs);
            }
            VmixEvent::Error(e) => log::warn!("[Bridge] vMix error: {}", e),
            VmixEvent::Disconnected(reason) => log::warn!("[Bridge] vMix disconnected ({:?})", reason),
            VmixEvent::Reconnecting { attempt, delay } => {
                log::debug!("[Bridge] vMix reconnect {} in {:?}", attempt, delay);
            }
            VmixEvent::ReconnectExhausted { attempts } => {
                log::error!("[Bridge] vMix unreachable after {} attempts", attempts);
                return true;
            }
        }
        false
    }

    /// Handle one relay event. Returns `true` when the client gave up.
    fn on_relay_event(&self, event: RelayEvent, last: &LastKnown) -> bool {
        match event {
            RelayEvent::Connected => {
                // Bring a freshly (re)connected relay up to date
                if let Some(inputs) = &last.inputs {
                    self.relay.send_inputs_data(inputs);
                }
                if let Some(tally) = &last.tally {
                    self.relay.send_tally_data(tally);
                }
            }
            RelayEvent::SessionRegistered(_) => log::info!("[Bridge] Relay session registered"),
            RelayEvent::Error(e) => log::warn!("[Bridge] Relay error: {}", e),
            RelayEvent::Disconnected(reason) => log::warn!("[Bridge] Relay disconnected ({:?})", reason),
            RelayEvent::Reconnecting { attempt, delay } => {
                log::debug!("[Bridge] Relay reconnect {} in {:?}", attempt, delay);
            }
            RelayEvent::ReconnectExhausted { attempts } => {
                log::error!("[Bridge] Relay unreachable after {} attempts", attempts);
                return true;
            }
        }
        false
    }

    /// Connect the relay. `Ok(false)` means shutdown interrupted the retries.
    async fn connect_relay(&self, settings: &BridgeSettings, shutdown: &CancellationToken) -> Result<bool> {
        let mut attempt = 0;
        loop {
            let result = self
                .relay
                .connect(&settings.relay_url, &settings.session_id, settings.auth_token.as_deref())
                .await;
            match result {
                Ok(()) => return Ok(true),
                Err(e) if settings.auto_connect => {
                    let delay = self.retry.delay_for(attempt);
                    attempt = attempt.saturating_add(1);
                    log::warn!("[Bridge] Relay unavailable ({}), retrying in {:?}", e, delay);
                    if !wait_or_shutdown(delay, shutdown).await {
                        return Ok(false);
                    }
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to connect to relay {}", settings.relay_url));
                }
            }
        }
    }

    /// Connect the mixer. `Ok(false)` means shutdown interrupted the retries.
    async fn connect_vmix(&self, settings: &BridgeSettings, shutdown: &CancellationToken) -> Result<bool> {
        let mut attempt = 0;
        loop {
            match self.vmix.connect(&settings.vmix_host, settings.vmix_port).await {
                Ok(()) => return Ok(true),
                Err(e) if settings.auto_connect => {
                    let delay = self.retry.delay_for(attempt);
                    attempt = attempt.saturating_add(1);
                    log::warn!("[Bridge] vMix unavailable ({}), retrying in {:?}", e, delay);
                    if !wait_or_shutdown(delay, shutdown).await {
                        return Ok(false);
                    }
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to connect to vMix at {}:{}", settings.vmix_host, settings.vmix_port)
                    });
                }
            }
        }
    }
}

async fn wait_or_shutdown(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}
