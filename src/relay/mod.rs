//! Relay protocol client: session registration, heartbeat and forwarding of
//! tally state over a persistent WebSocket.

mod client;
pub mod messages;

pub use client::{RelayClient, RelayEvent, RelayOptions, RelayStatus};
pub use messages::{InboundMessage, OutboundMessage};
