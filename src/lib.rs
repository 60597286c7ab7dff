//! Tally bridge - forwards live vMix tally state to a remote relay.
//!
//! # Architecture
//!
//! Two independent protocol clients, glued together by a thin forwarding
//! loop:
//!
//! - **VmixClient** ([`vmix`]) - persistent TCP channel to the mixer: tally
//!   push subscription, periodic XML state documents, HTTP backup query
//! - **RelayClient** ([`relay`]) - persistent WebSocket to the relay: session
//!   registration, heartbeat, tally/input forwarding
//! - **Bridge** ([`bridge`]) - subscribes to mixer events and forwards them
//!
//! Both clients share the connection lifecycle in [`connection`] and the
//! reconnect schedule in [`backoff`].

pub mod backoff;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod constants;
pub mod env;
pub mod relay;
pub mod vmix;
pub mod ws;

pub use bridge::{Bridge, BridgeSettings};
pub use config::Config;
pub use connection::{ConnectionError, ConnectionState, DisconnectReason};
pub use relay::{RelayClient, RelayEvent, RelayOptions, RelayStatus};
pub use vmix::{VmixClient, VmixEvent, VmixOptions, VmixStatus};
