//! vMix source protocol client.
//!
//! Holds a persistent TCP control channel to the mixer (tally push
//! subscription plus periodic full-state documents), backed by a periodic
//! query against the mixer's HTTP web API.

pub mod backup;
mod client;
pub mod document;
pub mod framing;
pub mod types;

pub use client::{VmixClient, VmixEvent, VmixOptions, VmixStatus};
pub use types::{InputDescriptor, InputId, InputMap, InputSetSnapshot, TallySnapshot};
