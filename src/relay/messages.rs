//! Relay wire envelopes.
//!
//! Every frame is a JSON object with a `type` discriminator:
//!
//! | Direction | `type`               | Fields                                                        |
//! |-----------|----------------------|---------------------------------------------------------------|
//! | out       | `register`           | `sessionId`, `role`, `timestamp`                               |
//! | out       | `tally_update`       | `sessionId`, `program`, `preview`, `inputs`, `timestamp`, `vmixTimestamp` |
//! | out       | `inputs_update`      | `sessionId`, `inputs`, `vmixVersion`, `timestamp`, `vmixTimestamp` |
//! | out       | `ping`               | `timestamp`                                                    |
//! | in        | `connected`          | `clientId`                                                     |
//! | in        | `session_registered` | `sessionId`, …                                                 |
//! | in        | `pong`               |                                                                |
//! | in        | `error`              | `message`                                                      |
//!
//! `timestamp` is the forwarding time (RFC 3339), `vmixTimestamp` the device
//! capture time in Unix milliseconds.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::constants::RELAY_ROLE;
use crate::vmix::{InputId, InputMap, InputSetSnapshot, TallySnapshot};

/// Message sent to the relay.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Announce this client for a session.
    #[serde(rename_all = "camelCase")]
    Register {
        /// Session to join.
        session_id: String,
        /// Client role, always `"pd"`.
        role: &'static str,
        /// Send time.
        timestamp: DateTime<Utc>,
    },
    /// Program/preview change.
    #[serde(rename_all = "camelCase")]
    TallyUpdate {
        /// Session the update belongs to.
        session_id: String,
        /// Input on program.
        program: Option<InputId>,
        /// Input on preview.
        preview: Option<InputId>,
        /// Last known inputs.
        inputs: InputMap,
        /// Send time.
        timestamp: DateTime<Utc>,
        /// Device capture time, Unix milliseconds.
        vmix_timestamp: i64,
    },
    /// Input set change.
    #[serde(rename_all = "camelCase")]
    InputsUpdate {
        /// Session the update belongs to.
        session_id: String,
        /// Full input set.
        inputs: InputMap,
        /// Device version.
        vmix_version: String,
        /// Send time.
        timestamp: DateTime<Utc>,
        /// Device capture time, Unix milliseconds.
        vmix_timestamp: i64,
    },
    /// Application-level heartbeat.
    Ping {
        /// Send time.
        timestamp: DateTime<Utc>,
    },
}

impl OutboundMessage {
    /// `register` envelope for `session_id`.
    pub fn register(session_id: &str) -> Self {
        Self::Register {
            session_id: session_id.to_string(),
            role: RELAY_ROLE,
            timestamp: Utc::now(),
        }
    }

    /// `tally_update` envelope from a snapshot.
    pub fn tally(session_id: &str, snapshot: &TallySnapshot) -> Self {
        Self::TallyUpdate {
            session_id: session_id.to_string(),
            program: snapshot.program,
            preview: snapshot.preview,
            inputs: snapshot.inputs.clone(),
            timestamp: Utc::now(),
            vmix_timestamp: snapshot.captured_at.timestamp_millis(),
        }
    }

    /// `inputs_update` envelope from a snapshot.
    pub fn inputs(session_id: &str, snapshot: &InputSetSnapshot) -> Self {
        Self::InputsUpdate {
            session_id: session_id.to_string(),
            inputs: snapshot.inputs.clone(),
            vmix_version: snapshot.device_version.clone(),
            timestamp: Utc::now(),
            vmix_timestamp: snapshot.captured_at.timestamp_millis(),
        }
    }

    /// Heartbeat stamped now.
    pub fn ping() -> Self {
        Self::Ping {
            timestamp: Utc::now(),
        }
    }

    /// Wire name of this message.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::TallyUpdate { .. } => "tally_update",
            Self::InputsUpdate { .. } => "inputs_update",
            Self::Ping { .. } => "ping",
        }
    }

    /// Encode as a JSON text frame.
    ///
    /// # Errors
    ///
    /// Only fails if serialization itself fails, which the field types rule out
    /// in practice.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Message received from the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Connection acknowledgement with the server-assigned id.
    Connected {
        /// `clientId`, when the server sent one.
        client_id: Option<String>,
    },
    /// Session registration acknowledgement; the full message is kept.
    SessionRegistered(Value),
    /// Heartbeat reply.
    Pong,
    /// Server-reported error.
    Error {
        /// Server-supplied description.
        message: String,
    },
    /// Any other `type` (empty when the frame had none).
    Unknown(String),
}

impl InboundMessage {
    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// Fails only when the payload is not JSON. Valid JSON of an unexpected
    /// shape decodes to [`InboundMessage::Unknown`].
    pub fn decode(text: &str) -> serde_json::Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();

        Ok(match kind {
            "connected" => Self::Connected {
                client_id: value.get("clientId").and_then(|id| match id {
                    Value::Null => None,
                    Value::String(s) => Some(s.clone()),
                    other => Some(other.to_string()),
                }),
            },
            "session_registered" => Self::SessionRegistered(value),
            "pong" => Self::Pong,
            "error" => Self::Error {
                message: value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown server error")
                    .to_string(),
            },
            other => Self::Unknown(other.to_string()),
        })
    }
}
