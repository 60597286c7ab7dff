//! Normalized tally and input snapshots produced by the vMix client.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::SHORT_TITLE_CHARS;

/// vMix input number (1-based, unique within a device).
pub type InputId = u32;

/// Inputs keyed by number; ordered so equality and serialization are stable.
pub type InputMap = BTreeMap<InputId, InputDescriptor>;

/// One vMix input as last reported by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDescriptor {
    /// Input number.
    #[serde(rename = "number")]
    pub id: InputId,
    /// Full title.
    pub title: String,
    /// Short title for compact displays.
    #[serde(rename = "shortTitle")]
    pub short_title: String,
    /// Input type (`Camera`, `Colour`, `Video`, …).
    #[serde(rename = "type")]
    pub kind: String,
    /// Playback state (`Running`, `Paused`, …).
    pub state: String,
    /// Duration in milliseconds, as the device reports it.
    pub duration: String,
}

impl InputDescriptor {
    /// Build a descriptor, deriving the short title when none is given.
    pub fn new(
        id: InputId,
        title: impl Into<String>,
        short_title: Option<String>,
        kind: impl Into<String>,
        state: impl Into<String>,
        duration: impl Into<String>,
    ) -> Self {
        let title = title.into();
        let short_title =
            short_title.unwrap_or_else(|| title.chars().take(SHORT_TITLE_CHARS).collect());
        Self {
            id,
            title,
            short_title,
            kind: kind.into(),
            state: state.into(),
            duration: duration.into(),
        }
    }

    /// Whether the device reports this input as playing.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == "Running"
    }
}

/// Program/preview state at one moment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TallySnapshot {
    /// Input currently on air.
    pub program: Option<InputId>,
    /// Input staged for the next cut.
    pub preview: Option<InputId>,
    /// Last known inputs (carried over, not re-derived, for status lines).
    pub inputs: InputMap,
    /// When the state was captured.
    pub captured_at: DateTime<Utc>,
    /// The status-code line this snapshot came from, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_status_line: Option<String>,
}

impl TallySnapshot {
    /// Decode a status-code line (`0` off, `1` program, `2` preview).
    ///
    /// Digit `i` describes input `i + 1`. If the device ever reports two
    /// program (or preview) inputs the last one wins, so at most one of
    /// each is set and they never name the same input.
    pub fn from_status_code(code: &str, inputs: InputMap) -> Self {
        let mut program = None;
        let mut preview = None;

        for (index, digit) in code.chars().enumerate() {
            let Ok(number) = InputId::try_from(index + 1) else {
                break;
            };
            match digit {
                '1' => program = Some(number),
                '2' => preview = Some(number),
                _ => {}
            }
        }

        Self {
            program,
            preview,
            inputs,
            captured_at: Utc::now(),
            raw_status_line: Some(code.to_string()),
        }
    }
}

/// Full set of inputs as of one XML document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputSetSnapshot {
    /// All inputs.
    pub inputs: InputMap,
    /// Device software version (`"unknown"` if not reported).
    pub device_version: String,
    /// When the document was captured.
    pub captured_at: DateTime<Utc>,
}
