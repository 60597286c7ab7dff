//! Decoding of the vMix XML state document.
//!
//! Only the parts the bridge needs are modeled; every other element
//! (overlays, transitions, audio, …) is skipped by the deserializer.
//!
//! ```xml
//! <vmix version="27.0.0.49">
//!   <inputs>
//!     <input number="1" title="Cam 1" shortTitle="C1" type="Camera"
//!            state="Running" duration="0" preview="False">Cam 1</input>
//!   </inputs>
//!   <active>1</active>
//!   <preview>2</preview>
//! </vmix>
//! ```
//!
//! Real devices put the version in a `<version>` child element rather than
//! an attribute; both are accepted.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::types::{InputDescriptor, InputId, InputMap, InputSetSnapshot, TallySnapshot};

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(rename = "@version", default)]
    version_attr: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    active: Option<String>,
    #[serde(default)]
    preview: Option<String>,
    #[serde(default)]
    inputs: Option<RawInputs>,
}

#[derive(Debug, Deserialize)]
struct RawInputs {
    #[serde(rename = "input", default)]
    input: Vec<RawInput>,
}

#[derive(Debug, Deserialize)]
struct RawInput {
    #[serde(rename = "@number", default)]
    number: Option<String>,
    #[serde(rename = "@title", default)]
    title: Option<String>,
    #[serde(rename = "@shortTitle", default)]
    short_title: Option<String>,
    #[serde(rename = "@type", default)]
    kind: Option<String>,
    #[serde(rename = "@state", default)]
    state: Option<String>,
    #[serde(rename = "@duration", default)]
    duration: Option<String>,
    #[serde(rename = "@preview", default)]
    preview: Option<String>,
}

/// One input entry of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentInput {
    /// Normalized descriptor.
    pub descriptor: InputDescriptor,
    /// Whether the input carries `preview="True"`.
    pub previewed: bool,
}

/// Decoded vMix state document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmixDocument {
    /// Device version, `"unknown"` if absent.
    pub version: String,
    /// Top-level `<active>` input.
    pub active: Option<InputId>,
    /// Top-level `<preview>` input.
    pub preview: Option<InputId>,
    /// Inputs section; `None` when the document has none.
    pub inputs: Option<Vec<DocumentInput>>,
}

impl VmixDocument {
    /// Parse a complete `<vmix>…</vmix>` document.
    pub fn parse(xml: &str) -> Result<Self, quick_xml::DeError> {
        let raw: RawDocument = quick_xml::de::from_str(xml)?;

        let inputs = raw.inputs.map(|section| {
            section
                .input
                .into_iter()
                .filter_map(normalize_input)
                .collect()
        });

        Ok(Self {
            version: raw
                .version_attr
                .or(raw.version)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "unknown".to_string()),
            active: raw.active.as_deref().and_then(parse_input_id),
            preview: raw.preview.as_deref().and_then(parse_input_id),
            inputs,
        })
    }

    /// The document's inputs as a map, if it has an inputs section.
    #[must_use]
    pub fn input_map(&self) -> Option<InputMap> {
        self.inputs.as_ref().map(|inputs| {
            inputs
                .iter()
                .map(|input| (input.descriptor.id, input.descriptor.clone()))
                .collect()
        })
    }

    /// Inputs snapshot, if the document has an inputs section.
    #[must_use]
    pub fn input_set(&self, captured_at: DateTime<Utc>) -> Option<InputSetSnapshot> {
        self.input_map().map(|inputs| InputSetSnapshot {
            inputs,
            device_version: self.version.clone(),
            captured_at,
        })
    }

    /// Derive program/preview from the document.
    ///
    /// The top-level `<active>`/`<preview>` values are a baseline; per-input
    /// values override them: a `Running` input becomes program and an input
    /// flagged `preview="True"` becomes preview. When the two sources
    /// disagree the per-input values win. This precedence mirrors how the
    /// device has been observed so far and still needs confirming against
    /// real hardware.
    #[must_use]
    pub fn tally(&self, inputs: InputMap, captured_at: DateTime<Utc>) -> TallySnapshot {
        let mut program = self.active;
        let mut preview = self.preview;

        for input in self.inputs.iter().flatten() {
            if input.descriptor.is_running() {
                program = Some(input.descriptor.id);
            }
            if input.previewed {
                preview = Some(input.descriptor.id);
            }
        }

        TallySnapshot {
            program,
            preview,
            inputs,
            captured_at,
            raw_status_line: None,
        }
    }
}

fn parse_input_id(text: &str) -> Option<InputId> {
    text.trim().parse::<InputId>().ok().filter(|&id| id > 0)
}

fn normalize_input(raw: RawInput) -> Option<DocumentInput> {
    let Some(id) = raw.number.as_deref().and_then(parse_input_id) else {
        log::warn!("[Vmix] Skipping input with invalid number {:?}", raw.number);
        return None;
    };

    let title = raw.title.unwrap_or_else(|| format!("Input {id}"));
    let descriptor = InputDescriptor::new(
        id,
        title,
        raw.short_title,
        raw.kind.unwrap_or_else(|| "Unknown".to_string()),
        raw.state.unwrap_or_else(|| "Paused".to_string()),
        raw.duration.unwrap_or_else(|| "0".to_string()),
    );

    Some(DocumentInput {
        descriptor,
        previewed: raw.preview.as_deref() == Some("True"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"<vmix version="27.0.0.49">
  <inputs>
    <input key="a" number="1" type="Colour" title="Black" state="Paused" duration="0">Black</input>
    <input key="b" number="2" type="Camera" title="Wide Shot" shortTitle="Wide" state="Paused" duration="0" preview="True">Wide Shot<overlay index="0" key="x"/></input>
    <input key="c" number="4" type="Camera" title="Close Up Left" state="Running" duration="0">Close Up Left</input>
  </inputs>
  <overlays><overlay number="1"/><overlay number="2"/></overlays>
  <transitions><transition number="1" effect="Fade" duration="500"/></transitions>
</vmix>"#;

    #[test]
    fn test_parse_inputs() {
        let doc = VmixDocument::parse(FULL).expect("parses");
        assert_eq!(doc.version, "27.0.0.49");

        let inputs = doc.input_map().expect("inputs section");
        assert_eq!(inputs.keys().copied().collect::<Vec<_>>(), vec![1, 2, 4]);
        assert_eq!(inputs[&2].short_title, "Wide");
        assert_eq!(inputs[&4].short_title, "Close Up L");
        assert_eq!(inputs[&4].kind, "Camera");
        assert_eq!(inputs[&1].state, "Paused");
    }

    #[test]
    fn test_running_and_previewed_inputs_without_top_level_fields() {
        let doc = VmixDocument::parse(FULL).expect("parses");
        let tally = doc.tally(InputMap::new(), Utc::now());
        assert_eq!(tally.program, Some(4));
        assert_eq!(tally.preview, Some(2));
        assert!(tally.raw_status_line.is_none());
    }

    #[test]
    fn test_top_level_fields_are_baseline() {
        let xml = r#"<vmix><version>26.0.0.40</version><inputs>
            <input number="1" title="One" state="Paused"/>
            <input number="3" title="Three" state="Paused"/>
        </inputs><active>3</active><preview>1</preview></vmix>"#;
        let doc = VmixDocument::parse(xml).expect("parses");
        assert_eq!(doc.version, "26.0.0.40");

        let tally = doc.tally(InputMap::new(), Utc::now());
        assert_eq!(tally.program, Some(3));
        assert_eq!(tally.preview, Some(1));
    }

    #[test]
    fn test_per_input_values_override_baseline() {
        let xml = r#"<vmix><inputs>
            <input number="1" state="Running"/>
            <input number="2" state="Paused" preview="True"/>
        </inputs><active>3</active><preview>4</preview></vmix>"#;
        let tally = VmixDocument::parse(xml)
            .expect("parses")
            .tally(InputMap::new(), Utc::now());
        assert_eq!(tally.program, Some(1));
        assert_eq!(tally.preview, Some(2));
    }

    #[test]
    fn test_fields_default_to_unset() {
        let doc = VmixDocument::parse("<vmix></vmix>").expect("parses");
        assert_eq!(doc.version, "unknown");
        assert!(doc.inputs.is_none());
        assert!(doc.input_set(Utc::now()).is_none());

        let tally = doc.tally(InputMap::new(), Utc::now());
        assert_eq!(tally.program, None);
        assert_eq!(tally.preview, None);
    }

    #[test]
    fn test_missing_attributes_get_defaults() {
        let doc = VmixDocument::parse(r#"<vmix><inputs><input number="7"/></inputs></vmix>"#)
            .expect("parses");
        let inputs = doc.input_map().expect("inputs");
        let input = &inputs[&7];
        assert_eq!(input.title, "Input 7");
        assert_eq!(input.short_title, "Input 7");
        assert_eq!(input.kind, "Unknown");
        assert_eq!(input.state, "Paused");
        assert_eq!(input.duration, "0");
    }

    #[test]
    fn test_invalid_input_numbers_are_skipped() {
        let doc = VmixDocument::parse(
            r#"<vmix><inputs><input number="x"/><input/><input number="2"/></inputs></vmix>"#,
        )
        .expect("parses");
        assert_eq!(doc.input_map().expect("inputs").len(), 1);
    }

    #[test]
    fn test_malformed_document_is_an_error() {
        assert!(VmixDocument::parse("<vmix><inputs><input number=\"1\"></vmix>").is_err());
    }
}
