//! Incremental framing of the vMix TCP stream.
//!
//! One byte stream carries two formats:
//!
//! ```text
//! SUBSCRIBE OK TALLY\r\n          acknowledgement line (ignored)
//! TALLY OK 0120\r\n               status-code push
//! 0120\r\n                        bare status code
//! XML 5120\r\n                    acknowledgement line (ignored)
//! <vmix version="27">...</vmix>   XML state document
//! ```
//!
//! The parser is a two-mode state machine. In [`Mode::AwaitingLine`] it
//! consumes CRLF-terminated lines until an opening `<` shows up before the
//! next line break, then switches to [`Mode::AwaitingDocument`] and buffers
//! until `</vmix>`. Nothing is emitted until its terminator has arrived;
//! anything after it stays buffered for the next [`StreamParser::push`].

use bytes::{Buf, BytesMut};

use crate::constants::{MAX_DOCUMENT_BYTES, VMIX_DOCUMENT_END};

const CRLF: &[u8] = b"\r\n";

/// Prefix the device uses for pushed status codes.
const TALLY_PUSH_PREFIX: &str = "TALLY OK ";

/// Parser mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Expecting CRLF-terminated lines.
    AwaitingLine,
    /// Inside an XML document, waiting for the closing tag.
    AwaitingDocument,
}

/// A complete message cut from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Status-code digits (`"0120"`), with any push prefix removed.
    StatusCode(String),
    /// Any other complete line (command acknowledgements).
    Line(String),
    /// A complete XML document, from `<` through `</vmix>`.
    Document(String),
    /// An unterminated line or document exceeded the buffer limit and was
    /// dropped.
    Overflow(usize),
}

/// Buffered two-mode parser for the vMix TCP stream.
#[derive(Debug)]
pub struct StreamParser {
    buffer: BytesMut,
    mode: Mode,
    max_document: usize,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    /// Create a parser with the default document size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(MAX_DOCUMENT_BYTES)
    }

    /// Create a parser with a custom document size limit.
    #[must_use]
    pub fn with_limit(max_document: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
            mode: Mode::AwaitingLine,
            max_document,
        }
    }

    /// Current mode.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Bytes buffered but not yet framed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial input and return to line mode.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.mode = Mode::AwaitingLine;
    }

    /// Append received bytes and return every frame they complete.
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            let next = match self.mode {
                Mode::AwaitingLine => self.next_line(),
                Mode::AwaitingDocument => self.next_document(),
            };
            match next {
                Step::Frame(frame) => frames.push(frame),
                Step::Continue => {}
                Step::NeedMore => break,
            }
        }
        frames
    }

    fn next_line(&mut self) -> Step {
        let newline = find(&self.buffer, CRLF);
        let open_tag = self.buffer.iter().position(|&b| b == b'<');

        match (open_tag, newline) {
            (Some(tag), nl) if nl.is_none_or(|nl| tag < nl) => {
                if tag > 0 {
                    log::trace!(
                        "[Vmix] Discarding {} bytes before document start",
                        tag
                    );
                    self.buffer.advance(tag);
                }
                self.mode = Mode::AwaitingDocument;
                Step::Continue
            }
            (_, Some(nl)) => {
                let line = self.buffer.split_to(nl);
                self.buffer.advance(CRLF.len());
                let line = String::from_utf8_lossy(&line).trim().to_string();
                if line.is_empty() {
                    Step::Continue
                } else {
                    Step::Frame(classify_line(line))
                }
            }
            _ if self.buffer.len() > self.max_document => {
                let dropped = self.buffer.len();
                self.reset();
                Step::Frame(Frame::Overflow(dropped))
            }
            _ => Step::NeedMore,
        }
    }

    fn next_document(&mut self) -> Step {
        if let Some(end) = find(&self.buffer, VMIX_DOCUMENT_END.as_bytes()) {
            let document = self.buffer.split_to(end + VMIX_DOCUMENT_END.len());
            self.mode = Mode::AwaitingLine;
            return Step::Frame(Frame::Document(
                String::from_utf8_lossy(&document).into_owned(),
            ));
        }

        if self.buffer.len() > self.max_document {
            let dropped = self.buffer.len();
            self.reset();
            return Step::Frame(Frame::Overflow(dropped));
        }

        Step::NeedMore
    }
}

/// Result of one framing step.
enum Step {
    Frame(Frame),
    Continue,
    NeedMore,
}

/// Classify a complete, trimmed, non-empty line.
fn classify_line(line: String) -> Frame {
    let code = line.strip_prefix(TALLY_PUSH_PREFIX).unwrap_or(&line);
    if is_status_code(code) {
        Frame::StatusCode(code.to_string())
    } else {
        Frame::Line(line)
    }
}

/// A status code is a non-empty run of `0`, `1` and `2`.
#[must_use]
pub fn is_status_code(text: &str) -> bool {
    !text.is_empty() && text.bytes().all(|b| matches!(b, b'0' | b'1' | b'2'))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
