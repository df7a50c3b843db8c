//! Stdio bridge between the engine's raw byte callbacks and text handlers
//!
//! Output bytes are decoded as UTF-8 (a multi-byte sequence split across
//! two writes is held back until it completes), line endings are
//! normalized to the platform convention, and the text is forwarded to
//! the line parser, the transcript and the host's [`StdioHandler`].
//! Input requests are served from a pending buffer refilled on demand.

use std::sync::{Arc, Mutex, PoisonError};

use log::debug;

use crate::engine::StdioChannels;
use crate::events::Observers;
use crate::processor::parser::{Channel, OutputParser, ProgressState};
use crate::processor::ProcessorEvent;

#[cfg(windows)]
const LINE_END: &str = "\r\n";
#[cfg(not(windows))]
const LINE_END: &str = "\n";

/// Host-side stdio handler; every method has a do-nothing default
pub trait StdioHandler: Send + Sync {
    /// Asked for more input when the pending buffer is empty.
    /// `count` is the engine's buffer size. `None` means end of input.
    fn std_in(&self, _count: usize) -> Option<String> {
        None
    }

    fn std_out(&self, _text: &str) {}

    fn std_err(&self, _text: &str) {}
}

/// Decoder state for one output channel
#[derive(Debug, Default)]
struct Utf8Carry {
    tail: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, data: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.tail);
        bytes.extend_from_slice(data);

        let complete = match std::str::from_utf8(&bytes) {
            Ok(_) => bytes.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => bytes.len(),
        };
        self.tail = bytes.split_off(complete);

        let mut text = String::from_utf8_lossy(&bytes).into_owned();
        // a lone CR may be the first half of CRLF
        if text.ends_with('\r') {
            text.pop();
            self.tail.insert(0, b'\r');
        }
        text
    }
}

fn normalize_line_endings(text: &str) -> String {
    let unix = text.replace("\r\n", "\n");
    if LINE_END == "\n" {
        unix
    } else {
        unix.replace('\n', LINE_END)
    }
}

pub struct StdioBridge {
    channels: StdioChannels,
    handler: Option<Arc<dyn StdioHandler>>,
    pending_input: Mutex<Vec<u8>>,
    stdout_decoder: Mutex<Utf8Carry>,
    stderr_decoder: Mutex<Utf8Carry>,
    transcript: Mutex<String>,
    capture: Mutex<Option<String>>,
    parser: OutputParser,
    events: Arc<Observers<ProcessorEvent>>,
}

impl StdioBridge {
    pub fn new(
        handler: Option<Arc<dyn StdioHandler>>,
        channels: StdioChannels,
        events: Arc<Observers<ProcessorEvent>>,
    ) -> Self {
        Self {
            channels,
            handler,
            pending_input: Mutex::new(Vec::new()),
            stdout_decoder: Mutex::default(),
            stderr_decoder: Mutex::default(),
            transcript: Mutex::new(String::new()),
            capture: Mutex::new(None),
            parser: OutputParser::new(),
            events,
        }
    }

    #[must_use]
    pub fn channels(&self) -> StdioChannels {
        self.channels
    }

    /// Queues text to be served to the engine before asking the handler
    pub fn push_input(&self, text: &str) {
        self.pending_input
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(text.as_bytes());
    }

    /// Copies at most `buf.len()` bytes, stopping after the first newline
    pub fn read_input(&self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }

        let empty = self
            .pending_input
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty();
        if empty {
            let supplied = self
                .handler
                .as_ref()
                .and_then(|handler| handler.std_in(buf.len()));
            match supplied {
                Some(text) if !text.is_empty() => self.push_input(&text),
                _ => return 0,
            }
        }

        let mut pending = self
            .pending_input
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let window = &pending[..pending.len().min(buf.len())];
        let count = window
            .iter()
            .position(|&b| b == b'\n')
            .map_or(window.len(), |newline| newline + 1);
        buf[..count].copy_from_slice(&pending[..count]);
        pending.drain(..count);
        count
    }

    /// Consumes the whole of `data` and returns its length
    pub fn write(&self, channel: Channel, data: &[u8]) -> usize {
        let decoder = match channel {
            Channel::Output => &self.stdout_decoder,
            Channel::Error => &self.stderr_decoder,
        };
        let raw = decoder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .decode(data);
        if raw.is_empty() {
            return data.len();
        }
        let text = normalize_line_endings(&raw);

        self.transcript
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(&text);
        if channel == Channel::Output {
            if let Some(captured) = self
                .capture
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_mut()
            {
                captured.push_str(&text);
            }
        }

        let events = self.parser.feed(channel, &text);

        if let Some(handler) = &self.handler {
            match channel {
                Channel::Output => handler.std_out(&text),
                Channel::Error => handler.std_err(&text),
            }
        }

        for event in &events {
            self.events.emit(event);
        }
        data.len()
    }

    /// Starts collecting stdout text for a single command
    pub fn begin_capture(&self) {
        *self.capture.lock().unwrap_or_else(PoisonError::into_inner) = Some(String::new());
    }

    pub fn end_capture(&self) -> String {
        self.capture
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_default()
    }

    /// Everything written to stdout and stderr so far, interleaved
    #[must_use]
    pub fn transcript(&self) -> String {
        self.transcript
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn progress(&self) -> ProgressState {
        self.parser.progress()
    }

    pub fn reset(&self) {
        debug!("Resetting stdio bridge state");
        self.pending_input
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.transcript
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.parser.reset();
    }
}

impl std::fmt::Debug for StdioBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioBridge")
            .field("channels", &self.channels)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}
