//! Line scanner for interpreter output
//!
//! Text arrives in arbitrary fragments, sometimes one character per
//! write. Each channel keeps its own unterminated tail until a line end
//! shows up, so the events produced do not depend on how the output
//! was chunked.

use std::sync::{Mutex, PoisonError};

use log::debug;

use super::ProcessorEvent;

/// Which stdio stream a fragment came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    Output,
    Error,
}

/// Accumulated text not yet terminated by a line end
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    pub fn append(&mut self, text: &str) {
        self.pending.push_str(text);
    }

    /// Removes and returns every complete line, without terminators.
    /// Both `\n` and `\r\n` terminate a line.
    pub fn take_lines(&mut self) -> Vec<String> {
        let Some(last_newline) = self.pending.rfind('\n') else {
            return Vec::new();
        };
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        complete
            .split_terminator('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
            .collect()
    }

    #[must_use]
    pub fn pending(&self) -> &str {
        &self.pending
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Page counters recovered from the interpreter's own progress lines
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProgressState {
    /// 0 until a "Processing pages" line is seen
    pub total_pages: u32,
    pub current_page: u32,
}

impl ProgressState {
    #[must_use]
    pub fn total(&self) -> Option<u32> {
        (self.total_pages > 0).then_some(self.total_pages)
    }
}

#[derive(Debug, Default)]
pub struct OutputParser {
    stdout: Mutex<LineBuffer>,
    stderr: Mutex<LineBuffer>,
    progress: Mutex<ProgressState>,
}

impl OutputParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a normalized fragment and returns the events for every line
    /// it completed, in order.
    pub fn feed(&self, channel: Channel, text: &str) -> Vec<ProcessorEvent> {
        let lines = {
            let buffer = match channel {
                Channel::Output => &self.stdout,
                Channel::Error => &self.stderr,
            };
            let mut buffer = buffer.lock().unwrap_or_else(PoisonError::into_inner);
            buffer.append(text);
            buffer.take_lines()
        };

        let mut events = Vec::new();
        for line in lines {
            match channel {
                Channel::Output => {
                    if let Some(event) = self.interpret_output_line(&line) {
                        events.push(event);
                    }
                }
                Channel::Error => events.push(ProcessorEvent::ProcessingError(line)),
            }
        }
        events
    }

    #[must_use]
    pub fn progress(&self) -> ProgressState {
        *self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops buffered partial lines and page counters
    pub fn reset(&self) {
        self.stdout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.stderr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = ProgressState::default();
    }

    fn interpret_output_line(&self, line: &str) -> Option<ProcessorEvent> {
        if line.starts_with("Processing pages") {
            let last = progress_tokens(line).last()?;
            let digits = last.strip_suffix('.').unwrap_or(last);
            match digits.parse::<u32>() {
                Ok(total) => {
                    let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
                    progress.total_pages = progress.total_pages.max(total);
                }
                Err(e) => debug!("Ignoring page total in {line:?}: {e}"),
            }
            return None;
        }

        if line.starts_with("Page") {
            let token = progress_tokens(line).nth(1)?;
            return match token.parse::<u32>() {
                Ok(current) => {
                    let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
                    progress.current_page = current;
                    Some(ProcessorEvent::PageProgress {
                        current,
                        total: progress.total(),
                    })
                }
                Err(e) => {
                    debug!("Ignoring page number in {line:?}: {e}");
                    None
                }
            };
        }

        None
    }
}

fn progress_tokens(line: &str) -> impl Iterator<Item = &str> {
    line.split(|c: char| c.is_whitespace() || c == '-')
        .filter(|token| !token.is_empty())
}
