//! Forward-only tokenizer for document structuring comments
//!
//! Scans `%%Keyword: value value ...` lines in PostScript text. The cursor
//! never moves backwards: callers ask for a keyword, then for the values
//! that follow it on the same line, in order.

use std::borrow::Cow;
use std::ops::Range;

use log::debug;

use super::geometry::Rect;

/// Line prefixes that introduce a structuring comment
const MARKERS: [&[u8]; 2] = [b"%%", b"%!"];

/// What terminated a value token
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ending {
    Whitespace,
    LineEnd,
    /// Whitespace that ran up to the end of the line
    Both,
}

/// Delimiter classes a value token may stop at. A line end always
/// stops a value, since values never span lines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndingMask {
    pub whitespace: bool,
    pub line_end: bool,
}

impl EndingMask {
    pub const WHITESPACE: Self = Self {
        whitespace: true,
        line_end: false,
    };
    pub const LINE_END: Self = Self {
        whitespace: false,
        line_end: true,
    };
    pub const BOTH: Self = Self {
        whitespace: true,
        line_end: true,
    };
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DscToken<'a> {
    pub text: Cow<'a, str>,
    pub ending: Ending,
}

pub struct DscTokenizer<'a> {
    data: &'a [u8],
    start: usize,
    pos: usize,
    end: usize,
    /// Cursor sits on a keyword line whose values are not exhausted
    in_line: bool,
}

fn is_blank(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

fn is_line_end(b: u8) -> bool {
    b == b'\n' || b == b'\r'
}

impl<'a> DscTokenizer<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_range(data, 0..data.len())
    }

    /// Restricts scanning to `range` of a larger buffer
    #[must_use]
    pub fn with_range(data: &'a [u8], range: Range<usize>) -> Self {
        let end = range.end.min(data.len());
        let start = range.start.min(end);
        Self {
            data,
            start,
            pos: start,
            end,
            in_line: false,
        }
    }

    fn peek(&self) -> Option<u8> {
        (self.pos < self.end).then(|| self.data[self.pos])
    }

    fn at_line_start(&self) -> bool {
        self.pos == self.start || is_line_end(self.data[self.pos - 1])
    }

    /// Consumes one `\n`, `\r` or `\r\n`
    fn skip_line_end(&mut self) {
        match self.peek() {
            Some(b'\r') => {
                self.pos += 1;
                if self.peek() == Some(b'\n') {
                    self.pos += 1;
                }
            }
            Some(b'\n') => self.pos += 1,
            _ => {}
        }
    }

    fn skip_rest_of_line(&mut self) {
        while let Some(b) = self.peek() {
            if is_line_end(b) {
                break;
            }
            self.pos += 1;
        }
        self.skip_line_end();
    }

    fn skip_blanks(&mut self) {
        while self.peek().is_some_and(is_blank) {
            self.pos += 1;
        }
    }

    fn text(&self, range: Range<usize>) -> Cow<'a, str> {
        String::from_utf8_lossy(&self.data[range])
    }

    /// Advances to the next comment keyword such as `%%BoundingBox:`.
    /// Any values left on the current line are skipped.
    pub fn next_keyword_token(&mut self) -> Option<DscToken<'a>> {
        self.in_line = false;
        if !self.at_line_start() {
            self.skip_rest_of_line();
        }

        while self.pos < self.end {
            let line = &self.data[self.pos..self.end];
            if MARKERS.iter().any(|m| line.starts_with(m)) {
                let start = self.pos;
                while let Some(b) = self.peek() {
                    if is_blank(b) || is_line_end(b) {
                        break;
                    }
                    self.pos += 1;
                    if b == b':' {
                        break;
                    }
                }
                let text = self.text(start..self.pos);
                let ending = match self.peek() {
                    Some(b) if is_blank(b) => Ending::Whitespace,
                    _ => Ending::LineEnd,
                };
                if ending == Ending::LineEnd {
                    self.skip_line_end();
                } else {
                    self.in_line = true;
                }
                // keywords ending in ':' may be followed directly by a value
                if text.ends_with(':') && self.peek().is_some_and(|b| !is_line_end(b)) {
                    self.in_line = true;
                }
                return Some(DscToken { text, ending });
            }
            self.skip_rest_of_line();
        }
        None
    }

    /// Next value on the current keyword line, or `None` once the line
    /// is exhausted
    pub fn next_value_token(&mut self, mask: EndingMask) -> Option<DscToken<'a>> {
        if !self.in_line {
            return None;
        }
        self.skip_blanks();
        match self.peek() {
            None => {
                self.in_line = false;
                return None;
            }
            Some(b) if is_line_end(b) => {
                self.skip_line_end();
                self.in_line = false;
                return None;
            }
            Some(_) => {}
        }

        let start = self.pos;
        while let Some(b) = self.peek() {
            if is_line_end(b) || (mask.whitespace && is_blank(b)) {
                break;
            }
            self.pos += 1;
        }
        let raw = &self.data[start..self.pos];
        let trimmed_len = raw.len() - raw.iter().rev().take_while(|&&b| is_blank(b)).count();
        let text = self.text(start..start + trimmed_len);

        let ending = match self.peek() {
            Some(b) if is_blank(b) => {
                self.skip_blanks();
                match self.peek() {
                    None => Ending::Both,
                    Some(b) if is_line_end(b) => Ending::Both,
                    Some(_) => Ending::Whitespace,
                }
            }
            _ => Ending::LineEnd,
        };
        if ending != Ending::Whitespace {
            self.skip_line_end();
            self.in_line = false;
        }
        Some(DscToken { text, ending })
    }
}

/// First usable `%%BoundingBox:` in `data`. A `(atend)` value defers to a
/// later comment; malformed values give `None`.
#[must_use]
pub fn find_bounding_box(tokens: &mut DscTokenizer<'_>) -> Option<Rect> {
    while let Some(keyword) = tokens.next_keyword_token() {
        if keyword.text != "%%BoundingBox:" {
            continue;
        }
        let mut values = Vec::with_capacity(4);
        while values.len() < 4 {
            match tokens.next_value_token(EndingMask::BOTH) {
                Some(token) => values.push(token.text),
                None => break,
            }
        }
        if values.first().is_some_and(|v| v == "(atend)") {
            continue;
        }
        let rect = Rect::parse(&values.join(" "));
        if rect.is_none() {
            debug!("Ignoring malformed bounding box {values:?}");
        }
        return rect;
    }
    None
}

/// Value of the first `%%Pages:` comment that carries a count
#[must_use]
pub fn find_page_count(tokens: &mut DscTokenizer<'_>) -> Option<u32> {
    while let Some(keyword) = tokens.next_keyword_token() {
        if keyword.text != "%%Pages:" {
            continue;
        }
        let Some(value) = tokens.next_value_token(EndingMask::BOTH) else {
            continue;
        };
        if value.text == "(atend)" {
            continue;
        }
        match value.text.parse::<u32>() {
            Ok(count) => return Some(count),
            Err(e) => debug!("Ignoring page count {:?}: {e}", value.text),
        }
    }
    None
}
