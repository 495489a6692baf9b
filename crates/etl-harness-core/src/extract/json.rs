//! JSON fragment scanner.
//!
//! A line automaton that tracks `{`/`}` and `[`/`]` balance. A span opens on
//! a `{` anywhere in a line, or on a `[` that is the first non-blank
//! character of a line, and closes on the character that brings both
//! counters back to zero. Brackets inside string literals are ignored.
//!
//! A stray opener in prose would otherwise swallow everything after it, so
//! an open span is abandoned when a line starting with `{` or `[` in column
//! zero follows a blank line; that line opens a fresh span instead.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::models::{Fragment, FragmentType, ParsedData};

fn trailing_comma() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",\s*([}\]])").expect("trailing comma pattern is valid"))
}

/// An open span being accumulated.
#[derive(Debug)]
struct Span {
    start_line: usize,
    text: String,
    braces: i64,
    brackets: i64,
    in_string: bool,
    escaped: bool,
}

enum Balance {
    Open,
    Balanced,
    Broken,
}

impl Span {
    fn new(start_line: usize) -> Self {
        Self {
            start_line,
            text: String::new(),
            braces: 0,
            brackets: 0,
            in_string: false,
            escaped: false,
        }
    }

    fn count(&mut self, ch: char) -> Balance {
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if ch == '\\' {
                self.escaped = true;
            } else if ch == '"' {
                self.in_string = false;
            }
            return Balance::Open;
        }
        match ch {
            '"' => self.in_string = true,
            '{' => self.braces += 1,
            '}' => self.braces -= 1,
            '[' => self.brackets += 1,
            ']' => self.brackets -= 1,
            _ => {}
        }
        if self.braces < 0 || self.brackets < 0 {
            Balance::Broken
        } else if self.braces == 0 && self.brackets == 0 {
            Balance::Balanced
        } else {
            Balance::Open
        }
    }

    /// JSON strings cannot span lines; a stray quote must not swallow the
    /// rest of the document.
    fn end_line(&mut self) {
        self.in_string = false;
        self.escaped = false;
        self.text.push('\n');
    }
}

#[derive(Debug)]
enum State {
    Idle,
    Accumulating(Span),
    Closing(Span),
}

pub(crate) struct JsonScanner {
    state: State,
    fragments: Vec<Fragment>,
    after_blank: bool,
}

impl JsonScanner {
    pub(crate) fn new() -> Self {
        Self {
            state: State::Idle,
            fragments: Vec::new(),
            after_blank: false,
        }
    }

    pub(crate) fn feed(&mut self, line_no: usize, line: &str) {
        let restarts = self.after_blank && (line.starts_with('{') || line.starts_with('['));
        self.after_blank = line.trim().is_empty();
        if restarts {
            if let State::Accumulating(span) = &self.state {
                debug!(start_line = span.start_line, line_no, "abandoned JSON span at new block");
                self.state = State::Idle;
            }
        }

        // Byte offset in `line` where the current span's text for this line begins.
        let mut segment_start = 0;
        for (idx, ch) in line.char_indices() {
            let state = std::mem::replace(&mut self.state, State::Idle);
            self.state = match state {
                State::Idle => {
                    let opens = ch == '{' || (ch == '[' && line[..idx].trim().is_empty());
                    if !opens {
                        State::Idle
                    } else {
                        segment_start = idx;
                        let mut span = Span::new(line_no);
                        match span.count(ch) {
                            Balance::Open => State::Accumulating(span),
                            _ => State::Idle,
                        }
                    }
                }
                State::Accumulating(mut span) => match span.count(ch) {
                    Balance::Open => State::Accumulating(span),
                    Balance::Balanced => {
                        span.text
                            .push_str(&line[segment_start..idx + ch.len_utf8()]);
                        State::Closing(span)
                    }
                    Balance::Broken => {
                        debug!(start_line = span.start_line, line_no, "unbalanced JSON span dropped");
                        State::Idle
                    }
                },
                State::Closing(span) => State::Closing(span),
            };
            if let State::Closing(_) = self.state {
                self.close(line_no);
            }
        }
        if let State::Accumulating(span) = &mut self.state {
            span.text.push_str(&line[segment_start..]);
            span.end_line();
        }
    }

    fn close(&mut self, end_line: usize) {
        let State::Closing(span) = std::mem::replace(&mut self.state, State::Idle) else {
            return;
        };
        let Some((value, repaired)) = parse_span(&span.text) else {
            debug!(start_line = span.start_line, end_line, "JSON span failed to parse");
            return;
        };
        let parsed = match value {
            Value::Object(map) => ParsedData::Record(map),
            Value::Array(items) => ParsedData::Records(items),
            _ => return,
        };
        let mut fragment = Fragment::new(
            FragmentType::Json,
            span.start_line,
            end_line,
            span.text,
            parsed,
        );
        fragment.repaired = repaired;
        self.fragments.push(fragment);
    }

    /// Unterminated spans at end of input are dropped.
    pub(crate) fn finish(self) -> Vec<Fragment> {
        if let State::Accumulating(span) = &self.state {
            debug!(start_line = span.start_line, "unterminated JSON span dropped");
        }
        self.fragments
    }
}

/// Strict parse, then a retry with trailing commas before `}`/`]` removed.
fn parse_span(text: &str) -> Option<(Value, bool)> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Some((value, false));
    }
    let fixed = trailing_comma().replace_all(text, "$1");
    serde_json::from_str::<Value>(&fixed)
        .ok()
        .map(|value| (value, true))
}
