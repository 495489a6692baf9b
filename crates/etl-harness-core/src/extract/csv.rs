//! Delimited-text (CSV) fragment scanner.
//!
//! A block starts at the first non-blank line containing one of the
//! candidate delimiters and continues while lines contain that delimiter
//! (blank lines are tolerated). Lines that look like JSON or markup end
//! the block and are never part of one. The first parsed row is the header;
//! a block needs at least two data rows to be kept.

use serde_json::Value;
use tracing::debug;

use crate::models::{Fragment, FragmentType, ParsedData, Record};

const DELIMITERS: [char; 4] = [',', ';', '\t', '|'];
const MIN_DATA_ROWS: usize = 2;

#[derive(Debug)]
struct Block {
    start_line: usize,
    last_line: usize,
    delimiter: char,
    lines: Vec<String>,
}

#[derive(Debug)]
enum State {
    Idle,
    Accumulating(Block),
}

pub(crate) struct CsvScanner {
    state: State,
    fragments: Vec<Fragment>,
}

impl CsvScanner {
    pub(crate) fn new() -> Self {
        Self {
            state: State::Idle,
            fragments: Vec::new(),
        }
    }

    pub(crate) fn feed(&mut self, line_no: usize, line: &str) {
        let stripped = line.trim();
        if looks_structured(stripped) {
            self.close();
            return;
        }
        match self.state {
            State::Idle => self.try_open(line_no, line),
            State::Accumulating(ref mut block) if stripped.contains(block.delimiter) => {
                block.lines.push(line.to_string());
                block.last_line = line_no;
            }
            State::Accumulating(ref mut block) if stripped.is_empty() => {
                block.lines.push(line.to_string());
            }
            State::Accumulating(_) => {
                self.close();
                self.try_open(line_no, line);
            }
        }
    }

    fn try_open(&mut self, line_no: usize, line: &str) {
        if let Some(delimiter) = detect_delimiter(line.trim()) {
            self.state = State::Accumulating(Block {
                start_line: line_no,
                last_line: line_no,
                delimiter,
                lines: vec![line.to_string()],
            });
        }
    }

    fn close(&mut self) {
        let State::Accumulating(block) = std::mem::replace(&mut self.state, State::Idle) else {
            return;
        };
        let keep = block.last_line - block.start_line + 1;
        let content = block.lines[..keep].join("\n");
        let rows = match parse_rows(&content, block.delimiter) {
            Ok(rows) => rows,
            Err(e) => {
                debug!(start_line = block.start_line, error = %e, "CSV block failed to parse");
                return;
            }
        };
        if rows.len() < MIN_DATA_ROWS {
            debug!(
                start_line = block.start_line,
                rows = rows.len(),
                "CSV block too short"
            );
            return;
        }
        let mut fragment = Fragment::new(
            FragmentType::Csv,
            block.start_line,
            block.last_line,
            content,
            ParsedData::Records(rows.into_iter().map(Value::Object).collect()),
        );
        fragment.delimiter = Some(block.delimiter);
        self.fragments.push(fragment);
    }

    pub(crate) fn finish(mut self) -> Vec<Fragment> {
        self.close();
        self.fragments
    }
}

/// JSON- or markup-looking lines are never CSV.
fn looks_structured(stripped: &str) -> bool {
    stripped.starts_with(['{', '[', '}', ']'])
        || (stripped.contains(':') && stripped.contains('{'))
        || (stripped.starts_with('<') && stripped.ends_with('>'))
}

/// A comma only counts when the line has no `:`, which keeps `key: a, b`
/// prose and JSON members out of CSV blocks.
fn detect_delimiter(stripped: &str) -> Option<char> {
    if stripped.is_empty() {
        return None;
    }
    DELIMITERS
        .into_iter()
        .find(|&d| stripped.contains(d) && (d != ',' || !stripped.contains(':')))
}

/// Header-keyed rows. Short rows are padded with nulls; surplus cells are dropped.
fn parse_rows(content: &str, delimiter: char) -> Result<Vec<Record>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter as u8)
        .has_headers(true)
        .flexible(true)
        .from_reader(content.as_bytes());
    let headers = reader.headers()?.clone();
    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result?;
        let row: Record = headers
            .iter()
            .enumerate()
            .map(|(i, h)| {
                let value = record
                    .get(i)
                    .map(|cell| Value::String(cell.to_string()))
                    .unwrap_or(Value::Null);
                (h.to_string(), value)
            })
            .collect();
        rows.push(row);
    }
    Ok(rows)
}
