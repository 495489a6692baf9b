//! HTML fragment scanner and table extraction.
//!
//! A fragment is a maximal run of consecutive lines containing a tag,
//! tolerating blank lines inside the run. Each completed run is parsed with
//! `scraper` and its `<table>` elements are turned into header-keyed rows.

use std::sync::OnceLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::{json, Value};
use tracing::debug;

use crate::models::{Fragment, FragmentType, ParsedData, Record};

fn tag_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").expect("tag pattern is valid"))
}

#[derive(Debug)]
struct Run {
    start_line: usize,
    last_tag_line: usize,
    lines: Vec<String>,
}

#[derive(Debug)]
enum State {
    Idle,
    Accumulating(Run),
}

pub(crate) struct HtmlScanner {
    state: State,
    fragments: Vec<Fragment>,
}

impl HtmlScanner {
    pub(crate) fn new() -> Self {
        Self {
            state: State::Idle,
            fragments: Vec::new(),
        }
    }

    pub(crate) fn feed(&mut self, line_no: usize, line: &str) {
        let is_tag_line = tag_pattern().is_match(line);
        match self.state {
            State::Idle if is_tag_line => {
                self.state = State::Accumulating(Run {
                    start_line: line_no,
                    last_tag_line: line_no,
                    lines: vec![line.to_string()],
                });
            }
            State::Idle => {}
            State::Accumulating(ref mut run) if is_tag_line => {
                run.lines.push(line.to_string());
                run.last_tag_line = line_no;
            }
            State::Accumulating(ref mut run) if line.trim().is_empty() => {
                run.lines.push(line.to_string());
            }
            State::Accumulating(_) => self.close(),
        }
    }

    fn close(&mut self) {
        let State::Accumulating(run) = std::mem::replace(&mut self.state, State::Idle) else {
            return;
        };
        // Blank lines after the last tag line belong to the gap, not the run.
        let keep = run.last_tag_line - run.start_line + 1;
        let content = run.lines[..keep].join("\n");

        let document = Html::parse_fragment(&content);
        let tables = parse_tables(&document);
        let has_text = document
            .root_element()
            .text()
            .any(|t| !t.trim().is_empty());

        if tables.is_empty() && !has_text {
            debug!(start_line = run.start_line, "HTML run without tables or text dropped");
            return;
        }
        self.fragments.push(Fragment::new(
            FragmentType::Html,
            run.start_line,
            run.last_tag_line,
            content,
            ParsedData::Records(tables),
        ));
    }

    pub(crate) fn finish(mut self) -> Vec<Fragment> {
        self.close();
        self.fragments
    }
}

/// Extract every `<table>` as `{"table": [row, ...]}`, where each row maps
/// header text to cell text. The header row comes from `<thead>` when
/// present, otherwise from the first row with cells.
pub(crate) fn parse_tables(document: &Html) -> Vec<Value> {
    let (Ok(table_sel), Ok(thead_row_sel), Ok(row_sel), Ok(cell_sel)) = (
        Selector::parse("table"),
        Selector::parse("thead tr"),
        Selector::parse("tr"),
        Selector::parse("th, td"),
    ) else {
        return Vec::new();
    };

    let mut tables = Vec::new();
    for table in document.select(&table_sel) {
        let cells_of = |row: ElementRef| -> Vec<String> {
            row.select(&cell_sel).map(|cell| cell_text(&cell)).collect()
        };

        let (headers, body): (Vec<String>, Vec<Vec<String>>) =
            match table.select(&thead_row_sel).next() {
                Some(header_row) => (
                    cells_of(header_row),
                    table
                        .select(&row_sel)
                        .filter(|row| !inside_thead(row))
                        .map(cells_of)
                        .collect(),
                ),
                None => {
                    let mut rows = table
                        .select(&row_sel)
                        .map(cells_of)
                        .filter(|cells| !cells.is_empty());
                    let headers = rows.next().unwrap_or_default();
                    (headers, rows.collect())
                }
            };

        let rows: Vec<Value> = body
            .into_iter()
            .filter(|cells| !cells.is_empty())
            .map(|cells| {
                let row: Record = headers
                    .iter()
                    .zip(cells)
                    .map(|(h, c)| (h.clone(), Value::String(c)))
                    .collect();
                Value::Object(row)
            })
            .filter(|row| row.as_object().is_some_and(|r| !r.is_empty()))
            .collect();

        if !rows.is_empty() {
            tables.push(json!({ "table": rows }));
        }
    }
    tables
}

fn inside_thead(row: &ElementRef) -> bool {
    row.ancestors()
        .filter_map(|node| node.value().as_element())
        .any(|el| el.name() == "thead")
}

fn cell_text(cell: &ElementRef) -> String {
    cell.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
