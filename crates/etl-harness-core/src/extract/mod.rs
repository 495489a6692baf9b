//! Fragment extraction from loosely-structured text.
//!
//! Four independent scanners run over the same text:
//!
//! | Scanner | Strategy |
//! |---------|----------|
//! | [`json`] | bracket-balance line automaton, trailing-comma repair |
//! | [`html`] | runs of tag lines, `<table>` extraction |
//! | [`csv`]  | delimiter-consistent line blocks, header + rows |
//! | [`xml`]  | root tag to matching close tag, children as records |
//!
//! Their outputs are concatenated, ordered by `start_line`, and
//! deduplicated on `(type, start_line, end_line)`. Extraction never fails:
//! spans that do not parse are dropped.

mod csv;
mod html;
mod json;
mod xml;

use std::collections::HashSet;

use tracing::debug;

use crate::models::Fragment;

/// Extract every structured-data fragment from `text`, ordered by start line.
///
/// Deterministic and pure: the same text always yields the same fragments.
pub fn extract(text: &str) -> Vec<Fragment> {
    let mut json = json::JsonScanner::new();
    let mut html = html::HtmlScanner::new();
    let mut csv = csv::CsvScanner::new();

    for (idx, raw_line) in text.split('\n').enumerate() {
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        let line_no = idx + 1;
        json.feed(line_no, line);
        html.feed(line_no, line);
        csv.feed(line_no, line);
    }

    let mut fragments = json.finish();
    fragments.extend(html.finish());
    fragments.extend(csv.finish());
    fragments.extend(xml::scan(text));

    let fragments = dedup_fragments(fragments);
    debug!(count = fragments.len(), "extracted fragments");
    fragments
}

/// Stable-sort by `start_line` and keep the first fragment for each
/// `(type, start_line, end_line)`.
pub fn dedup_fragments(mut fragments: Vec<Fragment>) -> Vec<Fragment> {
    fragments.sort_by_key(|f| f.start_line);
    let mut seen = HashSet::new();
    fragments.retain(|f| seen.insert((f.fragment_type, f.start_line, f.end_line)));
    fragments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FragmentType, ParsedData};
    use serde_json::json;

    #[test]
    fn json_scenario() {
        let frags = extract("noise\n{\"a\": 1, \"b\": 2,}\nmore noise");
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].fragment_type, FragmentType::Json);
        let ParsedData::Record(map) = &frags[0].parsed_data else {
            panic!("expected a single record");
        };
        assert_eq!(serde_json::Value::Object(map.clone()), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn csv_scenario() {
        let frags = extract("name,age\nAlice,30\nBob,25\n");
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].fragment_type, FragmentType::Csv);
        assert_eq!(
            frags[0].parsed_data,
            ParsedData::Records(vec![
                json!({"name": "Alice", "age": "30"}),
                json!({"name": "Bob", "age": "25"}),
            ])
        );
    }

    #[test]
    fn mixed_document_is_ordered_by_line() {
        let text = "Report\n\
            id,qty\n\
            1,5\n\
            2,7\n\
            \n\
            {\"sku\": \"A1\", \"price\": 120}\n\
            \n\
            <inventory><item><sku>B2</sku></item></inventory>\n";
        let frags = extract(text);
        let kinds: Vec<_> = frags.iter().map(|f| f.fragment_type).collect();
        assert_eq!(kinds[0], FragmentType::Csv);
        assert_eq!(kinds[1], FragmentType::Json);
        assert!(kinds.contains(&FragmentType::Xml));
        let lines: Vec<_> = frags.iter().map(|f| f.start_line).collect();
        let mut sorted = lines.clone();
        sorted.sort();
        assert_eq!(lines, sorted);
    }

    #[test]
    fn plain_prose_yields_nothing() {
        assert!(extract("Just a sentence.\nAnother one without structure.").is_empty());
    }

    #[test]
    fn malformed_input_never_panics() {
        let text = "{{{\n]]]\n<a <b>\n,,,\n<?xml\n</x>";
        let _ = extract(text);
    }

    #[test]
    fn large_tag_heavy_text_extracts_promptly() {
        let text: String = (0..10_000)
            .map(|i| format!("line {} <br> more text here padding padding\n", i))
            .collect();
        let started = std::time::Instant::now();
        let frags = extract(&text);
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert!(frags.iter().all(|f| f.fragment_type != FragmentType::Xml));
    }

    #[test]
    fn crlf_line_endings() {
        let frags = extract("a,b\r\n1,2\r\n3,4\r\n");
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].parsed_data.records()[1]["b"], json!("4"));
    }

    #[test]
    fn duplicates_keep_first_occurrence() {
        let a = Fragment::new(FragmentType::Json, 3, 4, "first", ParsedData::Records(vec![]));
        let b = Fragment::new(FragmentType::Json, 3, 4, "second", ParsedData::Records(vec![]));
        let c = Fragment::new(FragmentType::Csv, 1, 2, "csv", ParsedData::Records(vec![]));
        let out = dedup_fragments(vec![a, b, c]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].raw_content, "csv");
        assert_eq!(out[1].raw_content, "first");
    }
}
