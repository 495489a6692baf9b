//! XML fragment detection and record flattening.
//!
//! Unlike the line scanners this is pattern-based: every tag in the text is
//! tokenized once and each opening tag is paired with the close tag of the
//! same name that ends it. A paired root (optionally preceded by an
//! `<?xml ...?>` prologue) is parsed with a lenient `quick-xml` reader and
//! each direct child of the root becomes one flat record.

use std::collections::HashMap;
use std::sync::OnceLock;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::models::{Fragment, FragmentType, ParsedData, Record};

fn tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<(/?)([A-Za-z_][\w.:\-]*)(?:\s[^<>]*)?>").expect("tag pattern is valid")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    Open,
    Close,
    SelfClosing,
}

#[derive(Debug)]
struct Tag<'a> {
    name: &'a str,
    kind: TagKind,
    start: usize,
    end: usize,
}

fn tokenize(text: &str) -> Vec<Tag<'_>> {
    tag()
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let kind = if !caps[1].is_empty() {
                TagKind::Close
            } else if whole.as_str().ends_with("/>") {
                TagKind::SelfClosing
            } else {
                TagKind::Open
            };
            Some(Tag {
                name: caps.get(2)?.as_str(),
                kind,
                start: whole.start(),
                end: whole.end(),
            })
        })
        .collect()
}

/// For every open tag, the index of the close tag of the same name that
/// ends it, counting nested same-name elements. Other names are ignored.
fn pair_tags(tags: &[Tag]) -> Vec<Option<usize>> {
    let mut pairs = vec![None; tags.len()];
    let mut open: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, tag) in tags.iter().enumerate() {
        match tag.kind {
            TagKind::Open => open.entry(tag.name).or_default().push(i),
            TagKind::Close => {
                if let Some(j) = open.get_mut(tag.name).and_then(Vec::pop) {
                    pairs[j] = Some(i);
                }
            }
            TagKind::SelfClosing => {}
        }
    }
    pairs
}

/// Minimal element tree built by the lenient reader.
#[derive(Debug, Default)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    text: String,
    children: Vec<Element>,
}

pub(crate) fn scan(text: &str) -> Vec<Fragment> {
    let tags = tokenize(text);
    let pairs = pair_tags(&tags);
    let newlines: Vec<usize> = text.match_indices('\n').map(|(i, _)| i).collect();
    let line_of = |offset: usize| newlines.partition_point(|&nl| nl < offset) + 1;

    let mut fragments = Vec::new();
    let mut pos = 0;
    for (open, close) in tags.iter().zip(&pairs) {
        if open.kind != TagKind::Open || open.start < pos {
            continue;
        }
        let Some(close) = close.map(|i| &tags[i]) else {
            continue;
        };

        let span_start = prologue_start(&text[pos..open.start])
            .map(|offset| pos + offset)
            .unwrap_or(open.start);
        let span = &text[span_start..close.end];
        let start_line = line_of(span_start);
        let end_line = line_of(close.end);

        match parse_tree(span) {
            Some(root) => {
                let records = root_records(&root);
                if records.is_empty() {
                    debug!(start_line, root = %root.name, "XML root without child records");
                } else {
                    fragments.push(Fragment::new(
                        FragmentType::Xml,
                        start_line,
                        end_line,
                        span,
                        ParsedData::Records(records.into_iter().map(Value::Object).collect()),
                    ));
                }
            }
            None => debug!(start_line, "XML span failed to parse"),
        }
        pos = close.end;
    }
    fragments
}

/// Start of an `<?xml ...?>` declaration directly preceding the root tag.
fn prologue_start(before: &str) -> Option<usize> {
    let trimmed = before.trim_end();
    if !trimmed.ends_with("?>") {
        return None;
    }
    trimmed.rfind("<?xml")
}

/// Parse leniently: mismatched end names are accepted and a syntax error
/// keeps whatever was built up to that point.
fn parse_tree(span: &str) -> Option<Element> {
    let mut reader = Reader::from_str(span);
    reader.config_mut().trim_text(true);
    reader.config_mut().check_end_names = false;

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => stack.push(element_from(&e)),
            Ok(Event::Empty(e)) => {
                let el = element_from(&e);
                attach(&mut stack, &mut root, el);
            }
            Ok(Event::Text(t)) => {
                if let Some(top) = stack.last_mut() {
                    let text = t
                        .unescape()
                        .map(|s| s.into_owned())
                        .unwrap_or_else(|_| String::from_utf8_lossy(&t).into_owned());
                    top.text.push_str(&text);
                }
            }
            Ok(Event::CData(c)) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Ok(Event::End(_)) => {
                if let Some(el) = stack.pop() {
                    attach(&mut stack, &mut root, el);
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "recovering from malformed XML");
                break;
            }
        }
        if root.is_some() {
            break;
        }
    }

    // Unclosed elements fold into their parents.
    while let Some(el) = stack.pop() {
        attach(&mut stack, &mut root, el);
    }
    root
}

fn element_from(start: &BytesStart) -> Element {
    let attrs = start
        .attributes()
        .flatten()
        .map(|a| {
            let key = String::from_utf8_lossy(a.key.as_ref()).into_owned();
            let value = a
                .unescape_value()
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| String::from_utf8_lossy(&a.value).into_owned());
            (key, value)
        })
        .collect();
    Element {
        name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
        attrs,
        ..Element::default()
    }
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, el: Element) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(el),
        None => {
            if root.is_none() {
                *root = Some(el);
            }
        }
    }
}

/// One flat record per direct child of the root, each carrying the root's
/// attributes under `root_attr_<name>`.
fn root_records(root: &Element) -> Vec<Record> {
    root.children
        .iter()
        .map(|child| {
            let mut record = match element_value(child) {
                Value::Object(map) => map,
                other => {
                    let mut map = Record::new();
                    map.insert(child.name.clone(), other);
                    map
                }
            };
            for (name, value) in &root.attrs {
                record.insert(format!("root_attr_{}", name), Value::String(value.clone()));
            }
            let mut flat = Record::new();
            flatten_into(&mut flat, "", record);
            flat
        })
        .collect()
}

/// Attributes and children become a mapping; repeated child tags collect
/// into a sequence. A bare leaf is its text, or null when empty.
fn element_value(el: &Element) -> Value {
    let text = el.text.trim();
    if el.attrs.is_empty() && el.children.is_empty() {
        return if text.is_empty() {
            Value::Null
        } else {
            Value::String(text.to_string())
        };
    }

    let mut map = Record::new();
    for (k, v) in &el.attrs {
        map.insert(k.clone(), Value::String(v.clone()));
    }
    if !text.is_empty() {
        map.insert("text_content".to_string(), Value::String(text.to_string()));
    }
    for child in &el.children {
        let value = element_value(child);
        match map.get_mut(&child.name) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                map.insert(child.name.clone(), value);
            }
        }
    }
    Value::Object(map)
}

/// Nested mappings flatten into `parent_child` keys, except mappings that
/// hold a sequence, which stay nested as sub-documents.
fn flatten_into(out: &mut Record, prefix: &str, map: Record) {
    for (key, value) in map {
        let full_key = if prefix.is_empty() {
            key
        } else {
            format!("{}_{}", prefix, key)
        };
        match value {
            Value::Object(inner) if !inner.values().any(Value::is_array) => {
                flatten_into(out, &full_key, inner);
            }
            other => {
                out.insert(full_key, other);
            }
        }
    }
}
