//! Core data models shared by the extraction, cleaning, schema, and query
//! stages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A flat mapping from field name to value. Keys are canonical once the
/// record has been through [`crate::clean::clean_records`].
pub type Record = serde_json::Map<String, Value>;

/// The structured-data format a fragment was recognized as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentType {
    Json,
    Html,
    Csv,
    Xml,
}

impl FragmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FragmentType::Json => "json",
            FragmentType::Html => "html",
            FragmentType::Csv => "csv",
            FragmentType::Xml => "xml",
        }
    }

    /// Name of the store collection that records of this type are loaded into.
    pub fn collection_name(&self) -> String {
        format!("{}_data", self.as_str())
    }
}

impl std::fmt::Display for FragmentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed payload of a fragment.
///
/// JSON objects parse to [`ParsedData::Record`]; JSON arrays, HTML table
/// extractions, CSV rows and XML children parse to [`ParsedData::Records`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParsedData {
    Records(Vec<Value>),
    Record(Record),
}

impl ParsedData {
    /// The mapping-shaped records carried by this payload. Non-mapping
    /// array elements (e.g. a JSON array of numbers) are not records.
    pub fn records(&self) -> Vec<Record> {
        match self {
            ParsedData::Record(r) => vec![r.clone()],
            ParsedData::Records(items) => items
                .iter()
                .filter_map(|v| v.as_object().cloned())
                .collect(),
        }
    }

    /// Whether the payload leads with a mapping. Only such payloads are
    /// canonicalized.
    pub fn starts_with_mapping(&self) -> bool {
        match self {
            ParsedData::Record(_) => true,
            ParsedData::Records(items) => items.first().is_some_and(Value::is_object),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ParsedData::Record(r) => r.is_empty(),
            ParsedData::Records(items) => items.is_empty(),
        }
    }
}

/// A contiguous span of source text recognized as one structured-data island.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    #[serde(rename = "type")]
    pub fragment_type: FragmentType,
    /// 1-based line of the first line of the span.
    pub start_line: usize,
    /// 1-based line of the last line of the span (inclusive).
    pub end_line: usize,
    pub raw_content: String,
    pub parsed_data: ParsedData,
    /// Attached once by the canonicalizer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleaned_records: Option<Vec<Record>>,
    /// JSON only: strict parsing failed and the span parsed after trailing-comma repair.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub repaired: bool,
    /// CSV only: the detected delimiter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<char>,
}

impl Fragment {
    pub fn new(
        fragment_type: FragmentType,
        start_line: usize,
        end_line: usize,
        raw_content: impl Into<String>,
        parsed_data: ParsedData,
    ) -> Self {
        Self {
            fragment_type,
            start_line,
            end_line,
            raw_content: raw_content.into(),
            parsed_data,
            cleaned_records: None,
            repaired: false,
            delimiter: None,
        }
    }

    /// Records used for schema inference and loading: the cleaned records
    /// when the canonicalizer ran, otherwise the raw parsed records.
    pub fn effective_records(&self) -> Vec<Record> {
        match &self.cleaned_records {
            Some(cleaned) => cleaned.clone(),
            None => self.parsed_data.records(),
        }
    }
}
