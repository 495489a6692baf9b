//! Turning uploaded bytes into document text.
//!
//! Plain-text formats (`.txt`, `.md`) are read as UTF-8, falling back to
//! Latin-1 so a stray byte never rejects an upload. PDFs go through
//! `pdf-extract`. Everything downstream only sees the resulting `String`.

use std::path::Path;

/// Decoding error. Callers report it and skip the upload.
#[derive(Debug)]
pub enum DecodeError {
    UnsupportedExtension(String),
    Pdf(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::UnsupportedExtension(ext) => {
                write!(f, "unsupported file type: '{}'", ext)
            }
            DecodeError::Pdf(e) => write!(f, "PDF text extraction failed: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decode `bytes` according to the extension of `filename`.
pub fn decode_text(filename: &str, bytes: &[u8]) -> Result<String, DecodeError> {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "md" => Ok(decode_plain(bytes)),
        "pdf" => decode_pdf(bytes),
        _ => Err(DecodeError::UnsupportedExtension(ext)),
    }
}

/// UTF-8 (BOM stripped), else Latin-1.
pub fn decode_plain(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

fn decode_pdf(bytes: &[u8]) -> Result<String, DecodeError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| DecodeError::Pdf(e.to_string()))
}
