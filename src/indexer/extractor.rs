use std::path::Path;

use crate::error::{RagError, RagResult};

/// Turns a local copy of a document into plain text.
///
/// Binary formats (PDF, Office, ...) are converted by an external service
/// before upload; implementations here only have to deal with text.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, path: &Path, document_key: &str) -> RagResult<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportedFormat {
    PlainText,
}

impl SupportedFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "txt" | "md" | "markdown" | "csv" | "tsv" | "log" | "rs" | "py" | "js" | "ts"
            | "json" | "yaml" | "yml" | "toml" | "html" | "xml" => Some(Self::PlainText),
            _ => None,
        }
    }

    /// Keys without an extension are treated as plain text.
    pub fn from_key(key: &str) -> Option<Self> {
        let name = key.rsplit('/').next().unwrap_or(key);
        match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => Self::from_extension(ext),
            _ => Some(Self::PlainText),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extract(&self, path: &Path, document_key: &str) -> RagResult<String> {
        match SupportedFormat::from_key(document_key) {
            Some(SupportedFormat::PlainText) => extract_plain_text(path, document_key),
            None => Err(RagError::InvalidInput(format!(
                "unsupported document format for {}: only plain text is extracted here",
                document_key
            ))),
        }
    }
}

fn extract_plain_text(path: &Path, document_key: &str) -> RagResult<String> {
    let bytes = std::fs::read(path)
        .map_err(|e| RagError::Storage(format!("failed to read {}: {}", path.display(), e)))?;
    let text = String::from_utf8(bytes).map_err(|e| {
        RagError::InvalidInput(format!("{} is not valid UTF-8 text: {}", document_key, e))
    })?;
    // BOM付きファイル対策
    Ok(text.strip_prefix('\u{feff}').map(str::to_string).unwrap_or(text))
}
