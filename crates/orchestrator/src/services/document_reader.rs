//! Turning uploaded bytes into a [`Document`].
//!
//! Text and OCR extraction for binary formats is an external concern; the
//! built-in [`PlainTextReader`] only handles textual formats and reports
//! the rest as unsupported so a real reader can be plugged in.

use docflow_core::{Document, DocumentFormat, FailureKind, LayoutHints};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReaderError {
    #[error("Unsupported document format: {0}")]
    Unsupported(String),

    #[error("Corrupt document: {0}")]
    Corrupt(String),

    #[error("Document is {size} bytes, limit is {limit}")]
    SizeLimit { size: u64, limit: u64 },
}

impl ReaderError {
    pub fn kind(&self) -> FailureKind {
        FailureKind::Validation
    }
}

/// Raw upload as received from a caller.
#[derive(Debug, Clone)]
pub struct DocumentUpload {
    pub name: String,
    /// Format tag as sent by the caller, e.g. `pdf` or `.CSV`.
    pub format: String,
    pub bytes: Vec<u8>,
}

impl DocumentUpload {
    pub fn new(name: impl Into<String>, format: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            format: format.into(),
            bytes: bytes.into(),
        }
    }

    /// Take the format tag from the file extension.
    pub fn from_file_name(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let name = name.into();
        let format = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_string())
            .unwrap_or_default();
        Self::new(name, format, bytes)
    }
}

/// Extracted text plus whatever layout information the reader found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOutput {
    pub text: String,
    pub layout: Option<LayoutHints>,
}

pub trait DocumentReader: Send + Sync {
    fn read(&self, format: DocumentFormat, bytes: &[u8]) -> Result<ReadOutput, ReaderError>;
}

/// Reader for formats whose bytes are already text.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextReader;

impl DocumentReader for PlainTextReader {
    fn read(&self, format: DocumentFormat, bytes: &[u8]) -> Result<ReadOutput, ReaderError> {
        if !format.is_textual() {
            return Err(ReaderError::Unsupported(format!(
                "{} needs an external text extractor",
                format
            )));
        }
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ReaderError::Corrupt(format!("not valid UTF-8: {}", e)))?;
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);

        let layout = match format {
            DocumentFormat::Csv => Some(LayoutHints {
                page_count: None,
                table_count: Some(1),
            }),
            DocumentFormat::Md | DocumentFormat::Html => {
                let tables = count_tables(format, text);
                (tables > 0).then_some(LayoutHints {
                    page_count: None,
                    table_count: Some(tables),
                })
            }
            _ => None,
        };

        Ok(ReadOutput {
            text: text.to_string(),
            layout,
        })
    }
}

fn count_tables(format: DocumentFormat, text: &str) -> u32 {
    match format {
        DocumentFormat::Html => text.to_ascii_lowercase().matches("<table").count() as u32,
        // A markdown table starts at a header separator row like |---|---|.
        _ => text
            .lines()
            .map(str::trim)
            .filter(|line| {
                line.starts_with('|')
                    && line.contains("---")
                    && line.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
            })
            .count() as u32,
    }
}

/// Validate an upload and read it into a [`Document`].
///
/// The format tag and the size are checked before any reading happens.
pub fn ingest(
    reader: &dyn DocumentReader,
    upload: &DocumentUpload,
    max_bytes: u64,
) -> Result<Document, ReaderError> {
    let format = DocumentFormat::parse(&upload.format)
        .map_err(|_| ReaderError::Unsupported(upload.format.clone()))?;
    let size = upload.bytes.len() as u64;
    if size > max_bytes {
        return Err(ReaderError::SizeLimit {
            size,
            limit: max_bytes,
        });
    }
    let output = reader.read(format, &upload.bytes)?;
    let document = Document::new(upload.name.clone(), format, size, output.text);
    Ok(match output.layout {
        Some(layout) => document.with_layout(layout),
        None => document,
    })
}
