use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::CoreError;

const PREVIEW_CHARS: usize = 500;

/// Source format tag of an uploaded document. The set is closed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Pdf,
    Txt,
    Png,
    Jpg,
    Jpeg,
    Docx,
    Xlsx,
    Csv,
    Md,
    Json,
    Xml,
    Html,
    Py,
    Js,
    Ts,
    Doc,
    Xls,
    Ppt,
    Pptx,
}

impl DocumentFormat {
    pub const ALL: [DocumentFormat; 19] = [
        Self::Pdf,
        Self::Txt,
        Self::Png,
        Self::Jpg,
        Self::Jpeg,
        Self::Docx,
        Self::Xlsx,
        Self::Csv,
        Self::Md,
        Self::Json,
        Self::Xml,
        Self::Html,
        Self::Py,
        Self::Js,
        Self::Ts,
        Self::Doc,
        Self::Xls,
        Self::Ppt,
        Self::Pptx,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Txt => "txt",
            Self::Png => "png",
            Self::Jpg => "jpg",
            Self::Jpeg => "jpeg",
            Self::Docx => "docx",
            Self::Xlsx => "xlsx",
            Self::Csv => "csv",
            Self::Md => "md",
            Self::Json => "json",
            Self::Xml => "xml",
            Self::Html => "html",
            Self::Py => "py",
            Self::Js => "js",
            Self::Ts => "ts",
            Self::Doc => "doc",
            Self::Xls => "xls",
            Self::Ppt => "ppt",
            Self::Pptx => "pptx",
        }
    }

    /// Parse a format tag. Case-insensitive; a leading dot is ignored.
    pub fn parse(tag: &str) -> Result<Self, CoreError> {
        let normalized = tag.trim().trim_start_matches('.').to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|format| format.as_str() == normalized)
            .ok_or_else(|| CoreError::UnsupportedFormat(tag.to_string()))
    }

    /// Guess the format from a file name's extension.
    pub fn from_file_name(name: &str) -> Result<Self, CoreError> {
        let extension = name
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .ok_or_else(|| CoreError::UnsupportedFormat(name.to_string()))?;
        Self::parse(extension)
    }

    /// Formats whose bytes are already plain text.
    pub fn is_textual(&self) -> bool {
        matches!(
            self,
            Self::Txt
                | Self::Csv
                | Self::Md
                | Self::Json
                | Self::Xml
                | Self::Html
                | Self::Py
                | Self::Js
                | Self::Ts
        )
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Self::Png | Self::Jpg | Self::Jpeg)
    }

    pub fn is_spreadsheet(&self) -> bool {
        matches!(self, Self::Xlsx | Self::Xls | Self::Csv)
    }
}

impl std::fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional layout metadata produced by the document reader.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct LayoutHints {
    pub page_count: Option<u32>,
    pub table_count: Option<u32>,
}

/// An ingested document. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Document {
    pub id: Uuid,
    pub name: String,
    pub format: DocumentFormat,
    pub size_bytes: u64,
    pub text: String,
    pub layout: Option<LayoutHints>,
    pub ingested_at: DateTime<Utc>,
}

impl Document {
    pub fn new(
        name: impl Into<String>,
        format: DocumentFormat,
        size_bytes: u64,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            format,
            size_bytes,
            text: text.into(),
            layout: None,
            ingested_at: Utc::now(),
        }
    }

    pub fn with_layout(mut self, layout: LayoutHints) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }

    pub fn preview(&self) -> String {
        let mut chars = self.text.chars();
        let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
        if chars.next().is_some() {
            format!("{}...", head)
        } else {
            head
        }
    }
}
