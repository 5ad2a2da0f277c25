//! Third stage: pull structured values out of the document text through
//! the generation service.

use std::sync::Arc;

use async_trait::async_trait;
use docflow_core::{
    DataPoint, ExtractedData, FieldKind, StageError, StageName, StagePayload,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::GenerationConfig;
use crate::core::{Stage, StageInput, StageOutcome};
use crate::prompts::StagePrompts;
use crate::response_parser::extract_json;
use crate::services::{GenerationClient, GenerationRequest};

/// Confidence assumed for a data point the model reported without one.
const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Lenient shape of the model's answer. Converted into [`ExtractedData`]
/// after checking.
#[derive(Debug, Deserialize)]
struct RawExtraction {
    #[serde(default, alias = "extracted_data", alias = "data")]
    data_points: Vec<RawDataPoint>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    notes: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawDataPoint {
    #[serde(alias = "field", alias = "name")]
    field_name: String,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    data_type: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    period: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default, alias = "source")]
    source_location: Option<String>,
}

pub struct DataExtractor {
    client: Arc<dyn GenerationClient>,
    generation: GenerationConfig,
    max_prompt_chars: usize,
}

impl DataExtractor {
    pub fn new(
        client: Arc<dyn GenerationClient>,
        generation: GenerationConfig,
        max_prompt_chars: usize,
    ) -> Self {
        Self {
            client,
            generation,
            max_prompt_chars,
        }
    }

    /// Parse a model response into extracted data.
    pub fn parse_response(text: &str) -> Result<ExtractedData, StageError> {
        let value = extract_json(text)
            .ok_or_else(|| StageError::validation("extraction response contained no JSON"))?;
        let raw: RawExtraction = match value {
            Value::Array(points) => RawExtraction {
                data_points: serde_json::from_value(Value::Array(points)).map_err(|e| {
                    StageError::validation(format!("malformed data points: {}", e))
                })?,
                summary: None,
                confidence: None,
                notes: None,
            },
            other => serde_json::from_value(other)
                .map_err(|e| StageError::validation(format!("malformed extraction: {}", e)))?,
        };

        let mut data_points = Vec::with_capacity(raw.data_points.len());
        let mut skipped = 0usize;
        for point in raw.data_points {
            let value = match point.value {
                Value::Null => {
                    skipped += 1;
                    continue;
                }
                Value::String(s) if s.trim().is_empty() => {
                    skipped += 1;
                    continue;
                }
                Value::String(s) => s,
                other => other.to_string(),
            };
            let confidence = point.confidence.unwrap_or(DEFAULT_CONFIDENCE);
            if !(0.0..=1.0).contains(&confidence) {
                return Err(StageError::validation(format!(
                    "confidence {} for '{}' outside 0..=1",
                    confidence, point.field_name
                )));
            }
            data_points.push(DataPoint {
                field_name: point.field_name.trim().to_string(),
                value,
                data_type: point.data_type.as_deref().and_then(parse_kind),
                category: point.category,
                unit: point.unit,
                period: point.period,
                confidence,
                source_location: point.source_location,
            });
        }
        if skipped > 0 {
            debug!(skipped, "Data points without a value dropped");
        }

        let confidence = match raw.confidence {
            Some(c) => c,
            None if data_points.is_empty() => 0.0,
            None => {
                data_points.iter().map(|p| p.confidence).sum::<f64>() / data_points.len() as f64
            }
        };
        if !(0.0..=1.0).contains(&confidence) {
            return Err(StageError::validation(format!(
                "overall confidence {} outside 0..=1",
                confidence
            )));
        }

        let notes = match raw.notes {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => Some(other.to_string()),
        };

        Ok(ExtractedData {
            data_points,
            summary: raw.summary,
            confidence,
            notes,
        })
    }
}

fn parse_kind(raw: &str) -> Option<FieldKind> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "text" | "string" => Some(FieldKind::Text),
        "number" | "numeric" | "integer" | "float" => Some(FieldKind::Number),
        "currency" | "money" | "amount" => Some(FieldKind::Currency),
        "percentage" | "percent" | "ratio" => Some(FieldKind::Percentage),
        "date" => Some(FieldKind::Date),
        _ => None,
    }
}

/// Cut `text` to at most `max` characters.
fn truncate_chars(text: &str, max: usize) -> (&str, bool) {
    match text.char_indices().nth(max) {
        Some((byte, _)) => (&text[..byte], true),
        None => (text, false),
    }
}

#[async_trait]
impl Stage for DataExtractor {
    fn name(&self) -> StageName {
        StageName::DataExtractor
    }

    async fn execute(&self, input: &StageInput) -> StageOutcome {
        let instructions = input.instructions()?;
        let (text, truncated) = truncate_chars(&input.document.text, self.max_prompt_chars);
        if truncated {
            warn!(
                run_id = %input.run_id,
                limit = self.max_prompt_chars,
                "Document text truncated for extraction"
            );
        }

        let request = GenerationRequest::new(
            self.name(),
            self.generation.model_for(self.name()),
            StagePrompts::extraction_system(),
            StagePrompts::extraction_request(instructions, &input.document, text, truncated),
        )
        .with_settings(&self.generation);

        let response = self.client.complete(request).await?;
        let extracted = Self::parse_response(&response)?;
        debug!(
            run_id = %input.run_id,
            points = extracted.data_points.len(),
            confidence = extracted.confidence,
            "Extraction parsed"
        );
        Ok(StagePayload::Extracted(extracted))
    }
}
