//! Typed payloads passed between stages.
//!
//! Every stage produces exactly one payload kind. The orchestrator checks
//! both the kind and [`StagePayload::validate`] before a payload is handed
//! to the next stage.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::analysis::AnalysisType;
use super::artifact::{is_plain_file_name, GeneratedArtifact};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    Tabular,
    Narrative,
    Structured,
    SourceCode,
    Scanned,
}

impl ExtractionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tabular => "tabular",
            Self::Narrative => "narrative",
            Self::Structured => "structured",
            Self::SourceCode => "source_code",
            Self::Scanned => "scanned",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    #[default]
    Moderate,
    Complex,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Moderate => "moderate",
            Self::Complex => "complex",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct TaskDescription {
    pub objective: String,
    /// Best guess at the document's domain (financial, legal, technical...).
    pub domain: String,
    pub complexity: Complexity,
    pub analysis_type: Option<AnalysisType>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct RoutingDecision {
    pub strategy: ExtractionStrategy,
    pub task: TaskDescription,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    Text,
    Number,
    Currency,
    Percentage,
    Date,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Number => "number",
            Self::Currency => "currency",
            Self::Percentage => "percentage",
            Self::Date => "date",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ExtractionField {
    pub name: String,
    pub kind: FieldKind,
    pub description: String,
    pub required: bool,
    pub category: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
pub struct InstructionSet {
    pub extraction_prompt: String,
    pub fields: Vec<ExtractionField>,
    pub formatting_rules: Vec<String>,
    pub validation_criteria: Vec<String>,
}

/// A single value pulled out of the document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct DataPoint {
    pub field_name: String,
    pub value: String,
    #[serde(default)]
    pub data_type: Option<FieldKind>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub period: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub source_location: Option<String>,
}

impl DataPoint {
    pub fn new(field_name: impl Into<String>, value: impl Into<String>, confidence: f64) -> Self {
        Self {
            field_name: field_name.into(),
            value: value.into(),
            data_type: None,
            category: None,
            unit: None,
            period: None,
            confidence,
            source_location: None,
        }
    }

    pub fn with_period(mut self, period: impl Into<String>) -> Self {
        self.period = Some(period.into());
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, ToSchema)]
pub struct ExtractedData {
    pub data_points: Vec<DataPoint>,
    #[serde(default)]
    pub summary: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ArrangedValue {
    Found { values: Vec<DataPoint> },
    NotFound,
}

impl ArrangedValue {
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ArrangedField {
    pub name: String,
    pub kind: FieldKind,
    #[serde(flatten)]
    pub value: ArrangedValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ArrangedCategory {
    pub name: String,
    pub fields: Vec<ArrangedField>,
}

/// Extracted data mapped onto the configured taxonomy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ArrangedData {
    pub categories: Vec<ArrangedCategory>,
    /// Data points that matched no declared field.
    pub unmapped: Vec<DataPoint>,
    /// Share of declared fields that were found, 0.0 to 1.0.
    pub completeness: f64,
    pub summary: String,
}

impl ArrangedData {
    pub fn category(&self, name: &str) -> Option<&ArrangedCategory> {
        self.categories.iter().find(|c| c.name == name)
    }

    pub fn field(&self, category: &str, field: &str) -> Option<&ArrangedValue> {
        self.category(category)?
            .fields
            .iter()
            .find(|f| f.name == field)
            .map(|f| &f.value)
    }

    pub fn found_count(&self) -> usize {
        self.categories
            .iter()
            .flat_map(|c| c.fields.iter())
            .filter(|f| f.value.is_found())
            .count()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Routing,
    Instructions,
    Extracted,
    Arranged,
    Artifact,
}

impl PayloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Routing => "routing",
            Self::Instructions => "instructions",
            Self::Extracted => "extracted",
            Self::Arranged => "arranged",
            Self::Artifact => "artifact",
        }
    }
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum StagePayload {
    Routing(RoutingDecision),
    Instructions(InstructionSet),
    Extracted(ExtractedData),
    Arranged(ArrangedData),
    Artifact(GeneratedArtifact),
}

impl StagePayload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Routing(_) => PayloadKind::Routing,
            Self::Instructions(_) => PayloadKind::Instructions,
            Self::Extracted(_) => PayloadKind::Extracted,
            Self::Arranged(_) => PayloadKind::Arranged,
            Self::Artifact(_) => PayloadKind::Artifact,
        }
    }

    pub fn as_routing(&self) -> Option<&RoutingDecision> {
        match self {
            Self::Routing(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_instructions(&self) -> Option<&InstructionSet> {
        match self {
            Self::Instructions(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_extracted(&self) -> Option<&ExtractedData> {
        match self {
            Self::Extracted(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_arranged(&self) -> Option<&ArrangedData> {
        match self {
            Self::Arranged(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_artifact(&self) -> Option<&GeneratedArtifact> {
        match self {
            Self::Artifact(a) => Some(a),
            _ => None,
        }
    }

    /// Structural checks on the payload contents. Returns a description of
    /// the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Routing(routing) => {
                if routing.task.objective.trim().is_empty() {
                    return Err("routing decision has an empty objective".into());
                }
                Ok(())
            }
            Self::Instructions(instructions) => {
                if instructions.extraction_prompt.trim().is_empty() {
                    return Err("instruction set has an empty extraction prompt".into());
                }
                if instructions.fields.is_empty() {
                    return Err("instruction set declares no fields".into());
                }
                let mut seen = HashSet::new();
                for field in &instructions.fields {
                    if field.name.trim().is_empty() {
                        return Err("instruction set contains a field with no name".into());
                    }
                    if !seen.insert(field.name.as_str()) {
                        return Err(format!("field '{}' declared twice", field.name));
                    }
                }
                Ok(())
            }
            Self::Extracted(extracted) => {
                check_confidence("overall", extracted.confidence)?;
                for point in &extracted.data_points {
                    if point.field_name.trim().is_empty() {
                        return Err("data point has an empty field name".into());
                    }
                    check_confidence(&point.field_name, point.confidence)?;
                }
                Ok(())
            }
            Self::Arranged(arranged) => {
                if !(0.0..=1.0).contains(&arranged.completeness) {
                    return Err(format!(
                        "completeness {} outside 0..=1",
                        arranged.completeness
                    ));
                }
                let mut seen = HashSet::new();
                for category in &arranged.categories {
                    if !seen.insert(category.name.as_str()) {
                        return Err(format!("category '{}' appears twice", category.name));
                    }
                }
                Ok(())
            }
            Self::Artifact(artifact) => {
                if artifact.code.trim().is_empty() {
                    return Err("generated artifact has no code".into());
                }
                let names = artifact
                    .expected_outputs
                    .iter()
                    .chain(artifact.inputs.iter().map(|f| &f.name));
                for name in names {
                    if !is_plain_file_name(name) {
                        return Err(format!("'{}' is not a plain file name", name));
                    }
                }
                Ok(())
            }
        }
    }
}

fn check_confidence(label: &str, confidence: f64) -> Result<(), String> {
    if confidence.is_finite() && (0.0..=1.0).contains(&confidence) {
        Ok(())
    } else {
        Err(format!("confidence for '{}' is {} (expected 0..=1)", label, confidence))
    }
}
