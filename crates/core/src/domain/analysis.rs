use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::CoreError;

/// Predefined analyses the pipeline knows how to route without a prompt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisType {
    FinancialSummary,
    KeyMetrics,
    TrendAnalysis,
    RiskReview,
    TabularExport,
}

impl AnalysisType {
    pub const ALL: [AnalysisType; 5] = [
        Self::FinancialSummary,
        Self::KeyMetrics,
        Self::TrendAnalysis,
        Self::RiskReview,
        Self::TabularExport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FinancialSummary => "financial-summary",
            Self::KeyMetrics => "key-metrics",
            Self::TrendAnalysis => "trend-analysis",
            Self::RiskReview => "risk-review",
            Self::TabularExport => "tabular-export",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "financial-summary" => Some(Self::FinancialSummary),
            "key-metrics" => Some(Self::KeyMetrics),
            "trend-analysis" => Some(Self::TrendAnalysis),
            "risk-review" => Some(Self::RiskReview),
            "tabular-export" => Some(Self::TabularExport),
            _ => None,
        }
    }

    /// One-sentence objective handed to the downstream stages.
    pub fn objective(&self) -> &'static str {
        match self {
            Self::FinancialSummary => {
                "Extract every reported financial figure and produce a consolidated financial report workbook"
            }
            Self::KeyMetrics => {
                "Extract headline performance metrics and ratios and tabulate them per period"
            }
            Self::TrendAnalysis => {
                "Extract period-over-period figures and chart how each metric changes over time"
            }
            Self::RiskReview => {
                "Extract disclosed risks, liabilities and exposure figures and summarise them by severity"
            }
            Self::TabularExport => {
                "Extract all tabular data as-is and export it to a structured workbook"
            }
        }
    }
}

impl std::fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller wants done with the document.
///
/// The analysis type is kept as the raw string the caller sent so that an
/// unknown type can still be rescued by a free-form prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct AnalysisRequest {
    pub analysis_type: Option<String>,
    pub prompt: Option<String>,
}

impl AnalysisRequest {
    pub fn predefined(analysis_type: AnalysisType) -> Self {
        Self {
            analysis_type: Some(analysis_type.as_str().to_string()),
            prompt: None,
        }
    }

    pub fn free_form(prompt: impl Into<String>) -> Self {
        Self {
            analysis_type: None,
            prompt: Some(prompt.into()),
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    /// The recognized predefined type, if any.
    pub fn known_type(&self) -> Option<AnalysisType> {
        self.analysis_type.as_deref().and_then(AnalysisType::parse)
    }

    /// Free-form prompt, ignoring blank strings.
    pub fn prompt(&self) -> Option<&str> {
        self.prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }

    /// Resolve the request to an objective.
    ///
    /// A free-form prompt wins over the predefined type. An unknown type with
    /// no prompt is an error.
    pub fn objective(&self) -> Result<String, CoreError> {
        if let Some(prompt) = self.prompt() {
            return Ok(prompt.to_string());
        }
        match (&self.analysis_type, self.known_type()) {
            (_, Some(known)) => Ok(known.objective().to_string()),
            (Some(raw), None) => Err(CoreError::UnknownAnalysisType(raw.clone())),
            (None, None) => Err(CoreError::UnknownAnalysisType(
                "no analysis type or prompt given".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analysis_type_parsing() {
        assert_eq!(
            AnalysisType::parse("financial-summary"),
            Some(AnalysisType::FinancialSummary)
        );
        assert_eq!(
            AnalysisType::parse("KEY_METRICS"),
            Some(AnalysisType::KeyMetrics)
        );
        assert_eq!(AnalysisType::parse("horoscope"), None);
    }

    #[test]
    fn test_analysis_type_serialization() {
        let json = serde_json::to_string(&AnalysisType::TrendAnalysis).unwrap();
        assert_eq!(json, "\"trend-analysis\"");
    }

    #[test]
    fn test_prompt_overrides_type() {
        let request =
            AnalysisRequest::predefined(AnalysisType::RiskReview).with_prompt("List every lease");
        assert_eq!(request.objective().unwrap(), "List every lease");
    }

    #[test]
    fn test_unknown_type_without_prompt_fails() {
        let request = AnalysisRequest {
            analysis_type: Some("horoscope".into()),
            prompt: Some("   ".into()),
        };
        assert!(matches!(
            request.objective(),
            Err(CoreError::UnknownAnalysisType(t)) if t == "horoscope"
        ));
        assert!(AnalysisRequest::default().objective().is_err());
    }

    #[test]
    fn test_unknown_type_rescued_by_prompt() {
        let request = AnalysisRequest {
            analysis_type: Some("horoscope".into()),
            prompt: Some("Summarise cash flow".into()),
        };
        assert_eq!(request.objective().unwrap(), "Summarise cash flow");
    }
}
