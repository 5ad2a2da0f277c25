//! First stage: decide how the document should be read.

use async_trait::async_trait;
use docflow_core::{
    AnalysisType, Complexity, Document, DocumentFormat, ExtractionStrategy, RoutingDecision,
    StageError, StageName, StagePayload, TaskDescription,
};
use tracing::debug;

use crate::core::{Stage, StageInput, StageOutcome};

const SIMPLE_CHARS: usize = 2_000;
const COMPLEX_CHARS: usize = 50_000;
const COMPLEX_TABLES: u32 = 5;
/// Share of lines that must look like table rows for tabular extraction.
const TABULAR_LINE_RATIO: f64 = 0.4;
/// Below this share of letters among visible characters text is treated as
/// OCR output.
const SCANNED_ALPHA_RATIO: f64 = 0.5;

const FINANCIAL_TERMS: &[&str] = &[
    "revenue",
    "net income",
    "balance sheet",
    "cash flow",
    "ebitda",
    "liabilities",
    "assets",
    "operating income",
    "earnings per share",
    "fiscal",
];
const LEGAL_TERMS: &[&str] = &["agreement", "hereby", "clause", "party", "jurisdiction"];
const TECHNICAL_TERMS: &[&str] = &["function", "import", "class ", "return", "module"];

/// Deterministic router. Looks at the format, layout hints and the shape of
/// the text; never calls the generation service.
#[derive(Debug, Clone, Copy, Default)]
pub struct Coordinator;

impl Coordinator {
    pub fn new() -> Self {
        Self
    }

    fn strategy(document: &Document) -> ExtractionStrategy {
        match document.format {
            f if f.is_image() => ExtractionStrategy::Scanned,
            DocumentFormat::Py | DocumentFormat::Js | DocumentFormat::Ts => {
                ExtractionStrategy::SourceCode
            }
            DocumentFormat::Json | DocumentFormat::Xml => ExtractionStrategy::Structured,
            f if f.is_spreadsheet() => ExtractionStrategy::Tabular,
            _ => {
                if letter_ratio(&document.text) < SCANNED_ALPHA_RATIO {
                    ExtractionStrategy::Scanned
                } else if tabular_line_ratio(&document.text) >= TABULAR_LINE_RATIO
                    || (table_count(document) > 0 && tabular_line_ratio(&document.text) > 0.2)
                {
                    ExtractionStrategy::Tabular
                } else {
                    ExtractionStrategy::Narrative
                }
            }
        }
    }

    fn domain(document: &Document, analysis_type: Option<AnalysisType>) -> String {
        if analysis_type.is_some() {
            // Every predefined analysis is a financial one.
            return "financial".to_string();
        }
        let text = document.text.to_lowercase();
        let score = |terms: &[&str]| terms.iter().filter(|t| text.contains(*t)).count();
        let scores = [
            ("financial", score(FINANCIAL_TERMS)),
            ("legal", score(LEGAL_TERMS)),
            ("technical", score(TECHNICAL_TERMS)),
        ];
        scores
            .iter()
            .filter(|(_, s)| *s >= 2)
            .max_by_key(|(_, s)| *s)
            .map(|(name, _)| name.to_string())
            .unwrap_or_else(|| "general".to_string())
    }

    fn complexity(document: &Document) -> Complexity {
        let chars = document.text.chars().count();
        let tables = table_count(document);
        if chars > COMPLEX_CHARS || tables > COMPLEX_TABLES {
            Complexity::Complex
        } else if chars < SIMPLE_CHARS && tables <= 1 {
            Complexity::Simple
        } else {
            Complexity::Moderate
        }
    }

    pub fn route(input: &StageInput) -> Result<RoutingDecision, StageError> {
        let document = &input.document;
        if document.is_blank() {
            return Err(StageError::permanent(format!(
                "document '{}' contains no text",
                document.name
            )));
        }
        let objective = input
            .request
            .objective()
            .map_err(|e| StageError::permanent(e.to_string()))?;

        let analysis_type = input.request.known_type();
        let mut notes = Vec::new();
        if let (Some(raw), None) = (&input.request.analysis_type, analysis_type) {
            notes.push(format!(
                "unknown analysis type '{}' replaced by the free-form prompt",
                raw
            ));
        } else if analysis_type.is_some() && input.request.prompt().is_some() {
            notes.push("free-form prompt takes precedence over the analysis type".to_string());
        }
        if let Some(pages) = document.layout.as_ref().and_then(|l| l.page_count) {
            notes.push(format!("{} pages", pages));
        }
        let tables = table_count(document);
        if tables > 0 {
            notes.push(format!("{} tables detected", tables));
        }

        let strategy = Self::strategy(document);
        let task = TaskDescription {
            objective,
            domain: Self::domain(document, analysis_type),
            complexity: Self::complexity(document),
            analysis_type,
        };
        debug!(
            run_id = %input.run_id,
            strategy = strategy.as_str(),
            domain = %task.domain,
            complexity = task.complexity.as_str(),
            "Document routed"
        );
        Ok(RoutingDecision {
            strategy,
            task,
            notes,
        })
    }
}

fn table_count(document: &Document) -> u32 {
    document
        .layout
        .as_ref()
        .and_then(|l| l.table_count)
        .unwrap_or(0)
}

fn letter_ratio(text: &str) -> f64 {
    let visible = text.chars().filter(|c| !c.is_whitespace()).count();
    if visible == 0 {
        return 0.0;
    }
    let letters = text.chars().filter(|c| c.is_alphabetic()).count();
    let digits = text.chars().filter(|c| c.is_ascii_digit()).count();
    // Digits are expected in financial text and do not count against it.
    (letters + digits) as f64 / visible as f64
}

/// Share of non-empty lines with at least two separated numeric cells.
fn tabular_line_ratio(text: &str) -> f64 {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return 0.0;
    }
    let rows = lines
        .iter()
        .filter(|line| {
            line.split(|c: char| c == '\t' || c == '|' || c == ',' || c == ';' || c == ' ')
                .filter(|cell| {
                    let cell = cell.trim().trim_matches(|c| matches!(c, '$' | '%' | '(' | ')'));
                    !cell.is_empty()
                        && cell.chars().any(|c| c.is_ascii_digit())
                        && cell
                            .chars()
                            .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '\''))
                })
                .count()
                >= 2
        })
        .count();
    rows as f64 / lines.len() as f64
}

#[async_trait]
impl Stage for Coordinator {
    fn name(&self) -> StageName {
        StageName::Coordinator
    }

    async fn execute(&self, input: &StageInput) -> StageOutcome {
        Self::route(input).map(StagePayload::Routing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docflow_core::{AnalysisRequest, FailureKind, LayoutHints};
    use std::sync::Arc;
    use uuid::Uuid;

    fn input(format: DocumentFormat, text: &str, request: AnalysisRequest) -> StageInput {
        let doc = Document::new("doc", format, text.len() as u64, text);
        StageInput::new(Uuid::new_v4(), Arc::new(doc), request)
    }

    fn summary() -> AnalysisRequest {
        AnalysisRequest::predefined(AnalysisType::FinancialSummary)
    }

    #[test]
    fn test_blank_document_is_permanent() {
        let err = Coordinator::route(&input(DocumentFormat::Txt, "  \n ", summary())).unwrap_err();
        assert_eq!(err.kind, FailureKind::Permanent);
    }

    #[test]
    fn test_unknown_type_without_prompt_is_permanent() {
        let request = AnalysisRequest {
            analysis_type: Some("horoscope".into()),
            prompt: None,
        };
        let err = Coordinator::route(&input(DocumentFormat::Txt, "Revenue 1", request)).unwrap_err();
        assert_eq!(err.kind, FailureKind::Permanent);
        assert!(err.message.contains("horoscope"));
    }

    #[test]
    fn test_unknown_type_rescued_by_prompt() {
        let request = AnalysisRequest {
            analysis_type: Some("horoscope".into()),
            prompt: Some("List every figure".into()),
        };
        let routing = Coordinator::route(&input(DocumentFormat::Txt, "Revenue 1", request)).unwrap();
        assert_eq!(routing.task.objective, "List every figure");
        assert_eq!(routing.task.analysis_type, None);
        assert!(routing.notes[0].contains("horoscope"));
    }

    #[test]
    fn test_strategy_by_format() {
        let cases = [
            (DocumentFormat::Png, ExtractionStrategy::Scanned),
            (DocumentFormat::Py, ExtractionStrategy::SourceCode),
            (DocumentFormat::Json, ExtractionStrategy::Structured),
            (DocumentFormat::Csv, ExtractionStrategy::Tabular),
        ];
        for (format, expected) in cases {
            let routing = Coordinator::route(&input(format, "Revenue was strong", summary())).unwrap();
            assert_eq!(routing.strategy, expected, "{:?}", format);
        }
    }

    #[test]
    fn test_strategy_by_text_shape() {
        let table = "Metric 2023 2024\nRevenue 100 120\nCosts 80 90\nProfit 20 30\n";
        let routing = Coordinator::route(&input(DocumentFormat::Txt, table, summary())).unwrap();
        assert_eq!(routing.strategy, ExtractionStrategy::Tabular);

        let prose = "The company grew revenue by 20 percent thanks to strong demand in Europe.";
        let routing = Coordinator::route(&input(DocumentFormat::Pdf, prose, summary())).unwrap();
        assert_eq!(routing.strategy, ExtractionStrategy::Narrative);

        let garbled = "#~ ^^ |/ ** %% ## @@ ~~ ;; :: == ++ <<";
        let routing = Coordinator::route(&input(DocumentFormat::Pdf, garbled, summary())).unwrap();
        assert_eq!(routing.strategy, ExtractionStrategy::Scanned);
    }

    #[test]
    fn test_domain_and_complexity() {
        let text = "This agreement is hereby entered by each party under the jurisdiction of...";
        let routing = Coordinator::route(&input(
            DocumentFormat::Txt,
            text,
            AnalysisRequest::free_form("Summarise obligations"),
        ))
        .unwrap();
        assert_eq!(routing.task.domain, "legal");
        assert_eq!(routing.task.complexity, Complexity::Simple);

        let doc = Document::new("big.pdf", DocumentFormat::Pdf, 10, "x".repeat(60_000))
            .with_layout(LayoutHints {
                page_count: Some(40),
                table_count: Some(2),
            });
        let big = StageInput::new(Uuid::new_v4(), Arc::new(doc), summary());
        let routing = Coordinator::route(&big).unwrap();
        assert_eq!(routing.task.complexity, Complexity::Complex);
        assert_eq!(routing.task.domain, "financial");
        assert!(routing.notes.contains(&"40 pages".to_string()));
    }
}
