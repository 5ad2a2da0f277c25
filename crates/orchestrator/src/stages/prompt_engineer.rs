//! Second stage: turn the task and the taxonomy into extraction
//! instructions.

use async_trait::async_trait;
use docflow_core::{
    AnalysisType, ExtractionField, ExtractionStrategy, InstructionSet, RoutingDecision, StageName,
    StagePayload, Taxonomy,
};

use crate::core::{Stage, StageInput, StageOutcome};
use crate::prompts::StagePrompts;

/// Pure transformation; the same routing decision and taxonomy always give
/// the same instruction set.
#[derive(Debug, Clone)]
pub struct PromptEngineer {
    taxonomy: Taxonomy,
}

impl PromptEngineer {
    pub fn new(taxonomy: Taxonomy) -> Self {
        Self { taxonomy }
    }

    fn fields(&self) -> Vec<ExtractionField> {
        self.taxonomy
            .categories
            .iter()
            .flat_map(|category| {
                category.fields.iter().map(move |field| {
                    let mut description = field
                        .description
                        .clone()
                        .unwrap_or_else(|| format!("Reported {}", field.name.replace('_', " ")));
                    if !field.aliases.is_empty() {
                        description.push_str(&format!(
                            " (also labelled: {})",
                            field.aliases.join(", ")
                        ));
                    }
                    ExtractionField {
                        name: field.name.clone(),
                        kind: field.kind,
                        description,
                        required: field.required,
                        category: category.name.clone(),
                    }
                })
            })
            .collect()
    }

    fn formatting_rules(routing: &RoutingDecision) -> Vec<String> {
        let mut rules = vec![
            "Report numbers without thousands separators; use a dot as decimal separator".to_string(),
            "Put the currency or unit in `unit`, never inside `value`".to_string(),
            "Write negative amounts with a leading minus, even if the document uses parentheses"
                .to_string(),
            "Percentages are plain numbers, e.g. 12.5 for 12.5%".to_string(),
            "Dates use ISO 8601 (YYYY-MM-DD)".to_string(),
            "Fill `period` whenever the document states which period a value belongs to"
                .to_string(),
        ];
        match routing.strategy {
            ExtractionStrategy::Tabular => rules.push(
                "Report one data point per table cell; do not aggregate across columns".to_string(),
            ),
            ExtractionStrategy::Scanned => rules.push(
                "Do not guess digits OCR may have garbled; lower the confidence instead".to_string(),
            ),
            _ => {}
        }
        match routing.task.analysis_type {
            Some(AnalysisType::TabularExport) => {
                rules.push("Keep every row, including subtotals and totals".to_string())
            }
            Some(AnalysisType::TrendAnalysis) => {
                rules.push("Report every period available for each field".to_string())
            }
            _ => {}
        }
        rules
    }

    fn validation_criteria(fields: &[ExtractionField]) -> Vec<String> {
        let required: Vec<&str> = fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.as_str())
            .collect();
        let mut criteria = vec![
            "`confidence` is a number between 0 and 1 for every data point and overall"
                .to_string(),
            "Every value appears verbatim or as a direct conversion of the document text"
                .to_string(),
            "`source_location` points to where the value was found".to_string(),
        ];
        if !required.is_empty() {
            criteria.push(format!(
                "Required fields are searched for explicitly: {}",
                required.join(", ")
            ));
        }
        criteria
    }

    pub fn build(&self, routing: &RoutingDecision) -> InstructionSet {
        let fields = self.fields();
        InstructionSet {
            extraction_prompt: StagePrompts::extraction(&routing.task, routing.strategy),
            formatting_rules: Self::formatting_rules(routing),
            validation_criteria: Self::validation_criteria(&fields),
            fields,
        }
    }
}

#[async_trait]
impl Stage for PromptEngineer {
    fn name(&self) -> StageName {
        StageName::PromptEngineer
    }

    async fn execute(&self, input: &StageInput) -> StageOutcome {
        let routing = input.routing()?;
        Ok(StagePayload::Instructions(self.build(routing)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docflow_core::{Complexity, TaskDescription};

    fn routing(strategy: ExtractionStrategy, analysis_type: Option<AnalysisType>) -> RoutingDecision {
        RoutingDecision {
            strategy,
            task: TaskDescription {
                objective: "Summarise the quarter".into(),
                domain: "financial".into(),
                complexity: Complexity::Moderate,
                analysis_type,
            },
            notes: Vec::new(),
        }
    }

    #[test]
    fn test_fields_follow_taxonomy() {
        let engineer = PromptEngineer::new(Taxonomy::default());
        let set = engineer.build(&routing(ExtractionStrategy::Narrative, None));

        assert_eq!(set.fields.len(), Taxonomy::default().field_count());
        let revenue = set.fields.iter().find(|f| f.name == "revenue").unwrap();
        assert_eq!(revenue.category, "Income Statement");
        assert!(revenue.required);
        assert!(revenue.description.contains("net sales"));
        let fcf = set.fields.iter().find(|f| f.name == "free_cash_flow").unwrap();
        assert!(!fcf.required);
        assert!(!set.validation_criteria.last().unwrap().contains("free_cash_flow"));
        assert!(StagePayload::Instructions(set).validate().is_ok());
    }

    #[test]
    fn test_rules_depend_on_routing() {
        let engineer = PromptEngineer::new(Taxonomy::default());
        let tabular = engineer.build(&routing(
            ExtractionStrategy::Tabular,
            Some(AnalysisType::TabularExport),
        ));
        assert!(tabular.formatting_rules.iter().any(|r| r.contains("table cell")));
        assert!(tabular.formatting_rules.iter().any(|r| r.contains("subtotals")));

        let narrative = engineer.build(&routing(ExtractionStrategy::Narrative, None));
        assert!(!narrative.formatting_rules.iter().any(|r| r.contains("table cell")));
    }

    #[test]
    fn test_deterministic() {
        let engineer = PromptEngineer::new(Taxonomy::default());
        let decision = routing(ExtractionStrategy::Structured, None);
        assert_eq!(engineer.build(&decision), engineer.build(&decision));
    }
}
