use docflow_core::{Document, ExtractionField, ExtractionStrategy, InstructionSet, TaskDescription};

use crate::core::RepairFeedback;

/// Name of the arranged data file staged next to the generated code.
pub const ARRANGED_DATA_FILE: &str = "arranged_data.json";

/// Stderr passed back for repair is cut to this many characters.
const REPAIR_STDERR_CHARS: usize = 4000;

pub struct StagePrompts;

impl StagePrompts {
    pub fn extraction_system() -> &'static str {
        "You are a meticulous financial data extraction specialist. You read \
         documents and report figures exactly as they appear, never inventing \
         values. You always answer with a single JSON object and nothing else."
    }

    pub fn code_generation_system() -> &'static str {
        "You are a senior Python engineer who writes self-contained report \
         generation scripts. Scripts run unattended in an empty directory with \
         no network access, so they must not install packages or download \
         anything. Answer with exactly one fenced code block."
    }

    fn strategy_guidance(strategy: ExtractionStrategy) -> &'static str {
        match strategy {
            ExtractionStrategy::Tabular => {
                "The document is mostly tables. Read values row by row and keep the column header as the period."
            }
            ExtractionStrategy::Narrative => {
                "The document is prose. Figures are embedded in sentences; quote the sentence as the source location."
            }
            ExtractionStrategy::Structured => {
                "The document is structured data. Map keys to fields directly and keep the key path as the source location."
            }
            ExtractionStrategy::SourceCode => {
                "The document is source code. Only extract figures that appear as literal constants or data tables."
            }
            ExtractionStrategy::Scanned => {
                "The document text came from OCR. Expect broken words and misaligned columns; lower confidence accordingly."
            }
        }
    }

    /// The extraction prompt the prompt engineer hands to the extractor.
    pub fn extraction(task: &TaskDescription, strategy: ExtractionStrategy) -> String {
        format!(
            r#"## Objective
{objective}

## Document
Domain: {domain}
Complexity: {complexity}
{guidance}

## Instructions
Extract every value that matches one of the fields listed below. A field may
have several values, for example one per reporting period; report each as a
separate data point. Use the field name exactly as listed. If a value appears
under a different label, still report it under the listed field name.
Values that clearly matter but match no listed field may be reported under a
descriptive snake_case name of your own."#,
            objective = task.objective,
            domain = task.domain,
            complexity = task.complexity.as_str(),
            guidance = Self::strategy_guidance(strategy),
        )
    }

    fn field_table(fields: &[ExtractionField]) -> String {
        fields
            .iter()
            .map(|field| {
                format!(
                    "- `{}` ({}, {}, category: {}): {}",
                    field.name,
                    field.kind.as_str(),
                    if field.required { "required" } else { "optional" },
                    field.category,
                    field.description
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn bullets(items: &[String]) -> String {
        items
            .iter()
            .map(|item| format!("- {}", item))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The full request sent to the generation service by the extractor.
    pub fn extraction_request(
        instructions: &InstructionSet,
        document: &Document,
        text: &str,
        truncated: bool,
    ) -> String {
        let truncation_note = if truncated {
            "\n(The document was cut to fit; figures past this point are unavailable.)"
        } else {
            ""
        };
        format!(
            r#"{prompt}

## Fields
{fields}

## Formatting rules
{rules}

## Validation criteria
{criteria}

## Response format
Respond with one JSON object:
{{
  "data_points": [
    {{
      "field_name": "revenue",
      "value": "1250000",
      "data_type": "currency",
      "category": "Income Statement",
      "unit": "USD",
      "period": "FY2024",
      "confidence": 0.95,
      "source_location": "page 3, table 2"
    }}
  ],
  "summary": "one paragraph overview of the document",
  "confidence": 0.9,
  "notes": "anything the reader should know"
}}

## Document: {name} ({format})
{text}{truncation_note}"#,
            prompt = instructions.extraction_prompt,
            fields = Self::field_table(&instructions.fields),
            rules = Self::bullets(&instructions.formatting_rules),
            criteria = Self::bullets(&instructions.validation_criteria),
            name = document.name,
            format = document.format,
            text = text,
            truncation_note = truncation_note,
        )
    }

    /// Code generation request. The arranged data is embedded directly and
    /// also staged as a file the script can fall back to.
    pub fn code_generation(
        objective: &str,
        arranged_json: &str,
        report_name: &str,
        repair: Option<&RepairFeedback>,
    ) -> String {
        let mut prompt = format!(
            r#"Write a Python 3 script that produces a spreadsheet report.

## Objective
{objective}

## Data
PRIMARY SOURCE: the JSON below.
```json
{arranged_json}
```
FALLBACK: if embedding the JSON is impractical, read the same data from the
file `{data_file}` in the current directory.

The data is organized into categories of fields. A field's `status` is either
`found`, with one or more `values`, or `not_found`. The `unmapped` list holds
values that fit no declared field; include them on their own sheet.

## Requirements
- Use openpyxl if it is importable; otherwise write a CSV file with the same
  base name and print a warning to stderr.
- Create one worksheet per category, plus a summary sheet with completeness.
- Show `not found` for missing fields instead of leaving cells blank.
- Handle missing or malformed values gracefully; never crash on bad data.
- Save the report as `{report_name}` in the current directory.
- Print the names of the files you wrote to stdout.
- Do not access the network and do not install packages.
- Exit with status 0 on success and non-zero on failure."#,
            objective = objective,
            arranged_json = arranged_json,
            data_file = ARRANGED_DATA_FILE,
            report_name = report_name,
        );

        if let Some(repair) = repair {
            let stderr: String = repair.stderr.chars().take(REPAIR_STDERR_CHARS).collect();
            prompt.push_str(&format!(
                r#"

## Previous attempt failed
Attempt {attempt} exited with {status}. Fix the script.

Stderr:
```
{stderr}
```

Previous script:
```python
{code}
```"#,
                attempt = repair.attempt,
                status = repair.exit_status,
                stderr = stderr.trim_end(),
                code = repair.previous_code,
            ));
        }
        prompt
    }
}
