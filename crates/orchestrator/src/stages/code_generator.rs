//! Fifth stage: ask the generation service for a report script.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use docflow_core::{
    ArtifactFile, GeneratedArtifact, Language, StageError, StageName, StagePayload,
};
use tracing::{debug, info};

use crate::config::GenerationConfig;
use crate::core::{Stage, StageInput, StageOutcome};
use crate::prompts::{StagePrompts, ARRANGED_DATA_FILE};
use crate::response_parser::extract_code;
use crate::services::{GenerationClient, GenerationRequest};

pub struct CodeGenerator {
    client: Arc<dyn GenerationClient>,
    generation: GenerationConfig,
    report_prefix: String,
    report_extension: String,
}

impl CodeGenerator {
    pub fn new(
        client: Arc<dyn GenerationClient>,
        generation: GenerationConfig,
        report_prefix: impl Into<String>,
        report_extension: impl Into<String>,
    ) -> Self {
        Self {
            client,
            generation,
            report_prefix: report_prefix.into(),
            report_extension: report_extension.into(),
        }
    }

    /// Timestamped report file name, e.g. `Financial_Report_20240131_093000.xlsx`.
    pub fn report_name(&self) -> String {
        format!(
            "{}_{}.{}",
            self.report_prefix,
            Local::now().format("%Y%m%d_%H%M%S"),
            self.report_extension
        )
    }
}

#[async_trait]
impl Stage for CodeGenerator {
    fn name(&self) -> StageName {
        StageName::CodeGenerator
    }

    async fn execute(&self, input: &StageInput) -> StageOutcome {
        let routing = input.routing()?;
        let arranged = input.arranged()?;
        let arranged_json = serde_json::to_string_pretty(arranged)
            .map_err(|e| StageError::system(format!("failed to serialize arranged data: {}", e)))?;

        // A repair keeps the file name the caller may already have seen.
        let report_name = input
            .repair
            .as_ref()
            .and_then(|r| r.expected_outputs.first().cloned())
            .unwrap_or_else(|| self.report_name());

        if let Some(repair) = &input.repair {
            info!(
                run_id = %input.run_id,
                attempt = repair.attempt,
                status = %repair.exit_status,
                "Requesting repaired artifact"
            );
        }

        let request = GenerationRequest::new(
            self.name(),
            self.generation.model_for(self.name()),
            StagePrompts::code_generation_system(),
            StagePrompts::code_generation(
                &routing.task.objective,
                &arranged_json,
                &report_name,
                input.repair.as_ref(),
            ),
        )
        .with_settings(&self.generation);

        let response = self.client.complete(request).await?;
        let (language, code) = extract_code(&response, Language::Python)
            .ok_or_else(|| StageError::validation("code generation response contained no code"))?;
        debug!(
            run_id = %input.run_id,
            language = %language,
            code_chars = code.len(),
            report = %report_name,
            "Artifact generated"
        );

        let artifact = GeneratedArtifact::new(code, language)
            .with_expected_output(report_name)
            .with_input(ArtifactFile::new(ARRANGED_DATA_FILE, arranged_json));
        Ok(StagePayload::Artifact(artifact))
    }
}
