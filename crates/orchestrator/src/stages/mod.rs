//! The five pipeline stages, in execution order.

mod code_generator;
mod coordinator;
mod data_arranger;
mod data_extractor;
mod prompt_engineer;

use std::sync::Arc;

pub use code_generator::CodeGenerator;
pub use coordinator::Coordinator;
pub use data_arranger::DataArranger;
pub use data_extractor::DataExtractor;
pub use prompt_engineer::PromptEngineer;

use crate::config::OrchestratorConfig;
use crate::core::Stage;
use crate::services::GenerationClient;

/// Build the standard pipeline for `config`.
pub fn pipeline(
    config: &OrchestratorConfig,
    client: Arc<dyn GenerationClient>,
) -> Vec<Arc<dyn Stage>> {
    vec![
        Arc::new(Coordinator::new()),
        Arc::new(PromptEngineer::new(config.taxonomy.clone())),
        Arc::new(DataExtractor::new(
            client.clone(),
            config.generation.clone(),
            config.max_prompt_chars,
        )),
        Arc::new(DataArranger::new(config.taxonomy.clone())),
        Arc::new(CodeGenerator::new(
            client,
            config.generation.clone(),
            config.report_prefix.clone(),
            config.report_extension.clone(),
        )),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ScriptedGenerationClient;
    use docflow_core::StageName;

    #[test]
    fn test_pipeline_order() {
        let stages = pipeline(
            &OrchestratorConfig::default(),
            Arc::new(ScriptedGenerationClient::new()),
        );
        let names: Vec<StageName> = stages.iter().map(|s| s.name()).collect();
        assert_eq!(names, StageName::ALL.to_vec());
    }
}
