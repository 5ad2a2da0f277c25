//! The stage contract.
//!
//! Every pipeline stage implements [`Stage`]. A stage receives an immutable
//! [`StageInput`] built by the run driver and returns either a typed payload
//! or a classified [`StageError`]. Stages never touch run state and never
//! call each other; everything they need from earlier stages comes through
//! the input.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use docflow_core::{
    AnalysisRequest, ArrangedData, Document, ExitStatus, ExtractedData, InstructionSet,
    RoutingDecision, StageError, StageName, StagePayload,
};
use uuid::Uuid;

pub type StageOutcome = std::result::Result<StagePayload, StageError>;

/// What went wrong with the previous artifact, handed back to the code
/// generator for a repair attempt.
#[derive(Debug, Clone)]
pub struct RepairFeedback {
    pub attempt: u32,
    pub exit_status: ExitStatus,
    pub stderr: String,
    pub previous_code: String,
    /// Outputs the previous artifact promised; the repair keeps the names.
    pub expected_outputs: Vec<String>,
}

/// Read-only view of a run handed to a stage.
#[derive(Debug, Clone)]
pub struct StageInput {
    pub run_id: Uuid,
    pub document: Arc<Document>,
    pub request: AnalysisRequest,
    prior: BTreeMap<StageName, StagePayload>,
    pub repair: Option<RepairFeedback>,
}

impl StageInput {
    pub fn new(run_id: Uuid, document: Arc<Document>, request: AnalysisRequest) -> Self {
        Self {
            run_id,
            document,
            request,
            prior: BTreeMap::new(),
            repair: None,
        }
    }

    pub fn with_output(mut self, stage: StageName, payload: StagePayload) -> Self {
        self.prior.insert(stage, payload);
        self
    }

    pub fn with_repair(mut self, feedback: RepairFeedback) -> Self {
        self.repair = Some(feedback);
        self
    }

    pub fn output(&self, stage: StageName) -> Option<&StagePayload> {
        self.prior.get(&stage)
    }

    fn missing(stage: StageName) -> StageError {
        StageError::validation(format!("missing {} output", stage))
    }

    pub fn routing(&self) -> Result<&RoutingDecision, StageError> {
        self.output(StageName::Coordinator)
            .and_then(StagePayload::as_routing)
            .ok_or_else(|| Self::missing(StageName::Coordinator))
    }

    pub fn instructions(&self) -> Result<&InstructionSet, StageError> {
        self.output(StageName::PromptEngineer)
            .and_then(StagePayload::as_instructions)
            .ok_or_else(|| Self::missing(StageName::PromptEngineer))
    }

    pub fn extracted(&self) -> Result<&ExtractedData, StageError> {
        self.output(StageName::DataExtractor)
            .and_then(StagePayload::as_extracted)
            .ok_or_else(|| Self::missing(StageName::DataExtractor))
    }

    pub fn arranged(&self) -> Result<&ArrangedData, StageError> {
        self.output(StageName::DataArranger)
            .and_then(StagePayload::as_arranged)
            .ok_or_else(|| Self::missing(StageName::DataArranger))
    }
}

/// One unit of the fixed five-step pipeline.
///
/// The driver owns retries, timeouts and cancellation: `execute` may be
/// dropped at any await point and must not leave anything behind that
/// outlives the future.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> StageName;

    async fn execute(&self, input: &StageInput) -> StageOutcome;

    /// Boundary check applied by the driver to every successful output.
    fn validate_output(&self, payload: &StagePayload) -> Result<(), StageError> {
        let expected = self.name().produces();
        if payload.kind() != expected {
            return Err(StageError::validation(format!(
                "{} produced {} payload, expected {}",
                self.name(),
                payload.kind().as_str(),
                expected.as_str()
            )));
        }
        payload.validate().map_err(StageError::validation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docflow_core::{DocumentFormat, ExtractedData, FailureKind, InstructionSet};

    struct Fixed(StagePayload);

    #[async_trait]
    impl Stage for Fixed {
        fn name(&self) -> StageName {
            StageName::PromptEngineer
        }

        async fn execute(&self, _input: &StageInput) -> StageOutcome {
            Ok(self.0.clone())
        }
    }

    fn input() -> StageInput {
        let doc = Document::new("a.txt", DocumentFormat::Txt, 3, "abc");
        StageInput::new(Uuid::new_v4(), Arc::new(doc), AnalysisRequest::free_form("x"))
    }

    #[test]
    fn test_wrong_payload_kind_is_validation_failure() {
        let stage = Fixed(StagePayload::Extracted(ExtractedData::default()));
        let err = stage.validate_output(&stage.0).unwrap_err();
        assert_eq!(err.kind, FailureKind::Validation);
        assert!(err.message.contains("expected instructions"));
    }

    #[test]
    fn test_schema_violation_is_validation_failure() {
        let stage = Fixed(StagePayload::Instructions(InstructionSet::default()));
        let err = stage.validate_output(&stage.0).unwrap_err();
        assert_eq!(err.kind, FailureKind::Validation);
    }

    #[test]
    fn test_missing_prior_output() {
        let err = input().arranged().unwrap_err();
        assert_eq!(err.kind, FailureKind::Validation);
        assert!(err.message.contains("data_arranger"));

        let with = input().with_output(
            StageName::DataExtractor,
            StagePayload::Extracted(ExtractedData::default()),
        );
        assert!(with.extracted().is_ok());
    }
}
