use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::analysis::AnalysisRequest;
use super::artifact::{ExecutionResult, GeneratedArtifact};
use super::document::Document;
use super::payload::{ArrangedData, ExtractedData, PayloadKind, StagePayload};
use crate::error::{FailureKind, StageError};

/// The five pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Coordinator,
    PromptEngineer,
    DataExtractor,
    DataArranger,
    CodeGenerator,
}

impl StageName {
    pub const ALL: [StageName; 5] = [
        Self::Coordinator,
        Self::PromptEngineer,
        Self::DataExtractor,
        Self::DataArranger,
        Self::CodeGenerator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coordinator => "coordinator",
            Self::PromptEngineer => "prompt_engineer",
            Self::DataExtractor => "data_extractor",
            Self::DataArranger => "data_arranger",
            Self::CodeGenerator => "code_generator",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| stage.as_str() == s)
    }

    pub fn index(&self) -> usize {
        match self {
            Self::Coordinator => 0,
            Self::PromptEngineer => 1,
            Self::DataExtractor => 2,
            Self::DataArranger => 3,
            Self::CodeGenerator => 4,
        }
    }

    pub fn next(&self) -> Option<Self> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Coordinator => "Coordinator",
            Self::PromptEngineer => "Prompt Engineer",
            Self::DataExtractor => "Data Extractor",
            Self::DataArranger => "Data Arranger",
            Self::CodeGenerator => "Code Generator",
        }
    }

    /// The payload shape this stage must produce.
    pub fn produces(&self) -> PayloadKind {
        match self {
            Self::Coordinator => PayloadKind::Routing,
            Self::PromptEngineer => PayloadKind::Instructions,
            Self::DataExtractor => PayloadKind::Extracted,
            Self::DataArranger => PayloadKind::Arranged,
            Self::CodeGenerator => PayloadKind::Artifact,
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    StageRunning(StageName),
    StageDone(StageName),
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn label(&self) -> String {
        match self {
            Self::Created => "created".to_string(),
            Self::StageRunning(stage) => format!("{}_running", stage),
            Self::StageDone(stage) => format!("{}_done", stage),
            Self::Executing => "executing".to_string(),
            Self::Completed => "completed".to_string(),
            Self::Failed => "failed".to_string(),
            Self::Cancelled => "cancelled".to_string(),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    /// The last attempt failed transiently and another attempt is scheduled.
    Retried,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Retried => "retried",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StageResult {
    pub stage: StageName,
    pub status: StageStatus,
    pub output: Option<StagePayload>,
    pub error: Option<StageError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: u32,
}

impl StageResult {
    pub fn new(stage: StageName) -> Self {
        Self {
            stage,
            status: StageStatus::Pending,
            output: None,
            error: None,
            started_at: None,
            finished_at: None,
            attempts: 0,
        }
    }

    /// Start a new attempt. The first call stamps `started_at`.
    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
        self.status = StageStatus::Running;
        self.error = None;
        self.finished_at = None;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn succeed(&mut self, output: StagePayload) {
        self.status = StageStatus::Succeeded;
        self.output = Some(output);
        self.error = None;
        self.finished_at = Some(Utc::now());
    }

    pub fn retry(&mut self, error: StageError) {
        self.status = StageStatus::Retried;
        self.error = Some(error);
    }

    pub fn fail(&mut self, error: StageError) {
        self.status = StageStatus::Failed;
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Where a terminal failure came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(tag = "origin", content = "stage", rename_all = "snake_case")]
pub enum FailureOrigin {
    Stage(StageName),
    Sandbox,
    Orchestrator,
}

impl std::fmt::Display for FailureOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stage(stage) => write!(f, "stage:{}", stage),
            Self::Sandbox => f.write_str("sandbox"),
            Self::Orchestrator => f.write_str("orchestrator"),
        }
    }
}

/// The classified failure a caller sees once a run has failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct RunFailure {
    pub origin: FailureOrigin,
    pub kind: FailureKind,
    pub message: String,
}

impl RunFailure {
    pub fn new(origin: FailureOrigin, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            origin,
            kind,
            message: message.into(),
        }
    }

    pub fn from_stage(stage: StageName, error: &StageError) -> Self {
        Self::new(FailureOrigin::Stage(stage), error.kind, error.message.clone())
    }
}

/// Per-run state. Owned and mutated by the run's driver only; everybody
/// else reads cloned snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RunContext {
    pub id: Uuid,
    #[schema(value_type = Document)]
    pub document: Arc<Document>,
    pub request: AnalysisRequest,
    pub stage_results: Vec<StageResult>,
    pub current_stage: Option<usize>,
    pub status: RunStatus,
    pub artifact: Option<GeneratedArtifact>,
    pub execution: Option<ExecutionResult>,
    pub failure: Option<RunFailure>,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunContext {
    pub fn new(document: Arc<Document>, request: AnalysisRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            document,
            request,
            stage_results: Vec::new(),
            current_stage: None,
            status: RunStatus::Created,
            artifact: None,
            execution: None,
            failure: None,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn stage_result(&self, stage: StageName) -> Option<&StageResult> {
        self.stage_results.iter().find(|r| r.stage == stage)
    }

    /// The result slot for `stage`, appended on first use.
    ///
    /// Slots are only ever appended in stage order, so a stage that is
    /// re-entered (repair) reuses its existing slot.
    pub fn stage_result_mut(&mut self, stage: StageName) -> &mut StageResult {
        let position = match self.stage_results.iter().position(|r| r.stage == stage) {
            Some(position) => position,
            None => {
                self.stage_results.push(StageResult::new(stage));
                self.stage_results.len() - 1
            }
        };
        &mut self.stage_results[position]
    }

    pub fn output_of(&self, stage: StageName) -> Option<&StagePayload> {
        self.stage_result(stage).and_then(|r| r.output.as_ref())
    }

    pub fn extracted_data(&self) -> Option<&ExtractedData> {
        self.output_of(StageName::DataExtractor)
            .and_then(StagePayload::as_extracted)
    }

    /// The structured data the run produced, if it got that far.
    pub fn arranged_data(&self) -> Option<&ArrangedData> {
        self.output_of(StageName::DataArranger)
            .and_then(StagePayload::as_arranged)
    }

    pub fn succeeded_stages(&self) -> usize {
        self.stage_results
            .iter()
            .filter(|r| r.status == StageStatus::Succeeded)
            .count()
    }

    /// Record a terminal state. Returns false if the run already ended.
    pub fn finish(&mut self, status: RunStatus) -> bool {
        if self.is_terminal() || !status.is_terminal() {
            return false;
        }
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        self.finished_at = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::document::DocumentFormat;
    use crate::domain::payload::{Complexity, ExtractionStrategy, RoutingDecision, TaskDescription};

    fn context() -> RunContext {
        let doc = Document::new("q3.txt", DocumentFormat::Txt, 12, "Revenue: 100");
        RunContext::new(Arc::new(doc), AnalysisRequest::free_form("summarise"))
    }

    fn routing() -> StagePayload {
        StagePayload::Routing(RoutingDecision {
            strategy: ExtractionStrategy::Narrative,
            task: TaskDescription {
                objective: "summarise".into(),
                domain: "financial".into(),
                complexity: Complexity::Simple,
                analysis_type: None,
            },
            notes: Vec::new(),
        })
    }

    #[test]
    fn test_stage_order() {
        assert_eq!(StageName::Coordinator.next(), Some(StageName::PromptEngineer));
        assert_eq!(StageName::CodeGenerator.next(), None);
        for (i, stage) in StageName::ALL.iter().enumerate() {
            assert_eq!(stage.index(), i);
            assert_eq!(StageName::parse(stage.as_str()), Some(*stage));
        }
    }

    #[test]
    fn test_run_status_labels() {
        assert_eq!(
            RunStatus::StageRunning(StageName::DataExtractor).label(),
            "data_extractor_running"
        );
        assert_eq!(RunStatus::Completed.to_string(), "completed");
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Executing.is_terminal());
    }

    #[test]
    fn test_run_status_serialization() {
        let json = serde_json::to_value(RunStatus::StageDone(StageName::Coordinator)).unwrap();
        assert_eq!(json["state"], "stage_done");
        assert_eq!(json["stage"], "coordinator");
    }

    #[test]
    fn test_attempts_accumulate_on_one_slot() {
        let mut ctx = context();
        ctx.stage_result_mut(StageName::Coordinator).begin_attempt();
        ctx.stage_result_mut(StageName::Coordinator)
            .retry(StageError::transient("timeout"));
        ctx.stage_result_mut(StageName::Coordinator).begin_attempt();
        ctx.stage_result_mut(StageName::Coordinator).succeed(routing());

        assert_eq!(ctx.stage_results.len(), 1);
        let result = ctx.stage_result(StageName::Coordinator).unwrap();
        assert_eq!(result.attempts, 2);
        assert_eq!(result.status, StageStatus::Succeeded);
        assert!(result.error.is_none());
        assert!(result.duration_ms().is_some());
        assert_eq!(ctx.succeeded_stages(), 1);
    }

    #[test]
    fn test_finish_is_one_shot() {
        let mut ctx = context();
        assert!(!ctx.finish(RunStatus::Executing));
        assert!(ctx.finish(RunStatus::Cancelled));
        assert!(!ctx.finish(RunStatus::Failed));
        assert_eq!(ctx.status, RunStatus::Cancelled);
        assert!(ctx.finished_at.is_some());
    }

    #[test]
    fn test_failure_origin_display() {
        let failure = RunFailure::from_stage(
            StageName::DataExtractor,
            &StageError::transient("rate limited"),
        );
        assert_eq!(failure.origin.to_string(), "stage:data_extractor");
        assert_eq!(failure.kind, FailureKind::Transient);
        assert_eq!(FailureOrigin::Sandbox.to_string(), "sandbox");
    }
}
