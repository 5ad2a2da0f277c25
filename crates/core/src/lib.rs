pub mod domain;
pub mod error;

pub use domain::analysis::{AnalysisRequest, AnalysisType};
pub use domain::artifact::{
    is_plain_file_name, ArtifactFile, ExecutionResult, ExitStatus, GeneratedArtifact, Language,
    LimitKind, ProducedFile,
};
pub use domain::document::{Document, DocumentFormat, LayoutHints};
pub use domain::payload::{
    ArrangedCategory, ArrangedData, ArrangedField, ArrangedValue, Complexity, DataPoint,
    ExtractedData, ExtractionField, ExtractionStrategy, FieldKind, InstructionSet, PayloadKind,
    RoutingDecision, StagePayload, TaskDescription,
};
pub use domain::run::{
    FailureOrigin, RunContext, RunFailure, RunStatus, StageName, StageResult, StageStatus,
};
pub use domain::taxonomy::{normalize_field_name, CategorySpec, FieldSpec, Taxonomy};
pub use error::{CoreError, FailureKind, StageError};
