//! Multi-stage document analysis pipeline.
//!
//! A run takes one ingested document through five stages (coordinator,
//! prompt engineer, data extractor, data arranger, code generator) and then
//! executes the generated artifact in a sandbox. [`Orchestrator`] is the
//! entry point; everything else is exposed for embedding and tests.

pub mod config;
pub mod core;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod prompts;
pub mod report;
pub mod resources;
pub mod response_parser;
pub mod services;
pub mod stages;
pub mod state_machine;

pub use config::{GenerationConfig, OrchestratorConfig, RetentionPolicy, RetryPolicy};
pub use crate::core::{RepairFeedback, RunEmitter, Stage, StageInput, StageOutcome};
pub use error::{OrchestratorError, Result};
pub use executor::RunExecutor;
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use report::RunReport;
pub use resources::{BoundedPool, CancelSignal, RunGuard};
pub use services::{
    ingest, DocumentReader, DocumentUpload, GenerationClient, GenerationError,
    GenerationRequest, HttpGenerationClient, Incident, IncidentReporter, LogIncidentReporter,
    MemoryIncidentReporter, PlainTextReader, ReadOutput, ReaderError, ScriptedGenerationClient,
    ScriptedReply,
};
pub use stages::pipeline;
pub use state_machine::RunStateMachine;
