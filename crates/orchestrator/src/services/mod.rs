pub mod document_reader;
pub mod generation_client;
pub mod incident;

pub use document_reader::{
    ingest, DocumentReader, DocumentUpload, PlainTextReader, ReadOutput, ReaderError,
};
pub use generation_client::{
    GenerationClient, GenerationError, GenerationRequest, HttpGenerationClient, ScriptedGenerationClient,
    ScriptedReply,
};
pub use incident::{Incident, IncidentReporter, LogIncidentReporter, MemoryIncidentReporter};
