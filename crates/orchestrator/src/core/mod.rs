//! Core abstractions for the run execution model.
//!
//! - [`Stage`] - Trait that all five pipeline stages implement
//! - [`StageInput`] - What a stage sees of its run
//! - [`RunEmitter`] - Per-run event publisher

mod emitter;
mod stage;

pub use emitter::RunEmitter;
pub use stage::{RepairFeedback, Stage, StageInput, StageOutcome};
