//! Per-run event publisher.
//!
//! Sequence numbers are assigned by the bus under the run's lock, so an
//! emitter can be cloned into any task without losing ordering.

use docflow_core::{FailureKind, RunStatus, StageName};
use events::{EventBus, EventKind, EventSource, ProgressEvent};
use uuid::Uuid;

#[derive(Clone)]
pub struct RunEmitter {
    bus: EventBus,
    run_id: Uuid,
}

impl RunEmitter {
    pub fn new(bus: EventBus, run_id: Uuid) -> Self {
        bus.open(run_id);
        Self { bus, run_id }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn emit(
        &self,
        source: EventSource,
        kind: EventKind,
        message: impl Into<Option<String>>,
    ) -> Option<ProgressEvent> {
        self.bus.publish(self.run_id, source, kind, message.into())
    }

    pub fn stage_started(&self, stage: StageName, attempt: u32) -> Option<ProgressEvent> {
        let message = if attempt > 1 {
            format!("{} started (attempt {})", stage.display_name(), attempt)
        } else {
            format!("{} started", stage.display_name())
        };
        self.emit(EventSource::Stage(stage), EventKind::Started, message)
    }

    pub fn stage_progress(&self, stage: StageName, message: impl Into<String>) {
        self.emit(EventSource::Stage(stage), EventKind::Progress, message.into());
    }

    pub fn stage_completed(&self, stage: StageName) {
        self.emit(
            EventSource::Stage(stage),
            EventKind::Completed,
            format!("{} completed", stage.display_name()),
        );
    }

    pub fn stage_failed(&self, stage: StageName, failure: FailureKind, message: &str) {
        self.emit(
            EventSource::Stage(stage),
            EventKind::Failed { failure },
            message.to_string(),
        );
    }

    pub fn sandbox(&self, kind: EventKind, message: impl Into<String>) {
        self.emit(EventSource::Sandbox, kind, message.into());
    }

    /// The last event of the run. Anything published afterwards is ignored
    /// by the bus.
    pub fn terminal(&self, status: RunStatus, message: Option<String>) -> Option<ProgressEvent> {
        self.emit(EventSource::Run, EventKind::Terminal { status }, message)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_sequence() {
        let bus = EventBus::new();
        let first = RunEmitter::new(bus.clone(), Uuid::new_v4());
        let second = first.clone();

        first.stage_completed(StageName::Coordinator);
        second.stage_progress(StageName::PromptEngineer, "building fields");
        let event = first.stage_started(StageName::DataExtractor, 2).unwrap();

        assert_eq!(event.sequence, 3);
        assert_eq!(event.message.as_deref(), Some("Data Extractor started (attempt 2)"));
        assert_eq!(bus.last_sequence(first.run_id()), Some(3));
    }

    #[test]
    fn test_nothing_after_terminal() {
        let bus = EventBus::new();
        let emitter = RunEmitter::new(bus.clone(), Uuid::new_v4());
        emitter.stage_started(StageName::Coordinator, 1);
        assert!(emitter.terminal(RunStatus::Cancelled, None).is_some());
        assert!(emitter.stage_started(StageName::PromptEngineer, 1).is_none());
        assert_eq!(bus.history(emitter.run_id()).len(), 2);
    }
}
