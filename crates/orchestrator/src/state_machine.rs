use docflow_core::{RunStatus, StageName};

use crate::error::{OrchestratorError, Result};

pub struct RunStateMachine;

impl RunStateMachine {
    pub fn validate_transition(from: &RunStatus, to: &RunStatus) -> Result<()> {
        let allowed = Self::allowed_transitions(from);

        if allowed.contains(to) {
            Ok(())
        } else {
            Err(OrchestratorError::invalid_transition(from, to))
        }
    }

    pub fn allowed_transitions(from: &RunStatus) -> Vec<RunStatus> {
        use RunStatus::*;
        match from {
            Created => vec![StageRunning(StageName::Coordinator), Cancelled],
            StageRunning(stage) => vec![StageDone(*stage), Failed, Cancelled],
            StageDone(StageName::CodeGenerator) => vec![Executing, Failed, Cancelled],
            StageDone(stage) => match stage.next() {
                Some(next) => vec![StageRunning(next), Failed, Cancelled],
                None => vec![Failed, Cancelled],
            },
            // A failing artifact re-enters code generation for repair.
            Executing => vec![
                Completed,
                Failed,
                Cancelled,
                StageRunning(StageName::CodeGenerator),
            ],
            Completed | Failed | Cancelled => vec![],
        }
    }

    pub fn can_transition(from: &RunStatus, to: &RunStatus) -> bool {
        Self::validate_transition(from, to).is_ok()
    }

    /// The next state on the happy path.
    pub fn next_status(current: &RunStatus) -> Option<RunStatus> {
        use RunStatus::*;
        match current {
            Created => Some(StageRunning(StageName::Coordinator)),
            StageRunning(stage) => Some(StageDone(*stage)),
            StageDone(StageName::CodeGenerator) => Some(Executing),
            StageDone(stage) => stage.next().map(StageRunning),
            Executing => Some(Completed),
            Completed | Failed | Cancelled => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docflow_core::RunStatus::*;

    #[test]
    fn test_happy_path_is_strictly_ordered() {
        let mut status = Created;
        let mut path = vec![status];
        while let Some(next) = RunStateMachine::next_status(&status) {
            assert!(RunStateMachine::can_transition(&status, &next));
            status = next;
            path.push(status);
        }
        assert_eq!(status, Completed);
        // created + 5 * (running, done) + executing + completed
        assert_eq!(path.len(), 13);
    }

    #[test]
    fn test_cannot_skip_stages() {
        assert!(!RunStateMachine::can_transition(
            &StageDone(StageName::Coordinator),
            &StageRunning(StageName::DataExtractor)
        ));
        assert!(!RunStateMachine::can_transition(
            &Created,
            &StageRunning(StageName::PromptEngineer)
        ));
        assert!(!RunStateMachine::can_transition(
            &StageRunning(StageName::DataArranger),
            &Completed
        ));
    }

    #[test]
    fn test_failed_reachable_from_running_states() {
        for stage in StageName::ALL {
            assert!(RunStateMachine::can_transition(&StageRunning(stage), &Failed));
        }
        assert!(RunStateMachine::can_transition(&Executing, &Failed));
        assert!(!RunStateMachine::can_transition(&Created, &Failed));
    }

    #[test]
    fn test_cancelled_reachable_before_completion() {
        assert!(RunStateMachine::can_transition(&Created, &Cancelled));
        assert!(RunStateMachine::can_transition(&Executing, &Cancelled));
        assert!(!RunStateMachine::can_transition(&Completed, &Cancelled));
        assert!(!RunStateMachine::can_transition(&Failed, &Cancelled));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [Completed, Failed, Cancelled] {
            assert!(RunStateMachine::allowed_transitions(&terminal).is_empty());
            assert_eq!(RunStateMachine::next_status(&terminal), None);
        }
    }

    #[test]
    fn test_repair_reenters_code_generation() {
        assert!(RunStateMachine::can_transition(
            &Executing,
            &StageRunning(StageName::CodeGenerator)
        ));
        assert!(!RunStateMachine::can_transition(
            &Executing,
            &StageRunning(StageName::DataArranger)
        ));
    }
}
