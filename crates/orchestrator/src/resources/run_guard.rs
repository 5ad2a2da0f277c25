//! RAII guard for a run's driver task.
//!
//! If the driver future is dropped or panics before it records a terminal
//! state, the guard does it instead so subscribers and waiters are never
//! left hanging.

use std::sync::Arc;

use docflow_core::{FailureKind, FailureOrigin, RunContext, RunFailure, RunStatus};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::core::RunEmitter;
use crate::services::{Incident, IncidentReporter};

const ABANDONED_MESSAGE: &str = "run driver terminated unexpectedly";

pub struct RunGuard {
    emitter: RunEmitter,
    snapshots: watch::Sender<Arc<RunContext>>,
    incidents: Arc<dyn IncidentReporter>,
    completed: bool,
}

impl RunGuard {
    pub fn new(
        emitter: RunEmitter,
        snapshots: watch::Sender<Arc<RunContext>>,
        incidents: Arc<dyn IncidentReporter>,
    ) -> Self {
        debug!(run_id = %emitter.run_id(), "Run guard created");
        Self {
            emitter,
            snapshots,
            incidents,
            completed: false,
        }
    }

    /// The driver reached a terminal state on its own.
    pub fn mark_completed(&mut self) {
        self.completed = true;
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// The channel the driver publishes snapshots on.
    pub fn snapshots(&self) -> &watch::Sender<Arc<RunContext>> {
        &self.snapshots
    }

    fn abandon(&self) {
        let mut ctx = RunContext::clone(&self.snapshots.borrow());
        if !ctx.finish(RunStatus::Failed) {
            return;
        }
        let failure = RunFailure::new(
            FailureOrigin::Orchestrator,
            FailureKind::System,
            ABANDONED_MESSAGE,
        );
        self.incidents.report(&Incident::new(
            ctx.id,
            failure.origin,
            failure.message.clone(),
        ));
        ctx.failure = Some(failure);
        self.snapshots.send_replace(Arc::new(ctx));
        self.emitter
            .terminal(RunStatus::Failed, Some(ABANDONED_MESSAGE.to_string()));
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.completed {
            warn!(
                run_id = %self.emitter.run_id(),
                "Run guard dropped without completion - marking run failed"
            );
            self.abandon();
        }
    }
}
