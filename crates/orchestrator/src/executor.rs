//! The run driver.
//!
//! One [`RunExecutor`] is shared by every run. Each call to
//! [`RunExecutor::drive`] owns a single [`RunContext`] and walks it through
//! the five stages and the sandbox, publishing a snapshot after every change.

use std::sync::Arc;
use std::time::Instant;

use docflow_core::{
    ExecutionResult, FailureKind, FailureOrigin, RunContext, RunFailure, RunStatus, StageError,
    StageName, StagePayload,
};
use events::{EventKind, EventSource};
use sandbox::{SandboxError, SandboxRunner};
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::OrchestratorConfig;
use crate::core::{RepairFeedback, RunEmitter, Stage, StageInput};
use crate::resources::{BoundedPool, CancelSignal};
use crate::services::{Incident, IncidentReporter};
use crate::state_machine::RunStateMachine;

/// How a drive ended.
#[derive(Debug)]
enum RunEnd {
    Completed,
    Failed(RunFailure),
    Cancelled,
}

impl RunEnd {
    fn orchestrator(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failed(RunFailure::new(FailureOrigin::Orchestrator, kind, message))
    }
}

pub struct RunExecutor {
    stages: Vec<Arc<dyn Stage>>,
    sandbox: Arc<dyn SandboxRunner>,
    run_slots: BoundedPool,
    sandbox_slots: BoundedPool,
    config: Arc<OrchestratorConfig>,
    incidents: Arc<dyn IncidentReporter>,
}

impl RunExecutor {
    pub fn new(
        stages: Vec<Arc<dyn Stage>>,
        sandbox: Arc<dyn SandboxRunner>,
        config: Arc<OrchestratorConfig>,
        incidents: Arc<dyn IncidentReporter>,
    ) -> Self {
        Self {
            stages,
            sandbox,
            run_slots: BoundedPool::new(config.max_concurrent_runs),
            sandbox_slots: BoundedPool::new(config.max_sandbox_workers),
            config,
            incidents,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn run_slots(&self) -> &BoundedPool {
        &self.run_slots
    }

    pub fn sandbox_slots(&self) -> &BoundedPool {
        &self.sandbox_slots
    }

    pub fn incidents(&self) -> Arc<dyn IncidentReporter> {
        self.incidents.clone()
    }

    /// Wake everything queued on a pool.
    pub fn close(&self) {
        self.run_slots.close();
        self.sandbox_slots.close();
    }

    /// Drive `ctx` to a terminal state and return it.
    ///
    /// Every state change is published on `snapshots` before the matching
    /// event goes out, so a subscriber that reacts to an event always finds
    /// a snapshot at least that recent.
    pub async fn drive(
        &self,
        ctx: RunContext,
        emitter: RunEmitter,
        cancel: CancelSignal,
        snapshots: &watch::Sender<Arc<RunContext>>,
    ) -> RunContext {
        let span = info_span!("run", run_id = %ctx.id);
        let mut driver = RunDriver {
            executor: self,
            ctx,
            emitter,
            cancel,
            snapshots,
            started: Instant::now(),
        };
        async move {
            let end = match driver.run().await {
                Ok(()) => RunEnd::Completed,
                Err(end) => end,
            };
            driver.finish(end);
            driver.ctx
        }
        .instrument(span)
        .await
    }
}

struct RunDriver<'a> {
    executor: &'a RunExecutor,
    ctx: RunContext,
    emitter: RunEmitter,
    cancel: CancelSignal,
    snapshots: &'a watch::Sender<Arc<RunContext>>,
    started: Instant,
}

impl RunDriver<'_> {
    async fn run(&mut self) -> Result<(), RunEnd> {
        let config = self.executor.config.clone();
        let _deadline = self.cancel.cancel_after(config.run_timeout());

        let cancel = self.cancel.clone();
        let pool = self.executor.run_slots.clone();
        let _slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RunEnd::Cancelled),
            permit = pool.acquire() => permit.map_err(|e| RunEnd::orchestrator(e.kind(), e.to_string()))?,
        };

        info!(
            document = %self.ctx.document.name,
            format = %self.ctx.document.format,
            "Run started"
        );
        self.emitter.emit(
            EventSource::Run,
            EventKind::Started,
            format!("Processing {}", self.ctx.document.name),
        );

        let stages = self.executor.stages.clone();
        for stage in &stages {
            self.run_stage(stage.as_ref(), None).await?;
        }

        let generator = stages
            .iter()
            .find(|s| s.name() == StageName::CodeGenerator)
            .cloned()
            .ok_or_else(|| RunEnd::orchestrator(FailureKind::System, "pipeline has no code generator"))?;

        let mut repairs = 0;
        loop {
            let execution = self.execute_artifact().await?;
            let problem = execution_problem(&execution);
            let Some((kind, message)) = problem else {
                self.ctx.execution = Some(execution);
                return Ok(());
            };

            let repairable = kind != FailureKind::SandboxViolation;
            if !repairable || repairs >= config.repair_attempts {
                self.ctx.execution = Some(execution);
                return Err(RunEnd::Failed(RunFailure::new(
                    FailureOrigin::Sandbox,
                    kind,
                    message,
                )));
            }

            repairs += 1;
            let previous = self.ctx.artifact.clone().ok_or_else(|| {
                RunEnd::orchestrator(FailureKind::System, "no artifact to repair")
            })?;
            let feedback = RepairFeedback {
                attempt: repairs,
                exit_status: execution.exit_status,
                stderr: if execution.stderr.trim().is_empty() {
                    message.clone()
                } else {
                    execution.stderr.clone()
                },
                previous_code: previous.code,
                expected_outputs: previous.expected_outputs,
            };
            info!(repair = repairs, problem = %message, "Requesting repair of generated code");
            self.ctx.execution = Some(execution);
            self.emitter.stage_progress(
                StageName::CodeGenerator,
                format!("Repairing generated code ({})", message),
            );
            self.run_stage(generator.as_ref(), Some(feedback)).await?;
        }
    }

    fn publish(&mut self) {
        self.ctx.touch();
        self.snapshots.send_replace(Arc::new(self.ctx.clone()));
    }

    fn transition(&mut self, to: RunStatus) -> Result<(), RunEnd> {
        RunStateMachine::validate_transition(&self.ctx.status, &to)
            .map_err(|e| RunEnd::orchestrator(FailureKind::System, e.to_string()))?;
        info!(from = %self.ctx.status, to = %to, "Run state transition");
        self.ctx.status = to;
        if let RunStatus::StageRunning(stage) | RunStatus::StageDone(stage) = to {
            self.ctx.current_stage = Some(stage.index());
        }
        self.publish();
        Ok(())
    }

    fn stage_input(&self, repair: Option<RepairFeedback>) -> StageInput {
        let mut input = StageInput::new(
            self.ctx.id,
            self.ctx.document.clone(),
            self.ctx.request.clone(),
        );
        for result in &self.ctx.stage_results {
            if let Some(output) = &result.output {
                input = input.with_output(result.stage, output.clone());
            }
        }
        match repair {
            Some(feedback) => input.with_repair(feedback),
            None => input,
        }
    }

    /// Record cancellation against the running stage.
    fn cancel_stage(&mut self, stage: StageName) -> RunEnd {
        let reason = self.cancel.reason().unwrap_or_else(|| "cancelled".to_string());
        debug!(stage = %stage, reason = %reason, "Stage interrupted by cancellation");
        self.ctx
            .stage_result_mut(stage)
            .fail(StageError::permanent(format!("cancelled: {}", reason)));
        RunEnd::Cancelled
    }

    /// Run one stage to success, retrying transient failures.
    async fn run_stage(
        &mut self,
        stage: &dyn Stage,
        repair: Option<RepairFeedback>,
    ) -> Result<(), RunEnd> {
        let name = stage.name();
        self.transition(RunStatus::StageRunning(name))?;

        let input = self.stage_input(repair);
        let policy = self.executor.config.retry.clone();
        let timeout = self.executor.config.stage_timeout();
        let cancel = self.cancel.clone();
        let mut tries = 0;

        loop {
            tries += 1;
            let slot = self.ctx.stage_result_mut(name);
            slot.begin_attempt();
            let attempt = slot.attempts;
            self.publish();
            self.emitter.stage_started(name, attempt);
            debug!(stage = %name, attempt, "Stage attempt started");

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = tokio::time::timeout(timeout, stage.execute(&input)) => Some(match result {
                    Ok(outcome) => outcome.and_then(|payload| {
                        stage.validate_output(&payload)?;
                        Ok(payload)
                    }),
                    Err(_) => Err(StageError::transient(format!(
                        "{} timed out after {}ms",
                        name.display_name(),
                        timeout.as_millis()
                    ))),
                }),
            };
            let Some(outcome) = outcome else {
                return Err(self.cancel_stage(name));
            };

            match outcome {
                Ok(payload) => {
                    if let StagePayload::Artifact(artifact) = &payload {
                        self.ctx.artifact = Some(artifact.clone());
                    }
                    self.ctx.stage_result_mut(name).succeed(payload);
                    info!(stage = %name, attempt, "Stage completed");
                    self.transition(RunStatus::StageDone(name))?;
                    self.emitter.stage_completed(name);
                    return Ok(());
                }
                Err(error) if error.kind.is_retryable() && tries < policy.max_attempts => {
                    let delay = policy.backoff_for(tries);
                    warn!(
                        stage = %name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error.message,
                        "Stage attempt failed, retrying"
                    );
                    self.emitter.stage_failed(
                        name,
                        error.kind,
                        &format!("{} (retrying in {}ms)", error.message, delay.as_millis()),
                    );
                    self.ctx.stage_result_mut(name).retry(error);
                    self.publish();

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(self.cancel_stage(name)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(error) => {
                    warn!(
                        stage = %name,
                        attempt,
                        kind = %error.kind,
                        error = %error.message,
                        "Stage failed"
                    );
                    self.emitter.stage_failed(name, error.kind, &error.message);
                    let failure = RunFailure::from_stage(name, &error);
                    self.ctx.stage_result_mut(name).fail(error);
                    return Err(RunEnd::Failed(failure));
                }
            }
        }
    }

    async fn execute_artifact(&mut self) -> Result<ExecutionResult, RunEnd> {
        let artifact = self.ctx.artifact.clone().ok_or_else(|| {
            RunEnd::orchestrator(FailureKind::System, "no artifact to execute")
        })?;
        self.transition(RunStatus::Executing)?;

        let cancel = self.cancel.clone();
        let pool = self.executor.sandbox_slots.clone();
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RunEnd::Cancelled),
            permit = pool.acquire() => permit.map_err(|e| RunEnd::orchestrator(e.kind(), e.to_string()))?,
        };

        self.emitter.sandbox(
            EventKind::Started,
            format!("Executing {} artifact", artifact.language),
        );
        let result = self
            .executor
            .sandbox
            .run(&artifact, &self.executor.config.limits, cancel.token().clone())
            .await;

        match result {
            Ok(execution) => {
                match execution_problem(&execution) {
                    None => self.emitter.sandbox(
                        EventKind::Completed,
                        format!(
                            "Execution finished in {}ms, {} file(s) produced",
                            execution.duration_ms,
                            execution.produced_files.len()
                        ),
                    ),
                    Some((kind, message)) => {
                        self.emitter.sandbox(EventKind::Failed { failure: kind }, message)
                    }
                }
                Ok(execution)
            }
            Err(SandboxError::Cancelled) => Err(RunEnd::Cancelled),
            Err(e) => {
                let kind = e.kind().unwrap_or(FailureKind::System);
                warn!(error = %e, "Sandbox execution failed");
                self.emitter
                    .sandbox(EventKind::Failed { failure: kind }, e.to_string());
                Err(RunEnd::Failed(RunFailure::new(
                    FailureOrigin::Sandbox,
                    kind,
                    e.to_string(),
                )))
            }
        }
    }

    fn finish(&mut self, end: RunEnd) {
        let (status, message) = match end {
            RunEnd::Completed => (
                RunStatus::Completed,
                format!("Run completed in {}ms", self.started.elapsed().as_millis()),
            ),
            RunEnd::Failed(failure) => {
                let message = format!(
                    "Run failed at {} ({}): {}",
                    failure.origin, failure.kind, failure.message
                );
                if failure.kind == FailureKind::System {
                    self.executor.incidents.report(&Incident::new(
                        self.ctx.id,
                        failure.origin,
                        failure.message.clone(),
                    ));
                }
                self.ctx.failure = Some(failure);
                (RunStatus::Failed, message)
            }
            RunEnd::Cancelled => {
                let reason = self
                    .cancel
                    .reason()
                    .unwrap_or_else(|| "cancelled".to_string());
                let message = format!("Run cancelled: {}", reason);
                self.ctx.cancel_reason = Some(reason);
                (RunStatus::Cancelled, message)
            }
        };

        if !RunStateMachine::can_transition(&self.ctx.status, &status) {
            warn!(from = %self.ctx.status, to = %status, "Unplanned terminal transition");
        }
        info!(from = %self.ctx.status, to = %status, "Run state transition");
        self.ctx.finish(status);
        self.snapshots.send_replace(Arc::new(self.ctx.clone()));
        self.emitter.terminal(status, Some(message));
    }
}

/// What is wrong with a finished execution, if anything.
fn execution_problem(execution: &ExecutionResult) -> Option<(FailureKind, String)> {
    if execution.limit_exceeded {
        let limit = execution
            .limit
            .map(|l| l.as_str().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        return Some((
            FailureKind::SandboxViolation,
            format!("resource limit exceeded: {}", limit),
        ));
    }
    if !execution.exit_status.success() {
        return Some((
            FailureKind::Permanent,
            format!("generated code exited with {}", execution.exit_status),
        ));
    }
    if !execution.missing_outputs.is_empty() {
        return Some((
            FailureKind::Permanent,
            format!(
                "generated code did not produce {}",
                execution.missing_outputs.join(", ")
            ),
        ));
    }
    None
}
