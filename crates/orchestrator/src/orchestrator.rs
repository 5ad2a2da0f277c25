//! Public entry point: submit documents, watch runs, fetch results.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use docflow_core::{AnalysisRequest, RunContext};
use events::{EventBus, EventStream};
use sandbox::{ProcessSandbox, SandboxRunner};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::core::{RunEmitter, Stage};
use crate::error::{OrchestratorError, Result};
use crate::executor::RunExecutor;
use crate::resources::{CancelSignal, RunGuard};
use crate::services::{
    ingest, DocumentReader, DocumentUpload, GenerationClient, HttpGenerationClient,
    IncidentReporter, LogIncidentReporter, PlainTextReader,
};
use crate::stages::pipeline;

/// Size of the broadcast channel behind each run's live event stream.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

struct RunEntry {
    snapshots: watch::Receiver<Arc<RunContext>>,
    cancel: CancelSignal,
}

struct Inner {
    config: Arc<OrchestratorConfig>,
    executor: Arc<RunExecutor>,
    reader: Arc<dyn DocumentReader>,
    bus: EventBus,
    runs: RwLock<HashMap<Uuid, RunEntry>>,
    shutdown: CancellationToken,
}

/// Handle to the run registry. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    client: Option<Arc<dyn GenerationClient>>,
    sandbox: Option<Arc<dyn SandboxRunner>>,
    reader: Arc<dyn DocumentReader>,
    incidents: Arc<dyn IncidentReporter>,
    stages: Option<Vec<Arc<dyn Stage>>>,
    bus: Option<EventBus>,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            client: None,
            sandbox: None,
            reader: Arc::new(PlainTextReader),
            incidents: Arc::new(LogIncidentReporter),
            stages: None,
            bus: None,
        }
    }

    pub fn with_client(mut self, client: Arc<dyn GenerationClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn SandboxRunner>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_reader(mut self, reader: Arc<dyn DocumentReader>) -> Self {
        self.reader = reader;
        self
    }

    pub fn with_incidents(mut self, incidents: Arc<dyn IncidentReporter>) -> Self {
        self.incidents = incidents;
        self
    }

    /// Replace the standard pipeline. Stages must still come in pipeline
    /// order or the run fails on its first out-of-order transition.
    pub fn with_stages(mut self, stages: Vec<Arc<dyn Stage>>) -> Self {
        self.stages = Some(stages);
        self
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;

        let client = match self.client {
            Some(client) => client,
            None => Arc::new(
                HttpGenerationClient::new(&self.config.generation)
                    .map_err(|e| OrchestratorError::Config(e.to_string()))?,
            ),
        };
        let sandbox = match self.sandbox {
            Some(sandbox) => sandbox,
            None => Arc::new(ProcessSandbox::new(self.config.sandbox.clone())?),
        };
        let stages = self
            .stages
            .unwrap_or_else(|| pipeline(&self.config, client));
        let bus = self.bus.unwrap_or_else(|| {
            EventBus::with_capacity(self.config.event_buffer, EVENT_CHANNEL_CAPACITY)
        });

        info!(
            sandbox = %sandbox.describe(),
            max_concurrent_runs = self.config.max_concurrent_runs,
            max_sandbox_workers = self.config.max_sandbox_workers,
            "Orchestrator ready"
        );

        let config = Arc::new(self.config);
        let executor = Arc::new(RunExecutor::new(
            stages,
            sandbox,
            config.clone(),
            self.incidents,
        ));
        Ok(Orchestrator {
            inner: Arc::new(Inner {
                config,
                executor,
                reader: self.reader,
                bus,
                runs: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        })
    }
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Ingest the upload and start a run. Returns as soon as the run is
    /// registered; rejected documents fail here and never get a run.
    pub fn submit(&self, upload: DocumentUpload, request: AnalysisRequest) -> Result<Uuid> {
        if self.inner.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }
        if request.prompt().is_none() && request.analysis_type.is_none() {
            return Err(OrchestratorError::InvalidRequest(
                "an analysis type or a prompt is required".to_string(),
            ));
        }

        let document = ingest(
            self.inner.reader.as_ref(),
            &upload,
            self.inner.config.max_document_bytes,
        )
        .map_err(|e| {
            warn!(document = %upload.name, error = %e, "Document rejected");
            e
        })?;

        self.prune_finished();

        let ctx = RunContext::new(Arc::new(document), request);
        let run_id = ctx.id;
        let (tx, rx) = watch::channel(Arc::new(ctx.clone()));
        let emitter = RunEmitter::new(self.inner.bus.clone(), run_id);
        let cancel = CancelSignal::from_token(self.inner.shutdown.child_token());

        self.write_runs().insert(
            run_id,
            RunEntry {
                snapshots: rx,
                cancel: cancel.clone(),
            },
        );
        info!(run_id = %run_id, document = %upload.name, "Run submitted");

        let executor = self.inner.executor.clone();
        let incidents = executor.incidents();
        tokio::spawn(async move {
            let mut guard = RunGuard::new(emitter.clone(), tx, incidents);
            executor.drive(ctx, emitter, cancel, guard.snapshots()).await;
            guard.mark_completed();
        });

        Ok(run_id)
    }

    /// Live events for a run, starting with everything still buffered.
    pub fn subscribe(&self, run_id: Uuid) -> Result<EventStream> {
        self.inner
            .bus
            .subscribe(run_id)
            .ok_or(OrchestratorError::RunNotFound(run_id))
    }

    /// Latest snapshot of a run, terminal or not.
    pub fn snapshot(&self, run_id: Uuid) -> Result<Arc<RunContext>> {
        let runs = self.read_runs();
        let entry = runs
            .get(&run_id)
            .ok_or(OrchestratorError::RunNotFound(run_id))?;
        let snapshot = entry.snapshots.borrow().clone();
        Ok(snapshot)
    }

    /// The finished run. Fails with [`OrchestratorError::NotTerminal`]
    /// while it is still going.
    pub fn result(&self, run_id: Uuid) -> Result<Arc<RunContext>> {
        let snapshot = self.snapshot(run_id)?;
        if snapshot.is_terminal() {
            Ok(snapshot)
        } else {
            Err(OrchestratorError::NotTerminal(run_id))
        }
    }

    /// Wait until the run reaches a terminal state.
    pub async fn wait(&self, run_id: Uuid) -> Result<Arc<RunContext>> {
        let mut rx = {
            let runs = self.read_runs();
            runs.get(&run_id)
                .ok_or(OrchestratorError::RunNotFound(run_id))?
                .snapshots
                .clone()
        };
        let snapshot = rx
            .wait_for(|ctx| ctx.is_terminal())
            .await
            .map_err(|_| OrchestratorError::ShuttingDown)?
            .clone();
        Ok(snapshot)
    }

    /// Request cancellation. Returns true if this call cancelled the run,
    /// false if it had already ended or was already cancelled.
    pub fn cancel(&self, run_id: Uuid, reason: impl Into<String>) -> Result<bool> {
        let runs = self.read_runs();
        let entry = runs
            .get(&run_id)
            .ok_or(OrchestratorError::RunNotFound(run_id))?;
        if entry.snapshots.borrow().is_terminal() {
            return Ok(false);
        }
        let reason = reason.into();
        let cancelled = entry.cancel.cancel(reason.clone());
        if cancelled {
            info!(run_id = %run_id, reason = %reason, "Run cancellation requested");
        }
        Ok(cancelled)
    }

    /// Drop a finished run and its event history.
    pub fn forget(&self, run_id: Uuid) -> Result<()> {
        let mut runs = self.write_runs();
        let entry = runs
            .get(&run_id)
            .ok_or(OrchestratorError::RunNotFound(run_id))?;
        if !entry.snapshots.borrow().is_terminal() {
            return Err(OrchestratorError::NotTerminal(run_id));
        }
        runs.remove(&run_id);
        self.inner.bus.remove_run(run_id);
        Ok(())
    }

    /// Snapshots of every known run, newest first.
    pub fn runs(&self) -> Vec<Arc<RunContext>> {
        self.prune_finished();
        let mut runs: Vec<Arc<RunContext>> = self
            .read_runs()
            .values()
            .map(|entry| entry.snapshots.borrow().clone())
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }

    /// Apply the retention policy to finished runs. Returns how many were
    /// dropped along with their event history.
    pub fn prune_finished(&self) -> usize {
        let policy = &self.inner.config.retention;
        let ttl = policy
            .finished_ttl()
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok());
        let now = Utc::now();

        let mut runs = self.write_runs();
        let mut finished: Vec<(Uuid, DateTime<Utc>)> = runs
            .iter()
            .filter_map(|(id, entry)| {
                let snapshot = entry.snapshots.borrow();
                snapshot
                    .is_terminal()
                    .then(|| (*id, snapshot.finished_at.unwrap_or(snapshot.updated_at)))
            })
            .collect();
        finished.sort_by(|a, b| b.1.cmp(&a.1));

        let expired: Vec<Uuid> = finished
            .iter()
            .enumerate()
            .filter(|(rank, (_, at))| {
                *rank >= policy.max_finished_runs || ttl.is_some_and(|ttl| now - *at >= ttl)
            })
            .map(|(_, (id, _))| *id)
            .collect();
        for run_id in &expired {
            runs.remove(run_id);
            self.inner.bus.remove_run(*run_id);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "Pruned finished runs");
        }
        expired.len()
    }

    /// Cancel every live run and refuse new ones.
    pub fn shutdown(&self) {
        info!("Orchestrator shutting down");
        self.inner.shutdown.cancel();
        self.inner.executor.close();
    }

    fn read_runs(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, RunEntry>> {
        self.inner
            .runs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_runs(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, RunEntry>> {
        self.inner
            .runs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
