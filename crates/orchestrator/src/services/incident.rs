//! Operator channel for system failures.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use docflow_core::FailureOrigin;
use serde::Serialize;
use uuid::Uuid;

/// A failure an operator should look at: something broke in the
/// orchestrator or its environment rather than in the caller's input.
#[derive(Debug, Clone, Serialize)]
pub struct Incident {
    pub run_id: Uuid,
    pub origin: FailureOrigin,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl Incident {
    pub fn new(run_id: Uuid, origin: FailureOrigin, message: impl Into<String>) -> Self {
        Self {
            run_id,
            origin,
            message: message.into(),
            occurred_at: Utc::now(),
        }
    }
}

pub trait IncidentReporter: Send + Sync {
    fn report(&self, incident: &Incident);
}

/// Writes incidents to the log under the `docflow::incident` target so
/// they can be routed separately.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogIncidentReporter;

impl IncidentReporter for LogIncidentReporter {
    fn report(&self, incident: &Incident) {
        tracing::error!(
            target: "docflow::incident",
            run_id = %incident.run_id,
            origin = %incident.origin,
            "{}",
            incident.message
        );
    }
}

/// Keeps incidents in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryIncidentReporter {
    incidents: Arc<Mutex<Vec<Incident>>>,
}

impl MemoryIncidentReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incidents(&self) -> Vec<Incident> {
        self.incidents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl IncidentReporter for MemoryIncidentReporter {
    fn report(&self, incident: &Incident) {
        self.incidents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(incident.clone());
    }
}
