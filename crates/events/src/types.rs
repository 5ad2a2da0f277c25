//! Progress event types

use chrono::{DateTime, Utc};
use docflow_core::{FailureKind, RunStatus, StageName};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use utoipa::ToSchema;
use uuid::Uuid;

/// Who emitted an event. Serialized as a bare string: a stage name,
/// `sandbox` or `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSource {
    Stage(StageName),
    Sandbox,
    Run,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stage(stage) => stage.as_str(),
            Self::Sandbox => "sandbox",
            Self::Run => "run",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sandbox" => Some(Self::Sandbox),
            "run" => Some(Self::Run),
            other => StageName::parse(other).map(Self::Stage),
        }
    }
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown event source '{}'", raw)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Started,
    Progress,
    Completed,
    Failed {
        failure: FailureKind,
    },
    /// Stands in for `missed` events that were evicted from the buffer or
    /// overrun by a slow subscriber.
    Dropped {
        missed: u64,
    },
    /// Last event of a run.
    Terminal {
        status: RunStatus,
    },
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Progress => "progress",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::Dropped { .. } => "dropped",
            Self::Terminal { .. } => "terminal",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal { .. })
    }
}

/// One ordered notification about a run.
///
/// `sequence` starts at 1 and increases by exactly one per event within a
/// run. A `dropped` marker carries the sequence number of the last event it
/// replaces, so a consumer always sees a contiguous sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ProgressEvent {
    pub run_id: Uuid,
    pub sequence: u64,
    #[schema(value_type = String, example = "data_extractor")]
    pub source: EventSource,
    pub kind: EventKind,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(run_id: Uuid, sequence: u64, source: EventSource, kind: EventKind) -> Self {
        Self {
            run_id,
            sequence,
            source,
            kind,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub(crate) fn dropped(run_id: Uuid, sequence: u64, missed: u64) -> Self {
        Self::new(run_id, sequence, EventSource::Run, EventKind::Dropped { missed }).with_message(
            format!("{} event(s) were dropped before delivery", missed),
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    /// SSE event name, e.g. `data_extractor.started`.
    pub fn event_name(&self) -> String {
        format!("{}.{}", self.source, self.kind.as_str())
    }
}
