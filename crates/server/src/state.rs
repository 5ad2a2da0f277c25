use std::time::Duration;

use orchestrator::Orchestrator;

/// Interval between SSE keep-alive comments.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub keep_alive: Duration,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            keep_alive: DEFAULT_KEEP_ALIVE,
        }
    }

    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = interval;
        self
    }

    /// Largest request body accepted on upload. Slightly above the document
    /// limit so oversized documents reach ingestion and get a proper error.
    pub fn max_body_bytes(&self) -> usize {
        let limit = self.orchestrator.config().max_document_bytes;
        usize::try_from(limit.saturating_add(64 * 1024)).unwrap_or(usize::MAX)
    }
}
