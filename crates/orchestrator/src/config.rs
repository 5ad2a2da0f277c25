use std::time::Duration;

use docflow_core::{StageName, Taxonomy};
use sandbox::{SandboxLimits, SandboxSettings};
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const PRO_MODEL: &str = "google/gemini-2.5-pro";
const FLASH_MODEL: &str = "google/gemini-2.5-flash";

/// Exponential backoff for transient stage failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per stage, including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff_ms = initial.as_millis() as u64;
        self.max_backoff_ms = max.as_millis() as u64;
        self
    }

    /// Delay before attempt `attempt + 1`, where `attempt` is the number of
    /// attempts already made (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        Duration::from_millis((delay as u64).min(self.max_backoff_ms))
    }
}

/// How long finished runs stay queryable. Live runs are never evicted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Finished runs kept at most; the oldest finished go first.
    pub max_finished_runs: usize,
    /// Finished runs older than this are dropped. `None` keeps them until
    /// the count limit pushes them out.
    pub finished_ttl_secs: Option<u64>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_finished_runs: 100,
            finished_ttl_secs: Some(3600),
        }
    }
}

impl RetentionPolicy {
    pub fn new(max_finished_runs: usize) -> Self {
        Self {
            max_finished_runs,
            finished_ttl_secs: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.finished_ttl_secs = Some(ttl.as_secs());
        self
    }

    pub fn finished_ttl(&self) -> Option<Duration> {
        self.finished_ttl_secs.map(Duration::from_secs)
    }
}

/// Generation service settings. The API key is never serialized; it comes
/// from the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub base_url: String,
    pub coordinator_model: String,
    pub prompt_engineer_model: String,
    pub extractor_model: String,
    pub arranger_model: String,
    pub code_generator_model: String,
    pub request_timeout_ms: u64,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            coordinator_model: PRO_MODEL.to_string(),
            prompt_engineer_model: PRO_MODEL.to_string(),
            extractor_model: PRO_MODEL.to_string(),
            arranger_model: PRO_MODEL.to_string(),
            code_generator_model: FLASH_MODEL.to_string(),
            request_timeout_ms: 120_000,
            temperature: Some(0.1),
            max_tokens: None,
            api_key: None,
        }
    }
}

impl GenerationConfig {
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn model_for(&self, stage: StageName) -> &str {
        match stage {
            StageName::Coordinator => &self.coordinator_model,
            StageName::PromptEngineer => &self.prompt_engineer_model,
            StageName::DataExtractor => &self.extractor_model,
            StageName::DataArranger => &self.arranger_model,
            StageName::CodeGenerator => &self.code_generator_model,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Everything the orchestrator needs, read once at start-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub retry: RetryPolicy,
    pub retention: RetentionPolicy,
    /// Per-attempt timeout of one stage.
    pub stage_timeout_ms: u64,
    /// Outer timeout of a whole run; expiry cancels the run.
    pub run_timeout_ms: u64,
    pub max_concurrent_runs: usize,
    pub max_sandbox_workers: usize,
    pub max_document_bytes: u64,
    /// Document text sent to the generation service is cut at this length.
    pub max_prompt_chars: usize,
    /// How often a failing artifact is sent back to the code generator.
    pub repair_attempts: u32,
    /// Per-run event history kept for late subscribers.
    pub event_buffer: usize,
    pub report_prefix: String,
    pub report_extension: String,
    pub taxonomy: Taxonomy,
    pub generation: GenerationConfig,
    pub limits: SandboxLimits,
    pub sandbox: SandboxSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            retention: RetentionPolicy::default(),
            stage_timeout_ms: 180_000,
            run_timeout_ms: 900_000,
            max_concurrent_runs: 4,
            max_sandbox_workers: 2,
            max_document_bytes: 50 * 1024 * 1024,
            max_prompt_chars: 200_000,
            repair_attempts: 1,
            event_buffer: 256,
            report_prefix: "Financial_Report".to_string(),
            report_extension: "xlsx".to_string(),
            taxonomy: Taxonomy::default(),
            generation: GenerationConfig::default(),
            limits: SandboxLimits::default(),
            sandbox: SandboxSettings::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_concurrent_runs(mut self, max: usize) -> Self {
        self.max_concurrent_runs = max;
        self
    }

    pub fn with_max_sandbox_workers(mut self, max: usize) -> Self {
        self.max_sandbox_workers = max;
        self
    }

    pub fn with_max_document_bytes(mut self, max: u64) -> Self {
        self.max_document_bytes = max;
        self
    }

    pub fn with_repair_attempts(mut self, attempts: u32) -> Self {
        self.repair_attempts = attempts;
        self
    }

    pub fn with_event_buffer(mut self, buffer: usize) -> Self {
        self.event_buffer = buffer;
        self
    }

    pub fn with_taxonomy(mut self, taxonomy: Taxonomy) -> Self {
        self.taxonomy = taxonomy;
        self
    }

    pub fn with_generation(mut self, generation: GenerationConfig) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxSettings) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| OrchestratorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(OrchestratorError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_runs == 0 || self.max_sandbox_workers == 0 {
            return Err(OrchestratorError::Config(
                "concurrency limits must be at least 1".to_string(),
            ));
        }
        if self.stage_timeout_ms == 0 || self.run_timeout_ms == 0 {
            return Err(OrchestratorError::Config("timeouts must be positive".to_string()));
        }
        if self.report_prefix.trim().is_empty()
            || !docflow_core::is_plain_file_name(&self.report_prefix)
        {
            return Err(OrchestratorError::Config(format!(
                "report_prefix '{}' is not a plain file name",
                self.report_prefix
            )));
        }
        self.taxonomy.validate()?;
        Ok(())
    }
}
