//! Client for the external text generation service.
//!
//! Speaks the OpenAI-compatible chat completions protocol (OpenRouter by
//! default). The client makes exactly one request per call; retrying is
//! the run driver's business, driven by [`GenerationError::kind`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use docflow_core::{FailureKind, StageError, StageName};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::config::GenerationConfig;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GenerationError {
    #[error("Generation request timed out")]
    Timeout,

    #[error("Rate limited by generation service")]
    RateLimited { retry_after: Option<u64> },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Generation service error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("No API key configured")]
    MissingApiKey,
}

impl GenerationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout | Self::RateLimited { .. } | Self::Transport(_) | Self::Server { .. } => {
                FailureKind::Transient
            }
            Self::Unauthorized(_) | Self::Rejected { .. } | Self::MissingApiKey => {
                FailureKind::Permanent
            }
            Self::InvalidResponse(_) => FailureKind::Validation,
        }
    }
}

impl From<GenerationError> for StageError {
    fn from(err: GenerationError) -> Self {
        StageError::new(err.kind(), err.to_string())
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// One prompt for one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub stage: StageName,
    pub model: String,
    pub system: String,
    pub prompt: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl GenerationRequest {
    pub fn new(
        stage: StageName,
        model: impl Into<String>,
        system: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            model: model.into(),
            system: system.into(),
            prompt: prompt.into(),
            temperature: None,
            max_tokens: None,
        }
    }

    /// Apply the sampling settings from configuration.
    pub fn with_settings(mut self, config: &GenerationConfig) -> Self {
        self.temperature = config.temperature;
        self.max_tokens = config.max_tokens;
        self
    }
}

#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Send one prompt, return the text of the first completion.
    async fn complete(&self, request: GenerationRequest) -> Result<String, GenerationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: Role,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    error: ServiceErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ServiceErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
}

/// Chat completions over HTTP.
#[derive(Clone)]
pub struct HttpGenerationClient {
    client: Client,
    api_key: Option<String>,
    base_url: String,
}

impl HttpGenerationClient {
    pub fn new(config: &GenerationConfig) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GenerationError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn classify(status: StatusCode, retry_after: Option<u64>, body: &str) -> GenerationError {
        let message = match serde_json::from_str::<ServiceError>(body) {
            Ok(parsed) => {
                error!(
                    status = status.as_u16(),
                    error_type = ?parsed.error.error_type,
                    "Generation service error: {}",
                    parsed.error.message
                );
                parsed.error.message
            }
            Err(_) => body.trim().to_string(),
        };
        match status.as_u16() {
            429 => {
                warn!("Rate limited by generation service");
                GenerationError::RateLimited { retry_after }
            }
            401 | 403 => GenerationError::Unauthorized(message),
            408 => GenerationError::Timeout,
            code if code >= 500 => GenerationError::Server {
                status: code,
                message,
            },
            code => GenerationError::Rejected {
                status: code,
                message,
            },
        }
    }
}

#[async_trait]
impl GenerationClient for HttpGenerationClient {
    async fn complete(&self, request: GenerationRequest) -> Result<String, GenerationError> {
        let api_key = self.api_key.as_deref().ok_or(GenerationError::MissingApiKey)?;
        debug!(
            stage = %request.stage,
            model = %request.model,
            prompt_chars = request.prompt.len(),
            "Creating chat completion"
        );

        let body = ChatCompletionRequest {
            model: &request.model,
            messages: vec![
                ChatMessage {
                    role: Role::System,
                    content: request.system,
                },
                ChatMessage {
                    role: Role::User,
                    content: request.prompt,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            let text = response.text().await.unwrap_or_default();
            return Err(Self::classify(status, retry_after, &text));
        }

        let text = response.text().await?;
        let parsed: ChatCompletionResponse = serde_json::from_str(&text)
            .map_err(|e| GenerationError::InvalidResponse(format!("malformed completion: {}", e)))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| GenerationError::InvalidResponse("no completion returned".to_string()))?;
        if content.trim().is_empty() {
            return Err(GenerationError::InvalidResponse(
                "empty completion returned".to_string(),
            ));
        }
        Ok(content)
    }
}

type ReplyFn = Arc<dyn Fn(&GenerationRequest) -> String + Send + Sync>;

/// A canned reply for [`ScriptedGenerationClient`].
#[derive(Clone)]
pub enum ScriptedReply {
    Text(String),
    /// Reply computed from the request, e.g. to echo a file name back.
    Generate(ReplyFn),
    Error(GenerationError),
    /// Never answers; only a timeout or cancellation ends the call.
    Hang,
}

impl ScriptedReply {
    pub fn generate<F>(f: F) -> Self
    where
        F: Fn(&GenerationRequest) -> String + Send + Sync + 'static,
    {
        Self::Generate(Arc::new(f))
    }
}

impl std::fmt::Debug for ScriptedReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Generate(_) => f.write_str("Generate(..)"),
            Self::Error(err) => f.debug_tuple("Error").field(err).finish(),
            Self::Hang => f.write_str("Hang"),
        }
    }
}

/// In-memory generation client that replays scripted replies per stage.
///
/// Replies are consumed in order; once a stage has a single reply left it
/// is repeated for every further call. Used for tests and offline dry runs.
#[derive(Clone, Default)]
pub struct ScriptedGenerationClient {
    replies: Arc<Mutex<HashMap<StageName, VecDeque<ScriptedReply>>>>,
    calls: Arc<Mutex<Vec<GenerationRequest>>>,
}

impl ScriptedGenerationClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(self, stage: StageName, reply: ScriptedReply) -> Self {
        self.replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(stage)
            .or_default()
            .push_back(reply);
        self
    }

    pub fn with_text(self, stage: StageName, text: impl Into<String>) -> Self {
        self.with_reply(stage, ScriptedReply::Text(text.into()))
    }

    pub fn with_error(self, stage: StageName, error: GenerationError) -> Self {
        self.with_reply(stage, ScriptedReply::Error(error))
    }

    /// Every request seen so far, in call order.
    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn call_count(&self, stage: StageName) -> usize {
        self.calls().iter().filter(|c| c.stage == stage).count()
    }

    fn next_reply(&self, stage: StageName) -> Option<ScriptedReply> {
        let mut replies = self
            .replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let queue = replies.get_mut(&stage)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl GenerationClient for ScriptedGenerationClient {
    async fn complete(&self, request: GenerationRequest) -> Result<String, GenerationError> {
        let stage = request.stage;
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());
        match self.next_reply(stage) {
            Some(ScriptedReply::Text(text)) => Ok(text),
            Some(ScriptedReply::Generate(f)) => Ok(f(&request)),
            Some(ScriptedReply::Error(err)) => Err(err),
            Some(ScriptedReply::Hang) => std::future::pending().await,
            None => Err(GenerationError::Rejected {
                status: 400,
                message: format!("no scripted reply for {}", stage),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(GenerationError::Timeout.kind(), FailureKind::Transient);
        assert_eq!(
            GenerationError::RateLimited { retry_after: None }.kind(),
            FailureKind::Transient
        );
        assert_eq!(
            GenerationError::Server {
                status: 502,
                message: String::new()
            }
            .kind(),
            FailureKind::Transient
        );
        assert_eq!(
            GenerationError::Unauthorized("bad key".into()).kind(),
            FailureKind::Permanent
        );
        assert_eq!(
            GenerationError::InvalidResponse("garbage".into()).kind(),
            FailureKind::Validation
        );
    }

    #[test]
    fn test_classify_status_codes() {
        let body = r#"{"error": {"message": "model not found", "type": "invalid_request"}}"#;
        assert_eq!(
            HttpGenerationClient::classify(StatusCode::BAD_REQUEST, None, body),
            GenerationError::Rejected {
                status: 400,
                message: "model not found".into()
            }
        );
        assert_eq!(
            HttpGenerationClient::classify(StatusCode::TOO_MANY_REQUESTS, Some(3), ""),
            GenerationError::RateLimited {
                retry_after: Some(3)
            }
        );
        assert!(matches!(
            HttpGenerationClient::classify(StatusCode::UNAUTHORIZED, None, "nope"),
            GenerationError::Unauthorized(_)
        ));
        assert!(matches!(
            HttpGenerationClient::classify(StatusCode::BAD_GATEWAY, None, "upstream"),
            GenerationError::Server { status: 502, .. }
        ));
    }

    #[tokio::test]
    async fn test_scripted_replies_repeat_last() {
        let client = ScriptedGenerationClient::new()
            .with_error(StageName::DataExtractor, GenerationError::Timeout)
            .with_text(StageName::DataExtractor, "ok");
        let request = GenerationRequest::new(StageName::DataExtractor, "m", "s", "p");

        assert_eq!(
            client.complete(request.clone()).await,
            Err(GenerationError::Timeout)
        );
        assert_eq!(client.complete(request.clone()).await.unwrap(), "ok");
        assert_eq!(client.complete(request).await.unwrap(), "ok");
        assert_eq!(client.call_count(StageName::DataExtractor), 3);
    }

    #[tokio::test]
    async fn test_missing_api_key_is_permanent() {
        let client = HttpGenerationClient::new(&GenerationConfig::default()).unwrap();
        let err = client
            .complete(GenerationRequest::new(StageName::DataExtractor, "m", "s", "p"))
            .await
            .unwrap_err();
        assert_eq!(err, GenerationError::MissingApiKey);
        assert_eq!(err.kind(), FailureKind::Permanent);
    }
}
