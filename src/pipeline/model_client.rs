//! Model boundary for delegated steps.
//!
//! The pipeline never depends on a concrete server: steps hand a prompt to
//! a `ModelClient` and validate whatever text comes back. `OllamaModelClient`
//! talks to an Ollama-compatible `/api/generate`; `MockModelClient` scripts
//! responses for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ModelConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Cannot reach model server at {0}")]
    Connection(String),
    #[error("Model request timed out")]
    Timeout,
    #[error("HTTP client error: {0}")]
    HttpClient(String),
    /// Upstream bodies are dropped: they may echo the prompt.
    #[error("Model server returned status {status}")]
    Upstream { status: u16 },
    #[error("Failed to parse model response: {0}")]
    ResponseParsing(String),
}

impl ModelError {
    /// Stable code for trace events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection(_) => "MODEL_UNREACHABLE",
            Self::Timeout => "MODEL_TIMEOUT",
            Self::HttpClient(_) => "MODEL_HTTP_ERROR",
            Self::Upstream { .. } => "MODEL_UPSTREAM_ERROR",
            Self::ResponseParsing(_) => "MODEL_BAD_RESPONSE",
        }
    }
}

/// Blocking text-generation boundary. Callers run it on a blocking thread.
pub trait ModelClient: Send + Sync {
    fn generate(&self, prompt: &str, system: &str) -> Result<String, ModelError>;

    /// Model name recorded in logs.
    fn model_name(&self) -> &str;
}

// ═══════════════════════════════════════════════════════════
// Ollama-compatible HTTP client
// ═══════════════════════════════════════════════════════════

pub struct OllamaModelClient {
    base_url: String,
    model: String,
    client: reqwest::blocking::Client,
}

impl OllamaModelClient {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self, ModelError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ModelError::HttpClient(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
        })
    }

    /// Build from configuration; `None` when no model URL is configured.
    pub fn from_config(config: &ModelConfig) -> Result<Option<Self>, ModelError> {
        config
            .url
            .as_deref()
            .map(|url| Self::new(url, &config.model, config.timeout))
            .transpose()
    }
}

/// Request body for /api/generate
#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
}

/// Response body from /api/generate
#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl ModelClient for OllamaModelClient {
    fn generate(&self, prompt: &str, system: &str) -> Result<String, ModelError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            system,
            stream: false,
        };

        let response = self.client.post(&url).json(&body).send().map_err(|e| {
            if e.is_connect() {
                ModelError::Connection(self.base_url.clone())
            } else if e.is_timeout() {
                ModelError::Timeout
            } else {
                ModelError::HttpClient(e.without_url().to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ModelError::Upstream {
                status: status.as_u16(),
            });
        }

        let parsed: GenerateResponse = response
            .json()
            .map_err(|e| ModelError::ResponseParsing(e.without_url().to_string()))?;

        Ok(parsed.response)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ═══════════════════════════════════════════════════════════
// Mock client
// ═══════════════════════════════════════════════════════════

/// Scripted model client: always answers with the same outcome, optionally
/// after a delay.
pub struct MockModelClient {
    outcome: Result<String, ModelError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockModelClient {
    pub fn new(response: &str) -> Self {
        Self {
            outcome: Ok(response.to_string()),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: ModelError) -> Self {
        Self {
            outcome: Err(error),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ModelClient for MockModelClient {
    fn generate(&self, _prompt: &str, _system: &str) -> Result<String, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.outcome.clone()
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

/// Slice the first `{` .. last `}` out of a model answer and parse it.
pub fn parse_first_json_object(raw: &str) -> Option<serde_json::Value> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&raw[start..=end]).ok()
}
