//! LLM Bridge - forwards free-form questions to a locally hosted model.
//!
//! The model server speaks the Ollama `/api/generate` protocol. Every transport
//! failure (refused connection, timeout, error status) surfaces as
//! `InsightError::ModelUnavailable` so the session can fall back to the
//! deterministic path. There are no retries.

use crate::config::LlmConfig;
use crate::error::{InsightError, Result};
use crate::intent::{ChartKind, VisualizeRequest};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Structured reply the prompt asks the model for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelReply {
    pub answer: String,
    #[serde(default)]
    pub visualization_needed: bool,
    #[serde(default)]
    pub viz_type: Option<String>,
    #[serde(default)]
    pub viz_columns: Vec<String>,
    #[serde(default)]
    pub viz_title: Option<String>,
}

impl ModelReply {
    pub fn plain(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            visualization_needed: false,
            viz_type: None,
            viz_columns: Vec::new(),
            viz_title: None,
        }
    }

    /// Parse the outermost `{...}` of the model output; anything else is kept verbatim.
    pub fn from_text(raw: &str) -> Self {
        let trimmed = raw.trim();
        let json = match (trimmed.find('{'), trimmed.rfind('}')) {
            (Some(start), Some(end)) if end > start => &trimmed[start..=end],
            _ => return Self::plain(trimmed),
        };

        match serde_json::from_str::<ModelReply>(json) {
            Ok(reply) => reply,
            Err(e) => {
                debug!("Model reply is not structured JSON ({}), using raw text", e);
                Self::plain(trimmed)
            }
        }
    }

    /// The chart the model suggested, if it asked for one with a known type.
    pub fn chart_request(&self) -> Option<VisualizeRequest> {
        if !self.visualization_needed {
            return None;
        }
        let kind = self.viz_type.as_deref().and_then(ChartKind::parse)?;
        let mut request = VisualizeRequest::new(kind).with_columns(self.viz_columns.iter().cloned());
        request.title = self.viz_title.clone().filter(|t| !t.trim().is_empty());
        Some(request)
    }
}

/// Anything that can answer a question given a schema summary.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn ask(&self, question: &str, schema_summary: &str) -> Result<ModelReply>;

    fn name(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_ctx: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    error: Option<String>,
}

pub struct OllamaBridge {
    client: reqwest::Client,
    config: LlmConfig,
}

impl OllamaBridge {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| InsightError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    fn build_prompt(question: &str, schema_summary: &str) -> String {
        format!(
            r#"You are a data analysis assistant. You have access to a CSV file:
{}

Answer questions about the data briefly and precisely, and suggest a visualization when it helps.

Question: {}

Respond with JSON only:
{{"answer": "brief answer", "visualization_needed": true|false, "viz_type": "bar|line|scatter|pie|count|histogram", "viz_columns": ["column"], "viz_title": "title"}}"#,
            schema_summary, question
        )
    }

    fn unavailable(&self, err: reqwest::Error) -> InsightError {
        if err.is_timeout() {
            InsightError::ModelUnavailable(format!(
                "model did not answer within {}s",
                self.config.timeout.as_secs_f32()
            ))
        } else if err.is_connect() {
            InsightError::ModelUnavailable(format!("model server not reachable at {}", self.config.base_url))
        } else {
            InsightError::ModelUnavailable(err.to_string())
        }
    }
}

#[async_trait]
impl ModelBackend for OllamaBridge {
    async fn ask(&self, question: &str, schema_summary: &str) -> Result<ModelReply> {
        let url = self.config.generate_url();
        let request = GenerateRequest {
            model: &self.config.model,
            prompt: Self::build_prompt(question, schema_summary),
            stream: false,
            options: GenerateOptions {
                temperature: self.config.temperature,
                num_ctx: self.config.num_ctx,
            },
        };

        info!("Asking model '{}' at {}", self.config.model, url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Model server returned {}: {}", status, body);
            return Err(InsightError::ModelUnavailable(format!("model server returned {}", status)));
        }

        let body: GenerateResponse = response.json().await.map_err(|e| self.unavailable(e))?;
        if let Some(error) = body.error {
            return Err(InsightError::ModelUnavailable(error));
        }

        Ok(ModelReply::from_text(&body.response))
    }

    fn name(&self) -> &str {
        &self.config.model
    }
}
