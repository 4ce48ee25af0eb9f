//! Runtime configuration for the model endpoint and the query session.

use std::time::Duration;

pub const DEFAULT_MODEL_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "mistral";
pub const DEFAULT_MODEL_TIMEOUT_SECS: u64 = 30;

/// Upload ceiling in bytes (25 MB).
pub const MAX_UPLOAD_BYTES: u64 = 25 * 1024 * 1024;

/// Settings for the local model endpoint.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Base URL of the model server, without the `/api/generate` suffix
    pub base_url: String,
    pub model: String,
    /// Upper bound for a single request, connect included
    pub timeout: Duration,
    pub temperature: f32,
    /// Context window passed as `num_ctx`
    pub num_ctx: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_MODEL_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(DEFAULT_MODEL_TIMEOUT_SECS),
            temperature: 0.5,
            num_ctx: 2048,
        }
    }
}

impl LlmConfig {
    /// Read overrides from the environment (a `.env` file is loaded by the binary).
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let base_url = std::env::var("CSV_INSIGHT_MODEL_URL").unwrap_or(defaults.base_url);
        let model = std::env::var("CSV_INSIGHT_MODEL").unwrap_or(defaults.model);
        let timeout = std::env::var("CSV_INSIGHT_MODEL_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout);

        Self {
            base_url,
            model,
            timeout,
            ..defaults
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url.trim_end_matches('/'))
    }
}

/// How a session decides between the model and the deterministic path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingPolicy {
    /// Computable intents are answered locally; only free-form questions reach the model.
    #[default]
    DeterministicFirst,
    /// Every question goes to the model; the classified intent is the fallback.
    ModelFirst,
    /// Never contact the model.
    Offline,
}

/// Limits applied at the upload boundary.
#[derive(Debug, Clone, Copy)]
pub struct UploadLimits {
    pub max_bytes: u64,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_bytes: MAX_UPLOAD_BYTES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub routing: RoutingPolicy,
    /// Categories kept before the tail is folded into "Other"
    pub chart_top_n: usize,
    /// Rows shown in filter previews and the data preview
    pub preview_rows: usize,
    pub upload: UploadLimits,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            routing: RoutingPolicy::default(),
            chart_top_n: 15,
            preview_rows: 10,
            upload: UploadLimits::default(),
        }
    }
}
