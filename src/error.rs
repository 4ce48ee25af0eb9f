use thiserror::Error;

#[derive(Error, Debug)]
pub enum InsightError {
    #[error("Upload rejected: {0}")]
    Upload(String),

    #[error("Computation error: {0}")]
    Computation(String),

    #[error("Chart error: {0}")]
    Chart(String),

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Polars error: {0}")]
    Polars(String),
}

impl InsightError {
    /// Every error leaves the session usable for the next question.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, InsightError::Config(_))
    }

    /// Errors that should send the caller down the deterministic path.
    pub fn is_model_unavailable(&self) -> bool {
        matches!(self, InsightError::ModelUnavailable(_))
    }
}

impl From<polars::error::PolarsError> for InsightError {
    fn from(err: polars::error::PolarsError) -> Self {
        InsightError::Polars(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, InsightError>;
