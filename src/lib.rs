pub mod column_resolver;
pub mod config;
pub mod dataset;
pub mod error;
pub mod fallback;
pub mod intent;
pub mod llm;
pub mod operators;
pub mod query_classifier;
pub mod session;
pub mod visualization;

pub use error::{InsightError, Result};
pub use session::{Answer, AnswerSource, Session};
