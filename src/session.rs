//! Session - one user's dataset plus the question routing around it.
//!
//! Each question is handled start to finish before the next one:
//! classify against the role map, then answer through the model or the
//! deterministic path depending on the routing policy. Any failure below
//! the session becomes a plain-text answer, so the session stays usable.

use crate::column_resolver::{ColumnResolver, ColumnRoleMap, SynonymTable};
use crate::config::{RoutingPolicy, SessionConfig};
use crate::dataset::{Dataset, DatasetInfo};
use crate::error::{InsightError, Result};
use crate::fallback::FallbackAnswerer;
use crate::intent::QueryIntent;
use crate::llm::{ModelBackend, ModelReply};
use crate::query_classifier::QueryClassifier;
use crate::visualization::{ChartSpec, VisualizationBuilder};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const EMPTY_QUESTION_MESSAGE: &str = "Please enter a question about your data.";
pub const NO_DATASET_MESSAGE: &str = "Please upload a CSV file first.";

/// Sample rows included in the schema summary sent to the model.
const SCHEMA_SAMPLE_ROWS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerSource {
    Model,
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    pub chart: Option<ChartSpec>,
    pub source: AnswerSource,
    /// Classified intent; absent when the question never reached the classifier
    pub intent: Option<QueryIntent>,
}

impl Answer {
    fn message(text: &str) -> Self {
        Self {
            text: text.to_string(),
            chart: None,
            source: AnswerSource::Fallback,
            intent: None,
        }
    }
}

pub struct Session {
    id: Uuid,
    config: SessionConfig,
    resolver: ColumnResolver,
    classifier: QueryClassifier,
    fallback: FallbackAnswerer,
    builder: VisualizationBuilder,
    backend: Option<Arc<dyn ModelBackend>>,
    dataset: Option<Dataset>,
    roles: ColumnRoleMap,
}

impl Session {
    pub fn new(config: SessionConfig, synonyms: Arc<SynonymTable>, backend: Option<Arc<dyn ModelBackend>>) -> Self {
        let id = Uuid::new_v4();
        info!(
            "Session {} started (routing {:?}, model {})",
            id,
            config.routing,
            backend.as_ref().map(|b| b.name()).unwrap_or("none")
        );

        Self {
            id,
            resolver: ColumnResolver::new(synonyms.clone()),
            classifier: QueryClassifier::new(synonyms),
            fallback: FallbackAnswerer::new(config.preview_rows),
            builder: VisualizationBuilder::new(config.chart_top_n),
            config,
            backend,
            dataset: None,
            roles: ColumnRoleMap::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn dataset(&self) -> Option<&Dataset> {
        self.dataset.as_ref()
    }

    pub fn roles(&self) -> &ColumnRoleMap {
        &self.roles
    }

    /// Replace the current dataset and rebuild the role map.
    pub fn load(&mut self, dataset: Dataset) {
        self.roles = self.resolver.resolve(&dataset.profile().column_names());
        info!(
            "Session {} loaded {} ({} roles resolved)",
            self.id,
            dataset.name(),
            self.roles.len()
        );
        self.dataset = Some(dataset);
    }

    /// Validate and load a CSV file through the upload boundary.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<DatasetInfo> {
        let dataset = Dataset::load_csv(path, self.config.upload)?;
        let info = dataset.info();
        self.load(dataset);
        Ok(info)
    }

    pub fn classify(&self, question: &str) -> Option<QueryIntent> {
        let dataset = self.dataset.as_ref()?;
        Some(self.classifier.classify(question, &self.roles, dataset.profile()))
    }

    pub async fn ask(&self, question: &str) -> Result<Answer> {
        let span = info_span!("ask", session = %self.id);
        self.route(question).instrument(span).await
    }

    async fn route(&self, question: &str) -> Result<Answer> {
        let question = question.trim();
        if question.is_empty() {
            return Ok(Answer::message(EMPTY_QUESTION_MESSAGE));
        }
        let dataset = match &self.dataset {
            Some(dataset) => dataset,
            None => return Ok(Answer::message(NO_DATASET_MESSAGE)),
        };

        let intent = self.classifier.classify(question, &self.roles, dataset.profile());
        info!("Classified question as {}", intent.name());

        match self.config.routing {
            RoutingPolicy::Offline => self.answer_deterministic(intent),
            RoutingPolicy::DeterministicFirst if intent.is_deterministic() => self.answer_deterministic(intent),
            RoutingPolicy::DeterministicFirst | RoutingPolicy::ModelFirst => {
                self.answer_with_model(question, dataset, intent).await
            }
        }
    }

    async fn answer_with_model(&self, question: &str, dataset: &Dataset, intent: QueryIntent) -> Result<Answer> {
        let backend = match &self.backend {
            Some(backend) => backend,
            None => return self.answer_deterministic(intent),
        };

        let summary = dataset.schema_summary(SCHEMA_SAMPLE_ROWS);
        match backend.ask(question, &summary).await {
            Ok(reply) => Ok(self.answer_from_reply(dataset, reply, intent)),
            Err(e) => {
                warn!("Model '{}' failed ({}), answering deterministically", backend.name(), e);
                self.answer_deterministic(intent)
            }
        }
    }

    fn answer_from_reply(&self, dataset: &Dataset, reply: ModelReply, intent: QueryIntent) -> Answer {
        let chart = reply
            .chart_request()
            .and_then(|request| match self.builder.build(dataset, &request) {
                Ok(spec) => Some(spec),
                Err(e) => {
                    warn!("Ignoring chart suggested by the model: {}", e);
                    None
                }
            });

        Answer {
            text: reply.answer,
            chart,
            source: AnswerSource::Model,
            intent: Some(intent),
        }
    }

    /// Answer without the model. Computation and chart failures become the answer text.
    pub fn answer_deterministic(&self, intent: QueryIntent) -> Result<Answer> {
        let dataset = match &self.dataset {
            Some(dataset) => dataset,
            None => return Ok(Answer::message(NO_DATASET_MESSAGE)),
        };

        let outcome = match &intent {
            QueryIntent::Visualize(request) => self
                .builder
                .build(dataset, request)
                .map(|spec| (spec.describe(), Some(spec))),
            _ => self
                .fallback
                .answer(dataset, &self.roles, &intent)
                .map(|text| (text, None)),
        };

        let (text, chart) = match outcome {
            Ok(result) => result,
            Err(e) if e.is_recoverable() => {
                warn!("Deterministic answer failed: {}", e);
                (failure_text(&e), None)
            }
            Err(e) => return Err(e),
        };

        Ok(Answer {
            text,
            chart,
            source: AnswerSource::Fallback,
            intent: Some(intent),
        })
    }
}

fn failure_text(err: &InsightError) -> String {
    match err {
        InsightError::Computation(msg) => format!("I couldn't compute that: {}", msg),
        InsightError::Chart(msg) => format!("I couldn't build that chart: {}", msg),
        other => format!("Something went wrong: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::{ChartKind, VisualizeRequest};
    use async_trait::async_trait;
    use polars::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedModel {
        reply: Option<ModelReply>,
        calls: AtomicUsize,
    }

    impl ScriptedModel {
        fn answering(reply: ModelReply) -> Arc<Self> {
            Arc::new(Self {
                reply: Some(reply),
                calls: AtomicUsize::new(0),
            })
        }

        fn down() -> Arc<Self> {
            Arc::new(Self {
                reply: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelBackend for ScriptedModel {
        async fn ask(&self, _question: &str, schema_summary: &str) -> Result<ModelReply> {
            assert!(schema_summary.starts_with("Columns: "));
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply
                .clone()
                .ok_or_else(|| InsightError::ModelUnavailable("connection refused".to_string()))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn homes() -> Dataset {
        let frame = df! [
            "Region" => ["North", "South", "North", "East"],
            "Price" => [100.0, 200.0, 300.0, 400.0],
            "Bedrooms" => [2i64, 4, 5, 4]
        ]
        .unwrap();
        Dataset::from_frame("homes.csv", frame).unwrap()
    }

    fn session(routing: RoutingPolicy, backend: Option<Arc<dyn ModelBackend>>) -> Session {
        let config = SessionConfig {
            routing,
            ..SessionConfig::default()
        };
        let mut session = Session::new(config, Arc::new(SynonymTable::default()), backend);
        session.load(homes());
        session
    }

    #[tokio::test]
    async fn test_empty_question_and_missing_dataset() {
        let empty = Session::new(SessionConfig::default(), Arc::new(SynonymTable::default()), None);
        assert_eq!(empty.ask("average price").await.unwrap().text, NO_DATASET_MESSAGE);
        assert_eq!(empty.ask("   ").await.unwrap().text, EMPTY_QUESTION_MESSAGE);
    }

    #[tokio::test]
    async fn test_deterministic_first_skips_model_for_aggregates() {
        let model = ScriptedModel::answering(ModelReply::plain("from the model"));
        let session = session(RoutingPolicy::DeterministicFirst, Some(model.clone()));

        let answer = session.ask("What is the average price?").await.unwrap();
        assert_eq!(answer.text, "average Price: 250.00");
        assert_eq!(answer.source, AnswerSource::Fallback);
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_free_form_goes_to_model() {
        let model = ScriptedModel::answering(ModelReply::plain("Looks like housing data."));
        let session = session(RoutingPolicy::DeterministicFirst, Some(model.clone()));

        let answer = session.ask("what is this data about?").await.unwrap();
        assert_eq!(answer.text, "Looks like housing data.");
        assert_eq!(answer.source, AnswerSource::Model);
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_model_down_falls_back_to_overview() {
        let model = ScriptedModel::down();
        let session = session(RoutingPolicy::DeterministicFirst, Some(model.clone()));

        let answer = session.ask("what is this data about?").await.unwrap();
        assert_eq!(answer.source, AnswerSource::Fallback);
        assert!(answer.text.starts_with("homes.csv has 4 rows and 3 columns"));
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_model_first_fallback_matches_direct_answer() {
        let model = ScriptedModel::down();
        let session = session(RoutingPolicy::ModelFirst, Some(model.clone()));
        let question = "how many homes have more than 3 bedrooms?";

        let answer = session.ask(question).await.unwrap();
        let intent = session.classify(question).unwrap();
        let direct = session.answer_deterministic(intent).unwrap();
        assert_eq!(answer.text, direct.text);
        assert!(answer.text.starts_with("3 rows match Bedrooms > 3"));
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_offline_never_calls_model() {
        let model = ScriptedModel::answering(ModelReply::plain("unused"));
        let session = session(RoutingPolicy::Offline, Some(model.clone()));

        session.ask("tell me something interesting").await.unwrap();
        session.ask("average price by region").await.unwrap();
        assert_eq!(model.calls(), 0);
    }

    #[test]
    fn test_chart_errors_become_text() {
        let session = session(RoutingPolicy::Offline, None);
        let intent = QueryIntent::Visualize(VisualizeRequest::new(ChartKind::Bar).with_columns(["Garage"]));
        let answer = session.answer_deterministic(intent).unwrap();
        assert!(answer.chart.is_none());
        assert!(answer.text.starts_with("I couldn't build that chart"));
    }

    #[tokio::test]
    async fn test_bar_chart_answer_carries_spec() {
        let session = session(RoutingPolicy::DeterministicFirst, None);
        let answer = session.ask("show me a bar chart of region").await.unwrap();
        let chart = answer.chart.unwrap();
        assert_eq!(chart.x, "Region");
        assert!(answer.text.starts_with("Here's a bar chart"));
    }

    #[tokio::test]
    async fn test_model_chart_suggestion_is_built() {
        let reply = ModelReply {
            answer: "North has the most listings.".to_string(),
            visualization_needed: true,
            viz_type: Some("pie".to_string()),
            viz_columns: vec!["Region".to_string()],
            viz_title: None,
        };
        let session = session(RoutingPolicy::ModelFirst, Some(ScriptedModel::answering(reply)));

        let answer = session.ask("which region dominates?").await.unwrap();
        assert_eq!(answer.text, "North has the most listings.");
        assert_eq!(answer.chart.unwrap().title, "Pie chart of Region");
    }

    #[tokio::test]
    async fn test_bad_model_chart_keeps_text() {
        let reply = ModelReply {
            answer: "Here you go.".to_string(),
            visualization_needed: true,
            viz_type: Some("bar".to_string()),
            viz_columns: vec!["Garage".to_string()],
            viz_title: None,
        };
        let session = session(RoutingPolicy::ModelFirst, Some(ScriptedModel::answering(reply)));

        let answer = session.ask("garages?").await.unwrap();
        assert_eq!(answer.text, "Here you go.");
        assert!(answer.chart.is_none());
    }

    #[test]
    fn test_load_rebuilds_roles() {
        let mut session = session(RoutingPolicy::Offline, None);
        assert_eq!(session.roles().get(crate::column_resolver::Role::Location), Some("Region"));

        let frame = df! [ "city" => ["A", "B"], "amount" => [1.0, 2.0] ].unwrap();
        session.load(Dataset::from_frame("other.csv", frame).unwrap());
        assert_eq!(session.roles().get(crate::column_resolver::Role::Location), Some("city"));
        assert_eq!(session.dataset().unwrap().name(), "other.csv");
    }
}
