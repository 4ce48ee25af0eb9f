//! Classified query intents, created per question and consumed immediately.

use crate::operators::{Predicate, Reduction};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Bar,
    Line,
    Scatter,
    Pie,
    Count,
    Histogram,
}

impl ChartKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChartKind::Bar => "bar",
            ChartKind::Line => "line",
            ChartKind::Scatter => "scatter",
            ChartKind::Pie => "pie",
            ChartKind::Count => "count",
            ChartKind::Histogram => "histogram",
        }
    }

    /// Lenient parse for chart types suggested by the model.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim().to_lowercase();
        match name.as_str() {
            "bar" | "bar chart" | "column" => Some(ChartKind::Bar),
            "line" | "line chart" | "area" => Some(ChartKind::Line),
            "scatter" | "scatter plot" | "scatterplot" => Some(ChartKind::Scatter),
            "pie" | "pie chart" | "donut" => Some(ChartKind::Pie),
            "count" | "countplot" => Some(ChartKind::Count),
            "histogram" | "hist" => Some(ChartKind::Histogram),
            _ => None,
        }
    }
}

impl fmt::Display for ChartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateOp {
    Average,
    Sum,
    Max,
    Min,
    Correlation,
    /// Row count, per group when a group column is given
    Count,
}

impl AggregateOp {
    /// The single-column reduction behind this op; correlation needs two columns.
    pub fn reduction(self) -> Option<Reduction> {
        match self {
            AggregateOp::Average => Some(Reduction::Mean),
            AggregateOp::Sum => Some(Reduction::Sum),
            AggregateOp::Max => Some(Reduction::Max),
            AggregateOp::Min => Some(Reduction::Min),
            AggregateOp::Count => Some(Reduction::Count),
            AggregateOp::Correlation => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AggregateOp::Average => "average",
            AggregateOp::Sum => "sum",
            AggregateOp::Max => "maximum",
            AggregateOp::Min => "minimum",
            AggregateOp::Correlation => "correlation",
            AggregateOp::Count => "count",
        }
    }
}

impl fmt::Display for AggregateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualizeRequest {
    pub kind: ChartKind,
    /// Columns named in the question, in order of appearance
    pub columns: Vec<String>,
    /// Column introduced by "by"/"per"; preferred as the x axis
    #[serde(default)]
    pub x: Option<String>,
    /// Reduction requested alongside the chart ("bar chart of average price")
    pub aggregate: Option<AggregateOp>,
    pub filters: Vec<Predicate>,
    pub title: Option<String>,
}

impl VisualizeRequest {
    pub fn new(kind: ChartKind) -> Self {
        Self {
            kind,
            columns: Vec::new(),
            x: None,
            aggregate: None,
            filters: Vec::new(),
            title: None,
        }
    }

    pub fn with_columns(mut self, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_x(mut self, column: impl Into<String>) -> Self {
        self.x = Some(column.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRequest {
    pub op: AggregateOp,
    pub column: Option<String>,
    /// Second column for correlation
    pub other: Option<String>,
    pub group_by: Option<String>,
    pub filters: Vec<Predicate>,
}

impl AggregateRequest {
    pub fn new(op: AggregateOp, column: impl Into<String>) -> Self {
        Self {
            op,
            column: Some(column.into()),
            other: None,
            group_by: None,
            filters: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum QueryIntent {
    Visualize(VisualizeRequest),
    Aggregate(AggregateRequest),
    Filter { predicates: Vec<Predicate> },
    FreeForm { text: String },
}

impl QueryIntent {
    pub fn name(&self) -> &'static str {
        match self {
            QueryIntent::Visualize(_) => "visualize",
            QueryIntent::Aggregate(_) => "aggregate",
            QueryIntent::Filter { .. } => "filter",
            QueryIntent::FreeForm { .. } => "free_form",
        }
    }

    /// Whether the fallback path can answer this intent without a model.
    pub fn is_deterministic(&self) -> bool {
        !matches!(self, QueryIntent::FreeForm { .. })
    }
}
