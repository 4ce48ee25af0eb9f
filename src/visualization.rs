//! Visualization Builder - turns a visualize intent into a chart specification
//!
//! The builder resolves the x/y columns against the dataset, computes the
//! plotted values and applies legibility defaults:
//! - bar, pie and count charts keep the `top_n` largest categories and fold
//!   the rest into an "Other" slice
//! - a bar/line/pie chart without a numeric y column plots row counts per category
//! - scatter plots need two numeric columns
//! - histograms bin one numeric column into equal-width ranges
//!
//! Rendering is left to whoever consumes the serialized `ChartSpec`.

use crate::dataset::{ColumnKind, Dataset};
use crate::error::{InsightError, Result};
use crate::intent::{AggregateOp, ChartKind, VisualizeRequest};
use crate::operators::{self, format_number, Reduction};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info};

pub const OTHER_LABEL: &str = "Other";

/// Equal-width bins used for histograms.
pub const HISTOGRAM_BINS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryPoint {
    pub label: String,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct XyPoint {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "points", rename_all = "snake_case")]
pub enum ChartData {
    Categories(Vec<CategoryPoint>),
    Points(Vec<XyPoint>),
}

impl ChartData {
    pub fn len(&self) -> usize {
        match self {
            ChartData::Categories(points) => points.len(),
            ChartData::Points(points) => points.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSpec {
    pub kind: ChartKind,
    pub x: String,
    pub y: Option<String>,
    /// Column whose values label the bars or slices
    pub category: Option<String>,
    /// How y values are combined per category; `None` for raw scatter points
    pub aggregation: Option<Reduction>,
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    pub top_n: Option<usize>,
    pub data: ChartData,
}

impl ChartSpec {
    /// Short textual companion for the chart.
    pub fn describe(&self) -> String {
        let mut text = match &self.y {
            Some(y) => format!("Here's a {} chart visualizing {} vs {}.", self.kind, self.x, y),
            None => format!("Here's a {} chart visualizing the distribution of {}.", self.kind, self.x),
        };

        if let ChartData::Categories(points) = &self.data {
            for point in points.iter().take(5) {
                text.push_str(&format!("\n- {}: {}", point.label, format_value(point.value)));
            }
            if points.len() > 5 {
                text.push_str(&format!("\n... and {} more", points.len() - 5));
            }
        }
        text
    }
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 {
        format_number(value)
    } else {
        format!("{:.2}", value)
    }
}

/// Consumer of finished chart specifications.
pub trait ChartRenderer {
    fn render(&self, spec: &ChartSpec) -> Result<()>;
}

/// Writes the chart specification as pretty JSON for an external renderer.
pub struct JsonChartWriter {
    path: PathBuf,
}

impl JsonChartWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ChartRenderer for JsonChartWriter {
    fn render(&self, spec: &ChartSpec) -> Result<()> {
        let content = serde_json::to_string_pretty(spec)?;
        std::fs::write(&self.path, content)?;
        info!("Wrote {} chart to {}", spec.kind, self.path.display());
        Ok(())
    }
}

pub struct VisualizationBuilder {
    top_n: usize,
}

impl Default for VisualizationBuilder {
    fn default() -> Self {
        Self { top_n: 15 }
    }
}

impl VisualizationBuilder {
    pub fn new(top_n: usize) -> Self {
        Self { top_n: top_n.max(1) }
    }

    pub fn build(&self, dataset: &Dataset, request: &VisualizeRequest) -> Result<ChartSpec> {
        for column in request.columns.iter().chain(request.x.iter()) {
            if !dataset.profile().contains(column) {
                return Err(InsightError::Chart(format!(
                    "Column '{}' not found in the dataset",
                    column
                )));
            }
        }

        let filtered;
        let data_source = if request.filters.is_empty() {
            dataset
        } else {
            filtered = dataset
                .filtered(&request.filters)
                .map_err(|e| InsightError::Chart(e.to_string()))?;
            &filtered
        };

        let spec = match request.kind {
            ChartKind::Bar | ChartKind::Pie | ChartKind::Count => self.categorical(data_source, request)?,
            ChartKind::Line => self.line(data_source, request)?,
            ChartKind::Scatter => self.scatter(data_source, request)?,
            ChartKind::Histogram => self.histogram(data_source, request)?,
        };
        debug!("Built {} chart with {} points", spec.kind, spec.data.len());
        Ok(spec)
    }

    fn categorical(&self, dataset: &Dataset, request: &VisualizeRequest) -> Result<ChartSpec> {
        let profile = dataset.profile();
        let x = request
            .x
            .as_ref()
            .or_else(|| {
                request
                    .columns
                    .iter()
                    .find(|c| profile.kind_of(c) == Some(ColumnKind::Text))
            })
            .or_else(|| request.columns.iter().find(|c| profile.is_category_like(c)))
            .map(String::as_str)
            .or_else(|| profile.first_category_like())
            .or_else(|| request.columns.first().map(String::as_str))
            .ok_or_else(|| InsightError::Chart("No category-like column to chart".to_string()))?
            .to_string();

        let y = if request.kind == ChartKind::Count {
            None
        } else {
            numeric_other_than(dataset, request, &x)
        };
        let reduction = match &y {
            Some(_) => reduction_for(request.aggregate).unwrap_or(Reduction::Sum),
            None => Reduction::Count,
        };

        let mut points = to_points(operators::group_reduce(dataset.frame(), &x, y.as_deref(), reduction)?);
        points.sort_by(|a, b| {
            b.value
                .partial_cmp(&a.value)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.label.cmp(&b.label))
        });

        let collapsed = points.len() > self.top_n;
        if collapsed {
            points = self.collapse_tail(dataset, &x, reduction, points)?;
        }

        let y_label = axis_label(y.as_deref(), reduction);
        Ok(ChartSpec {
            kind: request.kind,
            title: request
                .title
                .clone()
                .unwrap_or_else(|| default_title(request.kind, &x, y.as_deref())),
            x_label: x.clone(),
            y_label,
            category: Some(x.clone()),
            x,
            y,
            aggregation: Some(reduction),
            top_n: collapsed.then_some(self.top_n),
            data: ChartData::Categories(points),
        })
    }

    /// Keep the first `top_n` points (already sorted) and fold the rest into "Other".
    fn collapse_tail(
        &self,
        dataset: &Dataset,
        x: &str,
        reduction: Reduction,
        mut points: Vec<CategoryPoint>,
    ) -> Result<Vec<CategoryPoint>> {
        let tail = points.split_off(self.top_n);
        let values = tail.iter().map(|p| p.value);

        let other = match reduction {
            Reduction::Count | Reduction::Sum => values.sum(),
            Reduction::Max => values.fold(f64::MIN, f64::max),
            Reduction::Min => values.fold(f64::MAX, f64::min),
            Reduction::Mean => {
                // weight each group's mean by its row count
                let counts: HashMap<String, f64> =
                    operators::group_reduce(dataset.frame(), x, None, Reduction::Count)?
                        .into_iter()
                        .collect();
                let (total, rows) = tail.iter().fold((0.0, 0.0), |(total, rows), p| {
                    let n = counts.get(&p.label).copied().unwrap_or(0.0);
                    (total + p.value * n, rows + n)
                });
                if rows > 0.0 {
                    total / rows
                } else {
                    0.0
                }
            }
        };

        points.push(CategoryPoint {
            label: OTHER_LABEL.to_string(),
            value: other,
        });
        Ok(points)
    }

    fn line(&self, dataset: &Dataset, request: &VisualizeRequest) -> Result<ChartSpec> {
        let profile = dataset.profile();
        let x = request
            .x
            .as_ref()
            .or_else(|| {
                request
                    .columns
                    .iter()
                    .find(|c| profile.kind_of(c) == Some(ColumnKind::Date))
            })
            .or_else(|| request.columns.first())
            .map(String::as_str)
            .or_else(|| profile.date_columns().first().copied())
            .or_else(|| profile.first_category_like())
            .ok_or_else(|| InsightError::Chart("No column to use for the line chart's x axis".to_string()))?
            .to_string();

        let y = numeric_other_than(dataset, request, &x);
        let reduction = match &y {
            Some(_) => reduction_for(request.aggregate).unwrap_or(Reduction::Mean),
            None => Reduction::Count,
        };

        let mut points = to_points(operators::group_reduce(dataset.frame(), &x, y.as_deref(), reduction)?);
        let all_numeric = points.iter().all(|p| p.label.parse::<f64>().is_ok());
        if all_numeric {
            points.sort_by(|a, b| {
                let a = a.label.parse::<f64>().unwrap_or(f64::NAN);
                let b = b.label.parse::<f64>().unwrap_or(f64::NAN);
                a.partial_cmp(&b).unwrap_or(Ordering::Equal)
            });
        } else {
            points.sort_by(|a, b| a.label.cmp(&b.label));
        }

        Ok(ChartSpec {
            kind: ChartKind::Line,
            title: request
                .title
                .clone()
                .unwrap_or_else(|| default_title(ChartKind::Line, &x, y.as_deref())),
            x_label: x.clone(),
            y_label: axis_label(y.as_deref(), reduction),
            category: None,
            x,
            y,
            aggregation: Some(reduction),
            top_n: None,
            data: ChartData::Categories(points),
        })
    }

    fn scatter(&self, dataset: &Dataset, request: &VisualizeRequest) -> Result<ChartSpec> {
        let profile = dataset.profile();
        let mut axes: Vec<String> = request
            .columns
            .iter()
            .filter(|c| profile.is_numeric(c))
            .cloned()
            .collect();
        for column in profile.numeric_columns() {
            if axes.len() >= 2 {
                break;
            }
            if !axes.iter().any(|a| a == column) {
                axes.push(column.to_string());
            }
        }

        if axes.len() < 2 {
            return Err(InsightError::Chart(
                "A scatter plot needs two numeric columns".to_string(),
            ));
        }
        let x = axes[0].clone();
        let y = axes[1].clone();

        let xs = dataset.numeric_values(&x)?;
        let ys = dataset.numeric_values(&y)?;
        let points: Vec<XyPoint> = xs
            .iter()
            .zip(ys.iter())
            .filter_map(|(x, y)| Some(XyPoint { x: (*x)?, y: (*y)? }))
            .collect();

        Ok(ChartSpec {
            kind: ChartKind::Scatter,
            title: request
                .title
                .clone()
                .unwrap_or_else(|| default_title(ChartKind::Scatter, &x, Some(&y))),
            x_label: x.clone(),
            y_label: y.clone(),
            category: None,
            x,
            y: Some(y),
            aggregation: None,
            top_n: None,
            data: ChartData::Points(points),
        })
    }

    fn histogram(&self, dataset: &Dataset, request: &VisualizeRequest) -> Result<ChartSpec> {
        let profile = dataset.profile();
        let x = request
            .x
            .iter()
            .chain(request.columns.iter())
            .find(|c| profile.is_numeric(c))
            .ok_or_else(|| InsightError::Chart("A histogram needs a numeric column".to_string()))?
            .clone();

        let values: Vec<f64> = dataset.numeric_values(&x)?.into_iter().flatten().collect();
        if values.is_empty() {
            return Err(InsightError::Chart(format!("Column '{}' has no values to bin", x)));
        }

        Ok(ChartSpec {
            kind: ChartKind::Histogram,
            title: request.title.clone().unwrap_or_else(|| format!("Histogram of {}", x)),
            x_label: x.clone(),
            y_label: "Count".to_string(),
            category: None,
            data: ChartData::Categories(bin_values(&values, HISTOGRAM_BINS)),
            x,
            y: None,
            aggregation: Some(Reduction::Count),
            top_n: None,
        })
    }
}

/// Count values into `bins` equal-width ranges; the last range includes its upper edge.
fn bin_values(values: &[f64], bins: usize) -> Vec<CategoryPoint> {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max <= min {
        return vec![CategoryPoint {
            label: format_value(min),
            value: values.len() as f64,
        }];
    }

    let width = (max - min) / bins as f64;
    let mut counts = vec![0usize; bins];
    for value in values {
        let index = (((value - min) / width) as usize).min(bins - 1);
        counts[index] += 1;
    }

    counts
        .into_iter()
        .enumerate()
        .map(|(i, count)| {
            let low = min + width * i as f64;
            let high = if i + 1 == bins { max } else { low + width };
            CategoryPoint {
                label: format!("{} to {}", format_value(low), format_value(high)),
                value: count as f64,
            }
        })
        .collect()
}

fn numeric_other_than(dataset: &Dataset, request: &VisualizeRequest, x: &str) -> Option<String> {
    request
        .columns
        .iter()
        .find(|c| c.as_str() != x && dataset.profile().is_numeric(c))
        .cloned()
}

fn reduction_for(op: Option<AggregateOp>) -> Option<Reduction> {
    op.and_then(AggregateOp::reduction)
}

fn to_points(groups: Vec<(String, f64)>) -> Vec<CategoryPoint> {
    groups
        .into_iter()
        .map(|(label, value)| CategoryPoint { label, value })
        .collect()
}

fn axis_label(y: Option<&str>, reduction: Reduction) -> String {
    match y {
        Some(y) => format!("{} {}", reduction, y),
        None => "Count".to_string(),
    }
}

fn default_title(kind: ChartKind, x: &str, y: Option<&str>) -> String {
    let kind = kind.as_str();
    let kind = format!("{}{}", kind[..1].to_uppercase(), &kind[1..]);
    match y {
        Some(y) => format!("{} chart of {} vs {}", kind, x, y),
        None => format!("{} chart of {}", kind, x),
    }
}
