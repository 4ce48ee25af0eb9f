//! Relational operations over a loaded frame: reductions, grouped reductions and row filters.

use crate::error::Result;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Output column for reductions; long enough not to collide with user headers.
const VALUE_COLUMN: &str = "__csv_insight_value";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    Count,
    Sum,
    Mean,
    Max,
    Min,
}

impl Reduction {
    fn expr(self, column: &str) -> Expr {
        let value = col(column).cast(DataType::Float64);
        let reduced = match self {
            Reduction::Count => value.count(),
            Reduction::Sum => value.sum(),
            Reduction::Mean => value.mean(),
            Reduction::Max => value.max(),
            Reduction::Min => value.min(),
        };
        reduced.cast(DataType::Float64).alias(VALUE_COLUMN)
    }
}

impl fmt::Display for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Reduction::Count => "count",
            Reduction::Sum => "sum",
            Reduction::Mean => "average",
            Reduction::Max => "maximum",
            Reduction::Min => "minimum",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "=")]
    Eq,
}

impl Comparison {
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Gt => value > threshold,
            Comparison::Lt => value < threshold,
            Comparison::Ge => value >= threshold,
            Comparison::Le => value <= threshold,
            Comparison::Eq => (value - threshold).abs() < f64::EPSILON * value.abs().max(1.0),
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Comparison::Gt => ">",
            Comparison::Lt => "<",
            Comparison::Ge => ">=",
            Comparison::Le => "<=",
            Comparison::Eq => "=",
        }
    }
}

/// A numeric row predicate: `column op threshold`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub column: String,
    pub op: Comparison,
    pub threshold: f64,
}

impl Predicate {
    pub fn new(column: impl Into<String>, op: Comparison, threshold: f64) -> Self {
        Self {
            column: column.into(),
            op,
            threshold,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.column, self.op.symbol(), format_number(self.threshold))
    }
}

/// Render whole numbers without a fractional part.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Reduce one column to a scalar. `None` when the column has no non-null values.
pub fn reduce(df: &DataFrame, column: &str, reduction: Reduction) -> Result<Option<f64>> {
    let out = df
        .clone()
        .lazy()
        .select([reduction.expr(column)])
        .collect()?;
    let value = out.column(VALUE_COLUMN)?.f64()?.get(0);
    Ok(value)
}

/// Group by `group` and reduce `value` per group; with no value column, count rows.
///
/// Null group keys are labelled `"null"`. Output order is unspecified.
pub fn group_reduce(
    df: &DataFrame,
    group: &str,
    value: Option<&str>,
    reduction: Reduction,
) -> Result<Vec<(String, f64)>> {
    let agg = match value {
        Some(column) => reduction.expr(column),
        None => len().cast(DataType::Float64).alias(VALUE_COLUMN),
    };

    let out = df
        .clone()
        .lazy()
        .group_by([col(group)])
        .agg([agg])
        .collect()?;

    let labels = out.column(group)?.cast(&DataType::String)?;
    let labels = labels.str()?;
    let values = out.column(VALUE_COLUMN)?.f64()?;

    Ok(labels
        .into_iter()
        .zip(values.into_iter())
        .filter_map(|(label, value)| value.map(|v| (label.unwrap_or("null").to_string(), v)))
        .collect())
}

/// Keep the rows where every predicate holds. Null cells never match.
pub fn filter(df: &DataFrame, predicates: &[Predicate]) -> Result<DataFrame> {
    let mut keep = vec![true; df.height()];

    for predicate in predicates {
        let values = df.column(&predicate.column)?.cast(&DataType::Float64)?;
        let values = values.f64()?;
        for (slot, value) in keep.iter_mut().zip(values.into_iter()) {
            *slot = *slot && value.map_or(false, |v| predicate.op.holds(v, predicate.threshold));
        }
    }

    let mask = BooleanChunked::from_slice("mask", &keep);
    Ok(df.filter(&mask)?)
}

/// Pearson correlation over rows where both values are present.
pub fn pearson(xs: &[Option<f64>], ys: &[Option<f64>]) -> Option<f64> {
    let pairs: Vec<(f64, f64)> = xs
        .iter()
        .zip(ys.iter())
        .filter_map(|(x, y)| Some(((*x)?, (*y)?)))
        .collect();

    if pairs.len() < 2 {
        return None;
    }

    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|(_, y)| y).sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in &pairs {
        cov += (x - mean_x) * (y - mean_y);
        var_x += (x - mean_x).powi(2);
        var_y += (y - mean_y).powi(2);
    }

    if var_x == 0.0 || var_y == 0.0 {
        return None;
    }
    Some(cov / (var_x.sqrt() * var_y.sqrt()))
}
