//! Fallback Answerer - deterministic answers computed straight from the frame.
//!
//! Used whenever a question resolves to a computable intent, and as the
//! recovery path when the model endpoint cannot be reached.

use crate::column_resolver::{normalize_header, ColumnRoleMap, Role};
use crate::dataset::Dataset;
use crate::error::{InsightError, Result};
use crate::intent::{AggregateOp, AggregateRequest, QueryIntent};
use crate::operators::{self, Predicate, Reduction};
use itertools::Itertools;
use std::borrow::Cow;
use tracing::debug;

pub struct FallbackAnswerer {
    preview_rows: usize,
}

impl Default for FallbackAnswerer {
    fn default() -> Self {
        Self { preview_rows: 10 }
    }
}

impl FallbackAnswerer {
    pub fn new(preview_rows: usize) -> Self {
        Self { preview_rows }
    }

    pub fn answer(&self, dataset: &Dataset, roles: &ColumnRoleMap, intent: &QueryIntent) -> Result<String> {
        debug!("Fallback answering {} intent", intent.name());
        match intent {
            QueryIntent::Aggregate(request) => self.aggregate(dataset, roles, request),
            QueryIntent::Filter { predicates } => self.filter(dataset, predicates),
            QueryIntent::FreeForm { .. } => Ok(self.overview(dataset, roles)),
            QueryIntent::Visualize(_) => Err(InsightError::Computation(
                "Chart requests are answered by the visualization builder".to_string(),
            )),
        }
    }

    pub fn aggregate(&self, dataset: &Dataset, roles: &ColumnRoleMap, request: &AggregateRequest) -> Result<String> {
        let source: Cow<'_, Dataset> = if request.filters.is_empty() {
            Cow::Borrowed(dataset)
        } else {
            Cow::Owned(dataset.filtered(&request.filters)?)
        };

        let body = if request.op == AggregateOp::Count {
            self.counts(&source, request.group_by.as_deref())?
        } else {
            let column = match &request.column {
                Some(column) => column.clone(),
                None => default_numeric_column(&source, roles)?,
            };
            source.require_numeric(&column)?;

            match request.op.reduction() {
                None => self.correlation(&source, &column, request.other.as_deref())?,
                Some(reduction) => match &request.group_by {
                    Some(group) => self.grouped(&source, request.op, reduction, &column, group)?,
                    None => self.scalar(&source, roles, request.op, reduction, &column)?,
                },
            }
        };

        if request.filters.is_empty() {
            Ok(body)
        } else {
            Ok(format!(
                "Among {} rows where {}:\n{}",
                source.height(),
                describe_predicates(&request.filters),
                body
            ))
        }
    }

    fn scalar(
        &self,
        dataset: &Dataset,
        roles: &ColumnRoleMap,
        op: AggregateOp,
        reduction: Reduction,
        column: &str,
    ) -> Result<String> {
        let value = match operators::reduce(dataset.frame(), column, reduction)? {
            Some(value) => value,
            None => return Ok(format!("There are no values in '{}' to compute the {}.", column, op)),
        };

        let mut text = format!("{} {}: {:.2}", op, column, value);
        if matches!(reduction, Reduction::Max | Reduction::Min) {
            let details = extreme_row_details(dataset, roles, column, value)?;
            if !details.is_empty() {
                text.push_str(&format!(" ({})", details.join(", ")));
            }
        }
        Ok(text)
    }

    fn grouped(
        &self,
        dataset: &Dataset,
        op: AggregateOp,
        reduction: Reduction,
        column: &str,
        group: &str,
    ) -> Result<String> {
        dataset.require_column(group)?;
        let groups = operators::group_reduce(dataset.frame(), group, Some(column), reduction)?;

        let lines = groups
            .into_iter()
            .sorted_by(|a, b| a.0.cmp(&b.0))
            .map(|(label, value)| format!("- {}: {:.2}", label, value))
            .join("\n");
        Ok(format!("{} {} by {}:\n{}", op, column, group, lines))
    }

    /// Rows per group, or the total row count without a group.
    fn counts(&self, dataset: &Dataset, group: Option<&str>) -> Result<String> {
        let group = match group {
            Some(group) => group,
            None => return Ok(format!("number of rows: {}", dataset.height())),
        };
        dataset.require_column(group)?;

        let lines = operators::group_reduce(dataset.frame(), group, None, Reduction::Count)?
            .into_iter()
            .sorted_by(|a, b| a.0.cmp(&b.0))
            .map(|(label, count)| format!("- {}: {}", label, operators::format_number(count)))
            .join("\n");
        Ok(format!("number of rows by {}:\n{}", group, lines))
    }

    fn correlation(&self, dataset: &Dataset, column: &str, other: Option<&str>) -> Result<String> {
        let other = match other {
            Some(other) => other.to_string(),
            None => dataset
                .profile()
                .numeric_columns()
                .into_iter()
                .find(|c| *c != column)
                .map(str::to_string)
                .ok_or_else(|| {
                    InsightError::Computation(format!(
                        "Correlation needs a second numeric column besides '{}'",
                        column
                    ))
                })?,
        };
        dataset.require_numeric(&other)?;

        let xs = dataset.numeric_values(column)?;
        let ys = dataset.numeric_values(&other)?;
        match operators::pearson(&xs, &ys) {
            Some(r) => Ok(format!("correlation between {} and {}: {:.2}", column, other, r)),
            None => Ok(format!(
                "Not enough varying values to correlate {} and {}.",
                column, other
            )),
        }
    }

    pub fn filter(&self, dataset: &Dataset, predicates: &[Predicate]) -> Result<String> {
        if predicates.is_empty() {
            return Err(InsightError::Computation("No filter conditions were given".to_string()));
        }

        let matching = dataset.filtered(predicates)?;
        let count = matching.height();
        let verb = if count == 1 { "row matches" } else { "rows match" };
        let mut text = format!("{} {} {}", count, verb, describe_predicates(predicates));

        if count > 0 {
            if count > self.preview_rows {
                text.push_str(&format!(". First {}:", self.preview_rows));
            }
            text.push('\n');
            text.push_str(&matching.preview(self.preview_rows));
        }
        Ok(text)
    }

    /// What can be said without a model: shape, columns and questions worth asking.
    pub fn overview(&self, dataset: &Dataset, roles: &ColumnRoleMap) -> String {
        let profile = dataset.profile();
        let mut lines = vec![
            format!(
                "{} has {} rows and {} columns: {}.",
                dataset.name(),
                profile.row_count,
                profile.columns.len(),
                profile.column_names().join(", ")
            ),
        ];

        let numeric = profile.numeric_columns();
        if !numeric.is_empty() {
            lines.push(format!("Numeric columns: {}.", numeric.join(", ")));
        }

        let value = roles
            .get(Role::Value)
            .filter(|c| profile.is_numeric(c))
            .or_else(|| numeric.first().copied());
        let category = roles
            .get(Role::Location)
            .or_else(|| roles.get(Role::Category))
            .or_else(|| profile.first_category_like());

        let mut suggestions = Vec::new();
        if let Some(value) = value {
            suggestions.push(format!("What is the average {}?", value));
            if let Some(category) = category {
                suggestions.push(format!("Average {} by {}", value, category));
            }
        }
        if let Some(category) = category {
            suggestions.push(format!("Show a bar chart of {}", category));
        }
        if let Some(count) = roles.get(Role::Count).filter(|c| profile.is_numeric(c)) {
            suggestions.push(format!("Which rows have {} greater than 3?", count));
        }

        if !suggestions.is_empty() {
            lines.push("Try asking:".to_string());
            lines.extend(suggestions.into_iter().map(|s| format!("- {}", s)));
        }
        lines.join("\n")
    }
}

fn describe_predicates(predicates: &[Predicate]) -> String {
    predicates.iter().map(|p| p.to_string()).join(" and ")
}

/// The value role when it is numeric, otherwise the first numeric column.
fn default_numeric_column(dataset: &Dataset, roles: &ColumnRoleMap) -> Result<String> {
    let profile = dataset.profile();
    roles
        .get(Role::Value)
        .filter(|c| profile.is_numeric(c))
        .or_else(|| profile.numeric_columns().first().copied())
        .map(str::to_string)
        .ok_or_else(|| InsightError::Computation("The dataset has no numeric columns".to_string()))
}

/// Identifying cells of the first row holding `value` in `column`.
fn extreme_row_details(dataset: &Dataset, roles: &ColumnRoleMap, column: &str, value: f64) -> Result<Vec<String>> {
    let values = dataset.numeric_values(column)?;
    let row = match values.iter().position(|v| *v == Some(value)) {
        Some(row) => row,
        None => return Ok(Vec::new()),
    };

    let profile = dataset.profile();
    let id = profile
        .columns
        .iter()
        .map(|c| c.name.as_str())
        .find(|name| {
            let normalized = normalize_header(name);
            normalized == "id" || normalized.ends_with("_id")
        });

    let mut columns: Vec<&str> = Vec::new();
    for candidate in id.into_iter().chain(
        [Role::Location, Role::Category, Role::Count]
            .into_iter()
            .filter_map(|role| roles.get(role)),
    ) {
        if candidate != column && !columns.contains(&candidate) {
            columns.push(candidate);
        }
    }

    let mut details = Vec::with_capacity(columns.len());
    for name in columns {
        if let Some(Some(cell)) = dataset.text_values(name)?.into_iter().nth(row) {
            details.push(format!("{}: {}", name, cell));
        }
    }
    Ok(details)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column_resolver::{ColumnResolver, SynonymTable};
    use crate::operators::Comparison;
    use polars::prelude::*;
    use std::sync::Arc;

    fn homes() -> (Dataset, ColumnRoleMap) {
        let frame = df! [
            "id" => [1i64, 2, 3, 4, 5, 6, 7],
            "region" => ["North", "South", "North", "East", "South", "West", "East"],
            "price" => [100.0, 200.0, 300.0, 250.0, 150.0, 400.0, 350.0],
            "bedrooms" => [2i64, 4, 5, 4, 3, 6, 4],
            "sqft" => [900i64, 1500, 2100, 1700, 1200, 2600, 2000]
        ]
        .unwrap();
        let dataset = Dataset::from_frame("homes.csv", frame).unwrap();
        let roles = ColumnResolver::new(Arc::new(SynonymTable::default()))
            .resolve(&dataset.profile().column_names());
        (dataset, roles)
    }

    #[test]
    fn test_average_formats_two_decimals() {
        let frame = df! [ "price" => [100.0, 200.0, 300.0] ].unwrap();
        let dataset = Dataset::from_frame("p.csv", frame).unwrap();
        let request = AggregateRequest::new(AggregateOp::Average, "price");
        let text = FallbackAnswerer::default()
            .aggregate(&dataset, &ColumnRoleMap::default(), &request)
            .unwrap();
        assert_eq!(text, "average price: 200.00");
    }

    #[test]
    fn test_average_of_text_column_is_computation_error() {
        let (dataset, roles) = homes();
        let request = AggregateRequest::new(AggregateOp::Average, "region");
        let err = FallbackAnswerer::default().aggregate(&dataset, &roles, &request).unwrap_err();
        assert!(matches!(err, InsightError::Computation(_)));
    }

    #[test]
    fn test_missing_column_is_computation_error() {
        let (dataset, roles) = homes();
        let request = AggregateRequest::new(AggregateOp::Sum, "garage");
        let err = FallbackAnswerer::default().aggregate(&dataset, &roles, &request).unwrap_err();
        assert!(matches!(err, InsightError::Computation(_)));
    }

    #[test]
    fn test_grouped_average_sorted_by_label() {
        let (dataset, roles) = homes();
        let mut request = AggregateRequest::new(AggregateOp::Average, "price");
        request.group_by = Some("region".to_string());
        let text = FallbackAnswerer::default().aggregate(&dataset, &roles, &request).unwrap();
        assert_eq!(
            text,
            "average price by region:\n- East: 300.00\n- North: 200.00\n- South: 175.00\n- West: 400.00"
        );
    }

    #[test]
    fn test_grouped_count_per_label() {
        let (dataset, roles) = homes();
        let mut request = AggregateRequest::new(AggregateOp::Count, "region");
        request.column = None;
        request.group_by = Some("region".to_string());
        let text = FallbackAnswerer::default().aggregate(&dataset, &roles, &request).unwrap();
        assert_eq!(text, "number of rows by region:\n- East: 2\n- North: 2\n- South: 2\n- West: 1");
    }

    #[test]
    fn test_max_reports_extreme_row() {
        let (dataset, roles) = homes();
        let request = AggregateRequest::new(AggregateOp::Max, "price");
        let text = FallbackAnswerer::default().aggregate(&dataset, &roles, &request).unwrap();
        assert_eq!(text, "maximum price: 400.00 (id: 6, region: West, bedrooms: 6)");
    }

    #[test]
    fn test_default_column_uses_value_role() {
        let (dataset, roles) = homes();
        let mut request = AggregateRequest::new(AggregateOp::Min, "price");
        request.column = None;
        let text = FallbackAnswerer::default().aggregate(&dataset, &roles, &request).unwrap();
        assert!(text.starts_with("minimum price: 100.00"));
    }

    #[test]
    fn test_correlation_picks_next_numeric_column() {
        let frame = df! [
            "price" => [1.0, 2.0, 3.0, 4.0],
            "sqft" => [10.0, 20.0, 30.0, 40.0]
        ]
        .unwrap();
        let dataset = Dataset::from_frame("c.csv", frame).unwrap();
        let request = AggregateRequest::new(AggregateOp::Correlation, "price");
        let text = FallbackAnswerer::default()
            .aggregate(&dataset, &ColumnRoleMap::default(), &request)
            .unwrap();
        assert_eq!(text, "correlation between price and sqft: 1.00");
    }

    #[test]
    fn test_aggregate_applies_filters_first() {
        let (dataset, roles) = homes();
        let mut request = AggregateRequest::new(AggregateOp::Average, "price");
        request.filters = vec![Predicate::new("bedrooms", Comparison::Ge, 5.0)];
        let text = FallbackAnswerer::default().aggregate(&dataset, &roles, &request).unwrap();
        assert_eq!(text, "Among 2 rows where bedrooms >= 5:\naverage price: 350.00");
    }

    #[test]
    fn test_filter_counts_and_previews() {
        let (dataset, _) = homes();
        let predicates = vec![Predicate::new("bedrooms", Comparison::Gt, 3.0)];
        let text = FallbackAnswerer::default().filter(&dataset, &predicates).unwrap();
        assert!(text.starts_with("5 rows match bedrooms > 3\n"));
        assert!(text.contains("shape: (5,"));
    }

    #[test]
    fn test_filter_preview_is_capped() {
        let bedrooms: Vec<i64> = (0..25).map(|i| 4 + i % 3).collect();
        let frame = df! [ "bedrooms" => bedrooms ].unwrap();
        let dataset = Dataset::from_frame("b.csv", frame).unwrap();
        let predicates = vec![Predicate::new("bedrooms", Comparison::Gt, 3.0)];
        let text = FallbackAnswerer::default().filter(&dataset, &predicates).unwrap();
        assert!(text.starts_with("25 rows match bedrooms > 3. First 10:"));
        assert!(text.contains("shape: (10,"));
    }

    #[test]
    fn test_filter_without_matches() {
        let (dataset, _) = homes();
        let predicates = vec![Predicate::new("price", Comparison::Gt, 10_000.0)];
        let text = FallbackAnswerer::default().filter(&dataset, &predicates).unwrap();
        assert_eq!(text, "0 rows match price > 10000");
    }

    #[test]
    fn test_free_form_gets_overview() {
        let (dataset, roles) = homes();
        let intent = QueryIntent::FreeForm {
            text: "tell me a story".to_string(),
        };
        let text = FallbackAnswerer::default().answer(&dataset, &roles, &intent).unwrap();
        assert!(text.starts_with("homes.csv has 7 rows and 5 columns"));
        assert!(text.contains("- What is the average price?"));
        assert!(text.contains("- Show a bar chart of region"));
    }
}
