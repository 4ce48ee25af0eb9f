//! Dataset ingestion and profiling.
//!
//! The upload boundary rejects anything that is not a well-formed CSV under the
//! size ceiling before a frame is built. A loaded `Dataset` is never mutated;
//! filters produce a new derived `Dataset`.

use crate::config::UploadLimits;
use crate::error::{InsightError, Result};
use crate::operators::{self, Predicate, Reduction};
use chrono::{DateTime, NaiveDate, Utc};
use itertools::Itertools;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Numeric,
    Text,
    Date,
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnKind::Numeric => "numeric",
            ColumnKind::Text => "text",
            ColumnKind::Date => "date",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnProfile {
    pub name: String,
    pub kind: ColumnKind,
    pub distinct: usize,
    pub nulls: usize,
}

/// Column layout of a dataset, in header order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetProfile {
    pub columns: Vec<ColumnProfile>,
    pub row_count: usize,
}

impl DatasetProfile {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnProfile> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn kind_of(&self, name: &str) -> Option<ColumnKind> {
        self.column(name).map(|c| c.kind)
    }

    pub fn is_numeric(&self, name: &str) -> bool {
        self.kind_of(name) == Some(ColumnKind::Numeric)
    }

    /// Text columns, or numeric columns with few distinct values (e.g. bedroom counts).
    pub fn is_category_like(&self, name: &str) -> bool {
        match self.column(name) {
            Some(c) => c.kind == ColumnKind::Text || (c.kind == ColumnKind::Numeric && c.distinct < 10),
            None => false,
        }
    }

    pub fn numeric_columns(&self) -> Vec<&str> {
        self.columns_of(ColumnKind::Numeric)
    }

    pub fn text_columns(&self) -> Vec<&str> {
        self.columns_of(ColumnKind::Text)
    }

    pub fn date_columns(&self) -> Vec<&str> {
        self.columns_of(ColumnKind::Date)
    }

    fn columns_of(&self, kind: ColumnKind) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// First text column, then the first low-cardinality numeric column.
    pub fn first_category_like(&self) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.kind == ColumnKind::Text)
            .or_else(|| self.columns.iter().find(|c| self.is_category_like(&c.name)))
            .map(|c| c.name.as_str())
    }
}

/// File facts reported after an upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub file_name: String,
    pub rows: usize,
    pub columns: usize,
    pub column_names: Vec<String>,
    pub numeric_columns: Vec<String>,
    pub text_columns: Vec<String>,
    pub date_columns: Vec<String>,
    pub has_nulls: bool,
    pub loaded_at: DateTime<Utc>,
}

impl fmt::Display for DatasetInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "File: {}", self.file_name)?;
        writeln!(f, "Rows: {}", self.rows)?;
        writeln!(f, "Columns ({}): {}", self.columns, self.column_names.join(", "))?;
        writeln!(f, "Numeric: {}", self.numeric_columns.join(", "))?;
        writeln!(f, "Text: {}", self.text_columns.join(", "))?;
        if !self.date_columns.is_empty() {
            writeln!(f, "Date: {}", self.date_columns.join(", "))?;
        }
        write!(f, "Missing values: {}", if self.has_nulls { "yes" } else { "no" })
    }
}

/// An uploaded table plus its profile.
#[derive(Debug, Clone)]
pub struct Dataset {
    name: String,
    frame: DataFrame,
    profile: DatasetProfile,
    loaded_at: DateTime<Utc>,
}

impl Dataset {
    /// Validate and load a CSV file from disk.
    pub fn load_csv(path: impl AsRef<Path>, limits: UploadLimits) -> Result<Self> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        let is_csv = path
            .extension()
            .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("csv"))
            .unwrap_or(false);
        if !is_csv {
            return Err(InsightError::Upload(format!("{} is not a CSV file", file_name)));
        }

        let size = std::fs::metadata(path)?.len();
        if size > limits.max_bytes {
            return Err(InsightError::Upload(format!(
                "File size exceeds the maximum limit of {} MB",
                limits.max_bytes / (1024 * 1024)
            )));
        }
        if size == 0 {
            return Err(InsightError::Upload("The file is empty".to_string()));
        }

        let bytes = std::fs::read(path)?;
        check_structure(&bytes)?;

        let frame = read_frame(path.to_path_buf())?;
        let dataset = Self::from_frame(file_name, frame)?;
        info!(
            "Loaded {} with {} rows and {} columns",
            dataset.name,
            dataset.profile.row_count,
            dataset.profile.columns.len()
        );
        Ok(dataset)
    }

    /// Wrap an in-memory frame. Column names are trimmed.
    pub fn from_frame(name: impl Into<String>, mut frame: DataFrame) -> Result<Self> {
        if frame.width() == 0 {
            return Err(InsightError::Upload("The file has no columns".to_string()));
        }

        let trimmed: Vec<String> = frame
            .get_column_names()
            .iter()
            .map(|n| n.trim().to_string())
            .collect();
        frame.set_column_names(trimmed.as_slice())?;

        let profile = profile_frame(&frame)?;
        Ok(Self {
            name: name.into(),
            frame,
            profile,
            loaded_at: Utc::now(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn profile(&self) -> &DatasetProfile {
        &self.profile
    }

    pub fn height(&self) -> usize {
        self.profile.row_count
    }

    pub fn info(&self) -> DatasetInfo {
        let to_owned = |cols: Vec<&str>| cols.into_iter().map(str::to_string).collect::<Vec<_>>();
        DatasetInfo {
            file_name: self.name.clone(),
            rows: self.profile.row_count,
            columns: self.profile.columns.len(),
            column_names: self.profile.column_names(),
            numeric_columns: to_owned(self.profile.numeric_columns()),
            text_columns: to_owned(self.profile.text_columns()),
            date_columns: to_owned(self.profile.date_columns()),
            has_nulls: self.profile.columns.iter().any(|c| c.nulls > 0),
            loaded_at: self.loaded_at,
        }
    }

    /// First `rows` rows as a text table.
    pub fn preview(&self, rows: usize) -> String {
        if self.frame.height() == 0 {
            return "The uploaded file contains no data.".to_string();
        }
        format!("{}", self.frame.head(Some(rows)))
    }

    /// Count, mean, min and max for every numeric column.
    pub fn describe(&self) -> Result<String> {
        let mut lines = Vec::new();
        for name in self.profile.numeric_columns() {
            let count = operators::reduce(&self.frame, name, Reduction::Count)?.unwrap_or(0.0);
            let stats = [Reduction::Mean, Reduction::Min, Reduction::Max]
                .iter()
                .map(|r| {
                    operators::reduce(&self.frame, name, *r)
                        .map(|v| v.map_or_else(|| "-".to_string(), |v| format!("{:.2}", v)))
                })
                .collect::<Result<Vec<_>>>()?;
            lines.push(format!(
                "{}: count {}, mean {}, min {}, max {}",
                name, count as usize, stats[0], stats[1], stats[2]
            ));
        }
        if lines.is_empty() {
            return Ok("No numeric columns.".to_string());
        }
        Ok(lines.join("\n"))
    }

    /// Compact schema description handed to the language model.
    pub fn schema_summary(&self, sample_rows: usize) -> String {
        let columns = self
            .profile
            .columns
            .iter()
            .map(|c| format!("{} ({})", c.name, c.kind))
            .join(", ");

        let mut summary = format!(
            "Columns: {}\nNumber of rows: {}",
            columns, self.profile.row_count
        );
        if sample_rows > 0 && self.frame.height() > 0 {
            match self.sample_rows(sample_rows) {
                Ok(rows) => summary.push_str(&format!("\nSample rows:\n{}", rows)),
                Err(e) => warn!("Could not render sample rows: {}", e),
            }
        }
        summary
    }

    fn sample_rows(&self, rows: usize) -> Result<String> {
        let head = self.frame.head(Some(rows));
        let mut columns: Vec<Vec<String>> = Vec::with_capacity(head.width());
        for series in head.get_columns() {
            let text = series.cast(&DataType::String)?;
            columns.push(
                text.str()?
                    .into_iter()
                    .map(|v| v.unwrap_or_default().to_string())
                    .collect(),
            );
        }

        Ok((0..head.height())
            .map(|row| columns.iter().map(|c| c[row].as_str()).join(", "))
            .join("\n"))
    }

    /// Values of a numeric column as `f64`.
    pub fn numeric_values(&self, column: &str) -> Result<Vec<Option<f64>>> {
        self.require_numeric(column)?;
        let values = self.frame.column(column)?.cast(&DataType::Float64)?;
        Ok(values.f64()?.into_iter().collect())
    }

    /// Values of any column rendered as text.
    pub fn text_values(&self, column: &str) -> Result<Vec<Option<String>>> {
        self.require_column(column)?;
        let values = self.frame.column(column)?.cast(&DataType::String)?;
        Ok(values
            .str()?
            .into_iter()
            .map(|v| v.map(str::to_string))
            .collect())
    }

    pub fn require_column(&self, column: &str) -> Result<()> {
        if self.profile.contains(column) {
            Ok(())
        } else {
            Err(self.missing_column(column))
        }
    }

    pub fn require_numeric(&self, column: &str) -> Result<()> {
        match self.profile.kind_of(column) {
            Some(ColumnKind::Numeric) => Ok(()),
            Some(kind) => Err(InsightError::Computation(format!(
                "Column '{}' is {}, not numeric",
                column, kind
            ))),
            None => Err(self.missing_column(column)),
        }
    }

    fn missing_column(&self, column: &str) -> InsightError {
        InsightError::Computation(format!(
            "Column '{}' not found. Available columns are: {}",
            column,
            self.profile.column_names().join(", ")
        ))
    }

    /// Derived dataset holding the rows that satisfy every predicate.
    pub fn filtered(&self, predicates: &[Predicate]) -> Result<Dataset> {
        for predicate in predicates {
            self.require_numeric(&predicate.column)?;
        }
        let frame = operators::filter(&self.frame, predicates)?;
        let profile = profile_frame(&frame)?;
        Ok(Dataset {
            name: self.name.clone(),
            frame,
            profile,
            loaded_at: self.loaded_at,
        })
    }
}

/// Header present and every record has the header's field count.
fn check_structure(bytes: &[u8]) -> Result<()> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(bytes);

    let headers = reader
        .byte_headers()
        .map_err(|e| InsightError::Upload(format!("Unable to read the header row: {}", e)))?;
    if headers.is_empty() || headers.iter().all(|h| h.iter().all(u8::is_ascii_whitespace)) {
        return Err(InsightError::Upload("The file has no header row".to_string()));
    }

    for record in reader.byte_records() {
        if let Err(e) = record {
            let line = e.position().map(|p| p.line()).unwrap_or(0);
            return Err(InsightError::Upload(format!(
                "Malformed CSV near line {}: {}",
                line, e
            )));
        }
    }
    Ok(())
}

fn read_frame(path: PathBuf) -> Result<DataFrame> {
    let strict = LazyCsvReader::new(&path)
        .with_has_header(true)
        .finish()
        .and_then(|lf| lf.collect());

    match strict {
        Ok(df) => Ok(df),
        Err(e) => {
            warn!("Strict UTF-8 parse failed ({}), retrying with lossy decoding", e);
            LazyCsvReader::new(&path)
                .with_has_header(true)
                .with_encoding(CsvEncoding::LossyUtf8)
                .finish()
                .and_then(|lf| lf.collect())
                .map_err(|e| InsightError::Upload(format!("Unable to parse CSV file: {}", e)))
        }
    }
}

fn profile_frame(frame: &DataFrame) -> Result<DatasetProfile> {
    let mut columns = Vec::with_capacity(frame.width());
    for series in frame.get_columns() {
        columns.push(ColumnProfile {
            name: series.name().to_string(),
            kind: column_kind(series)?,
            distinct: series.n_unique()?,
            nulls: series.null_count(),
        });
    }
    Ok(DatasetProfile {
        columns,
        row_count: frame.height(),
    })
}

fn column_kind(series: &Series) -> Result<ColumnKind> {
    let dtype = series.dtype();
    if matches!(dtype, DataType::Date | DataType::Datetime(_, _)) {
        return Ok(ColumnKind::Date);
    }
    if dtype.is_numeric() {
        return Ok(ColumnKind::Numeric);
    }
    if matches!(dtype, DataType::String) && looks_like_dates(series.str()?) {
        return Ok(ColumnKind::Date);
    }
    Ok(ColumnKind::Text)
}

fn looks_like_dates(values: &StringChunked) -> bool {
    let mut seen = false;
    for value in values.into_iter().flatten() {
        let value = value.trim();
        let date_part = value.get(..10).unwrap_or(value);
        if NaiveDate::parse_from_str(date_part, "%Y-%m-%d").is_err() {
            return false;
        }
        seen = true;
    }
    seen
}
