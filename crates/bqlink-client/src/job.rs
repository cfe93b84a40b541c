//! Job metadata returned by query submission
//!
//! Immutable description of a submitted query: result schema, size estimate,
//! the resident first page and the job handle used by both backends.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle to a submitted query job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId {
    pub project: String,
    pub job: String,
    pub location: Option<String>,
}

impl JobId {
    pub fn new(project: impl Into<String>, job: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            job: job.into(),
            location: None,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{}:{}.{}", self.project, location, self.job),
            None => write!(f, "{}:{}", self.project, self.job),
        }
    }
}

/// Column type as reported by the warehouse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    String,
    Bytes,
    Int64,
    Float64,
    Numeric,
    BigNumeric,
    Bool,
    Timestamp,
    Date,
    Time,
    Datetime,
    Geography,
    Json,
    Record,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldMode {
    #[default]
    Nullable,
    Required,
    Repeated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub mode: FieldMode,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            mode: FieldMode::Nullable,
        }
    }

    pub fn with_mode(mut self, mode: FieldMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Ordered list of result columns
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Position of the column with the given name
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// A single cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Repeated(Vec<FieldValue>),
    Record(Vec<FieldValue>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(v) => Some(v),
            _ => None,
        }
    }
}

/// One result row, values in schema order
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<FieldValue>,
}

impl Row {
    pub fn new(values: Vec<FieldValue>) -> Self {
        Self { values }
    }

    pub fn get(&self, index: usize) -> Option<&FieldValue> {
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Estimated size of the full result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SizeEstimate {
    pub total_rows: Option<u64>,
    pub total_bytes: Option<u64>,
}

/// The first page of rows, resident when the job completed synchronously
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FirstPage {
    pub rows: Vec<Row>,
    /// Token for the page after this one; `None` when the result is complete
    pub next_page_token: Option<String>,
}

/// Result of submitting a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub job_id: JobId,
    pub schema: Schema,
    pub estimate: SizeEstimate,
    pub first_page: FirstPage,
    #[serde(default)]
    pub cache_hit: bool,
    #[serde(default)]
    pub dry_run: bool,
}

impl JobMetadata {
    /// Total result size in rows. Falls back to the first page row count when
    /// the warehouse did not report one.
    pub fn total_estimated_size(&self) -> u64 {
        self.estimate
            .total_rows
            .unwrap_or_else(|| self.first_page_size())
    }

    /// Number of rows resident in the first page
    pub fn first_page_size(&self) -> u64 {
        self.first_page.rows.len() as u64
    }
}
