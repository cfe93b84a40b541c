//! Typed connection options
//!
//! Connection properties and client-info names are closed enumerations of the
//! options the warehouse recognizes, with an `Other` escape hatch for
//! anything else. Everything is validated when it enters the connection.

use bqlink_common::{BqlinkError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::job::FieldType;

static PARAMETER_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("parameter name pattern compiles")
});

/// Dataset used for unqualified table names
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId {
    pub project: Option<String>,
    pub dataset: String,
}

impl DatasetId {
    pub fn new(dataset: impl Into<String>) -> Result<Self> {
        let dataset = dataset.into();
        if dataset.trim().is_empty() {
            return Err(BqlinkError::Validation("dataset name must not be empty".into()));
        }
        Ok(Self {
            project: None,
            dataset,
        })
    }

    pub fn in_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.project {
            Some(project) => write!(f, "{}.{}", project, self.dataset),
            None => write!(f, "{}", self.dataset),
        }
    }
}

/// Recognized connection property keys
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyKey {
    TimeZone,
    SessionId,
    DatasetProjectId,
    Other(String),
}

impl PropertyKey {
    pub fn parse(key: &str) -> Result<Self> {
        let key = key.trim();
        if key.is_empty() {
            return Err(BqlinkError::Validation(
                "connection property key must not be empty".into(),
            ));
        }
        Ok(match key {
            "time_zone" => PropertyKey::TimeZone,
            "session_id" => PropertyKey::SessionId,
            "dataset_project_id" => PropertyKey::DatasetProjectId,
            other => PropertyKey::Other(other.to_string()),
        })
    }

    pub fn as_str(&self) -> &str {
        match self {
            PropertyKey::TimeZone => "time_zone",
            PropertyKey::SessionId => "session_id",
            PropertyKey::DatasetProjectId => "dataset_project_id",
            PropertyKey::Other(key) => key,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, PropertyKey::Other(_))
    }
}

/// A single key/value connection property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProperty {
    pub key: PropertyKey,
    pub value: String,
}

impl ConnectionProperty {
    pub fn new(key: &str, value: impl Into<String>) -> Result<Self> {
        let key = PropertyKey::parse(key)?;
        let value = value.into();
        if key.is_recognized() && value.trim().is_empty() {
            return Err(BqlinkError::Validation(format!(
                "connection property '{}' requires a value",
                key.as_str()
            )));
        }
        Ok(Self { key, value })
    }
}

/// Reject duplicate recognized keys; `Other` keys are passed through as given
pub fn validate_properties(properties: &[ConnectionProperty]) -> Result<()> {
    let mut seen = HashSet::new();
    for property in properties.iter().filter(|p| p.key.is_recognized()) {
        if !seen.insert(&property.key) {
            return Err(BqlinkError::Validation(format!(
                "connection property '{}' set more than once",
                property.key.as_str()
            )));
        }
    }
    Ok(())
}

/// Client info property names
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClientInfoName {
    ApplicationName,
    ClientUser,
    ClientHostname,
    Other(String),
}

impl ClientInfoName {
    pub fn parse(name: &str) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(BqlinkError::Validation(
                "client info name must not be empty".into(),
            ));
        }
        Ok(match name {
            "ApplicationName" => ClientInfoName::ApplicationName,
            "ClientUser" => ClientInfoName::ClientUser,
            "ClientHostname" => ClientInfoName::ClientHostname,
            other => ClientInfoName::Other(other.to_string()),
        })
    }

    pub fn as_str(&self) -> &str {
        match self {
            ClientInfoName::ApplicationName => "ApplicationName",
            ClientInfoName::ClientUser => "ClientUser",
            ClientInfoName::ClientHostname => "ClientHostname",
            ClientInfoName::Other(name) => name,
        }
    }
}

impl fmt::Display for ClientInfoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed query parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ParameterValue {
    Bool(bool),
    Int64(i64),
    Float64(f64),
    /// Decimal kept as its textual form
    Numeric(String),
    String(String),
    Bytes(Vec<u8>),
    /// `YYYY-MM-DD`
    Date(String),
    /// RFC 3339 timestamp
    Timestamp(String),
    Array(Vec<ParameterValue>),
    Null(FieldType),
}

/// Named (`@name`) or positional (`?`) query parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryParameter {
    pub name: Option<String>,
    pub value: ParameterValue,
}

impl QueryParameter {
    pub fn named(name: impl Into<String>, value: ParameterValue) -> Self {
        Self {
            name: Some(name.into()),
            value,
        }
    }

    pub fn positional(value: ParameterValue) -> Self {
        Self { name: None, value }
    }
}

/// Parameters must be all named or all positional, names unique and
/// identifier-shaped.
pub fn validate_parameters(parameters: &[QueryParameter]) -> Result<()> {
    let named = parameters.iter().filter(|p| p.name.is_some()).count();
    if named != 0 && named != parameters.len() {
        return Err(BqlinkError::Validation(
            "query parameters must be either all named or all positional".into(),
        ));
    }

    let mut seen = HashSet::new();
    for name in parameters.iter().filter_map(|p| p.name.as_deref()) {
        if !PARAMETER_NAME.is_match(name) {
            return Err(BqlinkError::Validation(format!(
                "invalid query parameter name '{}'",
                name
            )));
        }
        if !seen.insert(name.to_ascii_lowercase()) {
            return Err(BqlinkError::Validation(format!(
                "duplicate query parameter '{}'",
                name
            )));
        }
    }
    Ok(())
}
