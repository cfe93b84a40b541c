//! Query labels
//!
//! Keys and values are at most 63 characters of lowercase letters,
//! international letters, digits, underscores and dashes. Keys must start with
//! a lowercase letter; values may be empty.

use bqlink_common::{BqlinkError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::collections::HashMap;

static LABEL_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\p{Ll}[\p{Ll}\p{Lo}\p{N}_-]{0,62}$").expect("label key pattern compiles")
});

static LABEL_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[\p{Ll}\p{Lo}\p{N}_-]{0,63}$").expect("label value pattern compiles")
});

/// Validated label set attached to every submitted query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Labels {
    entries: BTreeMap<String, String>,
}

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate every entry of `map`; nothing is kept if one entry is invalid
    pub fn try_from_map(map: HashMap<String, String>) -> Result<Self> {
        let mut labels = Labels::new();
        for (key, value) in map {
            labels.insert(key, value)?;
        }
        Ok(labels)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        validate_key(&key)?;
        validate_value(&key, &value)?;
        self.entries.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn to_map(&self) -> HashMap<String, String> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(BqlinkError::Validation("label key must not be empty".into()));
    }
    if !LABEL_KEY.is_match(key) {
        return Err(BqlinkError::Validation(format!(
            "label key '{}' must start with a lowercase letter and contain at most 63 lowercase letters, digits, '_' or '-'",
            key
        )));
    }
    Ok(())
}

fn validate_value(key: &str, value: &str) -> Result<()> {
    if !LABEL_VALUE.is_match(value) {
        return Err(BqlinkError::Validation(format!(
            "label value for '{}' must contain at most 63 lowercase letters, digits, '_' or '-'",
            key
        )));
    }
    Ok(())
}
