//! Read-client configuration
//!
//! Thresholds that decide when a query result is read through the streaming
//! read service instead of paging through it, plus the read-ahead buffer
//! bound shared by both strategies.

use serde::Deserialize;
use tracing::debug;

use crate::error::{BqlinkError, Result};

/// Smallest page the paged backend may request. A buffer smaller than this
/// could never hold a single page.
pub const MIN_PAGE_ROWS: u64 = 10;

const DEFAULT_TOTAL_TO_FIRST_PAGE_SIZE_RATIO: u64 = 3;
const DEFAULT_MINIMUM_TABLE_SIZE: u64 = 100;
const DEFAULT_BUFFER_SIZE: u64 = 10_000;

/// Environment prefix used by [`ReadClientConfig::from_env`]
pub const ENV_PREFIX: &str = "BQLINK_READ";

/// Immutable, validated read-client configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadClientConfig {
    total_to_first_page_size_ratio: u64,
    minimum_table_size: u64,
    buffer_size: u64,
}

impl ReadClientConfig {
    /// Returns a builder preloaded with the default thresholds
    pub fn builder() -> ReadClientConfigBuilder {
        ReadClientConfigBuilder::default()
    }

    /// Total rows / first page rows at or above which streaming is used
    pub fn total_to_first_page_size_ratio(&self) -> u64 {
        self.total_to_first_page_size_ratio
    }

    /// Results smaller than this are always paged
    pub fn minimum_table_size(&self) -> u64 {
        self.minimum_table_size
    }

    /// Read-ahead buffer capacity in rows
    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    pub fn to_builder(&self) -> ReadClientConfigBuilder {
        ReadClientConfigBuilder {
            total_to_first_page_size_ratio: self.total_to_first_page_size_ratio as i64,
            minimum_table_size: self.minimum_table_size as i64,
            buffer_size: self.buffer_size as i64,
        }
    }

    /// Load configuration from `BQLINK_READ_*` environment variables.
    /// Unset variables keep their defaults; the result is validated.
    pub fn from_env() -> Result<Self> {
        let settings: ReadClientSettings = load_from_env(ENV_PREFIX)?;
        settings.into_builder().build()
    }
}

impl Default for ReadClientConfig {
    fn default() -> Self {
        Self {
            total_to_first_page_size_ratio: DEFAULT_TOTAL_TO_FIRST_PAGE_SIZE_RATIO,
            minimum_table_size: DEFAULT_MINIMUM_TABLE_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Builder for [`ReadClientConfig`]. Accepts signed values so that
/// non-positive input is rejected by `build()` rather than by the type system
/// at the call site.
#[derive(Debug, Clone)]
pub struct ReadClientConfigBuilder {
    total_to_first_page_size_ratio: i64,
    minimum_table_size: i64,
    buffer_size: i64,
}

impl Default for ReadClientConfigBuilder {
    fn default() -> Self {
        ReadClientConfig::default().to_builder()
    }
}

impl ReadClientConfigBuilder {
    pub fn total_to_first_page_size_ratio(mut self, ratio: i64) -> Self {
        self.total_to_first_page_size_ratio = ratio;
        self
    }

    pub fn minimum_table_size(mut self, rows: i64) -> Self {
        self.minimum_table_size = rows;
        self
    }

    pub fn buffer_size(mut self, rows: i64) -> Self {
        self.buffer_size = rows;
        self
    }

    pub fn build(self) -> Result<ReadClientConfig> {
        let positive = |name: &str, value: i64| -> Result<u64> {
            if value <= 0 {
                return Err(BqlinkError::Validation(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
            Ok(value as u64)
        };

        let total_to_first_page_size_ratio = positive(
            "total_to_first_page_size_ratio",
            self.total_to_first_page_size_ratio,
        )?;
        let minimum_table_size = positive("minimum_table_size", self.minimum_table_size)?;
        let buffer_size = positive("buffer_size", self.buffer_size)?;

        if buffer_size < MIN_PAGE_ROWS {
            return Err(BqlinkError::Validation(format!(
                "buffer_size must be at least {} rows, got {}",
                MIN_PAGE_ROWS, buffer_size
            )));
        }

        let config = ReadClientConfig {
            total_to_first_page_size_ratio,
            minimum_table_size,
            buffer_size,
        };
        debug!(?config, "Read client configuration built");
        Ok(config)
    }
}

/// Raw, unvalidated settings as read from the environment
#[derive(Debug, Default, Deserialize)]
struct ReadClientSettings {
    total_to_first_page_size_ratio: Option<i64>,
    minimum_table_size: Option<i64>,
    buffer_size: Option<i64>,
}

impl ReadClientSettings {
    fn into_builder(self) -> ReadClientConfigBuilder {
        let mut builder = ReadClientConfig::builder();
        if let Some(ratio) = self.total_to_first_page_size_ratio {
            builder = builder.total_to_first_page_size_ratio(ratio);
        }
        if let Some(rows) = self.minimum_table_size {
            builder = builder.minimum_table_size(rows);
        }
        if let Some(rows) = self.buffer_size {
            builder = builder.buffer_size(rows);
        }
        builder
    }
}

/// Load configuration from environment variables
pub fn load_from_env<T: for<'de> Deserialize<'de>>(prefix: &str) -> std::result::Result<T, config::ConfigError> {
    config::Config::builder()
        .add_source(
            config::Environment::with_prefix(prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ReadClientConfig::builder().build().unwrap();
        assert_eq!(config, ReadClientConfig::default());
        assert_eq!(config.total_to_first_page_size_ratio(), 3);
        assert_eq!(config.minimum_table_size(), 100);
        assert_eq!(config.buffer_size(), 10_000);
    }

    #[test]
    fn test_zero_minimum_table_size_rejected() {
        let err = ReadClientConfig::builder()
            .minimum_table_size(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, BqlinkError::Validation(ref m) if m.contains("minimum_table_size")));
    }

    #[test]
    fn test_negative_values_rejected() {
        assert!(ReadClientConfig::builder()
            .total_to_first_page_size_ratio(-1)
            .build()
            .is_err());
        assert!(ReadClientConfig::builder().buffer_size(0).build().is_err());
    }

    #[test]
    fn test_buffer_below_minimum_page_rejected() {
        let err = ReadClientConfig::builder()
            .buffer_size(MIN_PAGE_ROWS as i64 - 1)
            .build()
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let config = ReadClientConfig::builder()
            .buffer_size(MIN_PAGE_ROWS as i64)
            .build()
            .unwrap();
        assert_eq!(config.buffer_size(), MIN_PAGE_ROWS);
    }

    #[test]
    fn test_to_builder_round_trips() {
        let config = ReadClientConfig::builder()
            .total_to_first_page_size_ratio(5)
            .minimum_table_size(50)
            .buffer_size(64)
            .build()
            .unwrap();
        let rebuilt = config.to_builder().buffer_size(128).build().unwrap();
        assert_eq!(rebuilt.total_to_first_page_size_ratio(), 5);
        assert_eq!(rebuilt.minimum_table_size(), 50);
        assert_eq!(rebuilt.buffer_size(), 128);
    }

    #[test]
    fn test_settings_override_defaults() {
        let settings = ReadClientSettings {
            total_to_first_page_size_ratio: None,
            minimum_table_size: Some(500),
            buffer_size: None,
        };
        let config = settings.into_builder().build().unwrap();
        assert_eq!(config.minimum_table_size(), 500);
        assert_eq!(config.total_to_first_page_size_ratio(), 3);
    }

    #[test]
    fn test_from_env_reads_prefixed_variables() {
        const VARS: [&str; 3] = [
            "BQLINK_READ_TOTAL_TO_FIRST_PAGE_SIZE_RATIO",
            "BQLINK_READ_MINIMUM_TABLE_SIZE",
            "BQLINK_READ_BUFFER_SIZE",
        ];

        std::env::set_var(VARS[0], "7");
        std::env::set_var(VARS[1], "500");
        std::env::set_var(VARS[2], "64");
        let loaded = ReadClientConfig::from_env();

        std::env::set_var(VARS[2], "5");
        let too_small = ReadClientConfig::from_env();

        for var in VARS {
            std::env::remove_var(var);
        }

        let config = loaded.unwrap();
        assert_eq!(config.total_to_first_page_size_ratio(), 7);
        assert_eq!(config.minimum_table_size(), 500);
        assert_eq!(config.buffer_size(), 64);
        assert!(matches!(too_small, Err(BqlinkError::Validation(_))));
    }
}
