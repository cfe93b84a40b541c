//! bqlink Common Library
//!
//! Shared error taxonomy and read-client configuration for all bqlink crates.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use crate::config::{ReadClientConfig, ReadClientConfigBuilder, MIN_PAGE_ROWS};
pub use crate::error::{BqlinkError, Result, ServiceError};
