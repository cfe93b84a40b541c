//! bqlink client
//!
//! Adaptive result delivery for a remote analytical warehouse. A
//! [`Connection`] submits queries and returns [`ResultCursor`]s that read the
//! result either page by page or through read streams, chosen from the job's
//! size estimate and the [`ReadClientConfig`] thresholds.

pub mod backend;
pub mod buffer;
pub mod connection;
pub mod cursor;
pub mod job;
pub mod labels;
pub mod memory;
pub mod metrics;
pub mod options;
pub mod selection;
pub mod service;
pub mod telemetry;

pub use backend::BackendKind;
pub use bqlink_common::{BqlinkError, ReadClientConfig, ReadClientConfigBuilder, Result, ServiceError};
pub use connection::Connection;
pub use cursor::{CursorCloser, CursorPhase, ResultCursor};
pub use job::{Field, FieldType, FieldValue, JobId, JobMetadata, Row, Schema};
pub use labels::Labels;
pub use memory::{InMemoryWarehouse, ResultFixture};
pub use options::{ClientInfoName, ConnectionProperty, DatasetId, ParameterValue, QueryParameter};
pub use selection::{select_backend, BackendSelection, SelectionReason};
pub use service::{ClientInfoService, PageFetcher, QueryRequest, QuerySubmitter, Services, StreamReader};
