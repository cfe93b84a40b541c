//! Remote collaborators
//!
//! The cursor never talks to the wire directly. Query submission, page
//! fetches, stream reads and client-info validation go through these traits;
//! framing, authentication and retries belong to their implementations.

use async_trait::async_trait;
use bqlink_common::ServiceError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::job::{JobId, JobMetadata, Row};
use crate::options::{ConnectionProperty, DatasetId, QueryParameter};

/// Everything sent along with a query submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Client-generated id, lets the service deduplicate resubmissions
    pub request_id: Uuid,
    pub sql: String,
    pub dry_run: bool,
    pub use_legacy_sql: bool,
    pub use_query_cache: bool,
    pub maximum_bytes_billed: Option<u64>,
    pub max_results: Option<u64>,
    pub default_dataset: Option<DatasetId>,
    pub parameters: Vec<QueryParameter>,
    pub labels: HashMap<String, String>,
    pub connection_properties: Vec<ConnectionProperty>,
}

impl QueryRequest {
    /// Request with default options: standard SQL, cache enabled, no caps
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            sql: sql.into(),
            dry_run: false,
            use_legacy_sql: false,
            use_query_cache: true,
            maximum_bytes_billed: None,
            max_results: None,
            default_dataset: None,
            parameters: Vec::new(),
            labels: HashMap::new(),
            connection_properties: Vec::new(),
        }
    }
}

/// One page of rows and the token for the next one
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Page {
    pub rows: Vec<Row>,
    pub next_page_token: Option<String>,
}

/// An independently streamable slice of a job's result
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionSpec {
    pub index: usize,
    pub name: String,
}

/// Open read stream over one partition
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamHandle {
    pub id: String,
    pub partition: PartitionSpec,
}

/// Result of a single stream read
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Rows(Vec<Row>),
    EndOfStream,
}

#[async_trait]
pub trait QuerySubmitter: Send + Sync {
    /// Submit a query and wait for its first page
    async fn submit(&self, request: &QueryRequest) -> Result<JobMetadata, ServiceError>;
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch at most `max_rows` rows starting at `page_token`
    async fn fetch_page(
        &self,
        job: &JobId,
        page_token: &str,
        max_rows: usize,
    ) -> Result<Page, ServiceError>;
}

#[async_trait]
pub trait StreamReader: Send + Sync {
    /// Enumerate the partitions of a job's result, in read order. `None`
    /// lets the service choose how many.
    async fn list_partitions(
        &self,
        job: &JobId,
        max_partitions: Option<usize>,
    ) -> Result<Vec<PartitionSpec>, ServiceError>;

    async fn open_stream(
        &self,
        job: &JobId,
        partition: &PartitionSpec,
    ) -> Result<StreamHandle, ServiceError>;

    /// Read at most `max_rows` rows from an open stream
    async fn read_chunk(
        &self,
        stream: &StreamHandle,
        max_rows: usize,
    ) -> Result<Chunk, ServiceError>;

    /// Release a stream. Must be safe to call on an already finished stream.
    async fn close_stream(&self, stream: &StreamHandle);
}

#[async_trait]
pub trait ClientInfoService: Send + Sync {
    /// Set (`Some`) or clear (`None`) a client info property
    async fn set_property(&self, name: &str, value: Option<&str>) -> Result<(), ServiceError>;
}

/// The collaborator set a connection runs against
#[derive(Clone)]
pub struct Services {
    pub submitter: Arc<dyn QuerySubmitter>,
    pub pages: Arc<dyn PageFetcher>,
    pub streams: Arc<dyn StreamReader>,
    pub client_info: Arc<dyn ClientInfoService>,
}

impl Services {
    pub fn new(
        submitter: Arc<dyn QuerySubmitter>,
        pages: Arc<dyn PageFetcher>,
        streams: Arc<dyn StreamReader>,
        client_info: Arc<dyn ClientInfoService>,
    ) -> Self {
        Self {
            submitter,
            pages,
            streams,
            client_info,
        }
    }

    /// Use one implementation for all four roles
    pub fn from_backend<T>(backend: Arc<T>) -> Self
    where
        T: QuerySubmitter + PageFetcher + StreamReader + ClientInfoService + 'static,
    {
        Self {
            submitter: backend.clone(),
            pages: backend.clone(),
            streams: backend.clone(),
            client_info: backend,
        }
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}
