//! In-process warehouse
//!
//! Serves registered result fixtures through all four collaborator traits.
//! Page, chunk and partition sizes are configurable, and faults or delays can
//! be injected on individual calls. Used by the replay binary and the tests.

use async_trait::async_trait;
use bqlink_common::ServiceError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::job::{
    Field, FieldType, FieldValue, FirstPage, JobId, JobMetadata, Row, Schema, SizeEstimate,
};
use crate::service::{
    Chunk, ClientInfoService, Page, PageFetcher, PartitionSpec, QueryRequest, QuerySubmitter,
    StreamHandle, StreamReader,
};

const DEFAULT_FIRST_PAGE_ROWS: usize = 100;
const DEFAULT_PAGE_ROWS: usize = 100;
const DEFAULT_CHUNK_ROWS: usize = 100;

/// A complete query result served by the warehouse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultFixture {
    pub schema: Schema,
    pub rows: Vec<Row>,
    #[serde(default)]
    pub total_bytes: Option<u64>,
}

impl ResultFixture {
    pub fn new(schema: Schema, rows: Vec<Row>) -> Self {
        Self {
            schema,
            rows,
            total_bytes: None,
        }
    }

    /// Single INT64 column holding `0..rows`
    pub fn sequence(column: &str, rows: usize) -> Self {
        Self::new(
            Schema::new(vec![Field::new(column, FieldType::Int64)]),
            (0..rows as i64)
                .map(|i| Row::new(vec![FieldValue::Int64(i)]))
                .collect(),
        )
    }
}

struct StreamState {
    position: usize,
    end: usize,
    fixture: Arc<ResultFixture>,
}

#[derive(Default)]
struct State {
    results: HashMap<String, Arc<ResultFixture>>,
    jobs: HashMap<String, Arc<ResultFixture>>,
    partitions: HashMap<String, Range<usize>>,
    streams: HashMap<String, StreamState>,
    client_info: HashMap<String, String>,
    last_request: Option<QueryRequest>,
    submissions: u64,
    page_fetches: u64,
    chunk_reads: u64,
}

pub struct InMemoryWarehouse {
    project: String,
    first_page_rows: usize,
    page_rows: usize,
    chunk_rows: usize,
    partitions: usize,
    total_rows_override: Option<u64>,
    submit_delay: Option<Duration>,
    read_delay: Option<Duration>,
    fail_page_fetch_at: Option<u64>,
    fail_chunk_read_at: Option<u64>,
    rejected_client_info: HashSet<String>,
    state: Mutex<State>,
}

impl Default for InMemoryWarehouse {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWarehouse {
    pub fn new() -> Self {
        Self {
            project: "local".to_string(),
            first_page_rows: DEFAULT_FIRST_PAGE_ROWS,
            page_rows: DEFAULT_PAGE_ROWS,
            chunk_rows: DEFAULT_CHUNK_ROWS,
            partitions: 1,
            total_rows_override: None,
            submit_delay: None,
            read_delay: None,
            fail_page_fetch_at: None,
            fail_chunk_read_at: None,
            rejected_client_info: HashSet::new(),
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_first_page_rows(mut self, rows: usize) -> Self {
        self.first_page_rows = rows;
        self
    }

    /// Upper bound on rows per fetched page, on top of the caller's limit
    pub fn with_page_rows(mut self, rows: usize) -> Self {
        self.page_rows = rows.max(1);
        self
    }

    /// Upper bound on rows per stream chunk, on top of the caller's limit
    pub fn with_chunk_rows(mut self, rows: usize) -> Self {
        self.chunk_rows = rows.max(1);
        self
    }

    /// Number of partitions offered when the caller does not restrict it
    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions.max(1);
        self
    }

    /// Report this total row count instead of the fixture's real size
    pub fn with_total_rows_estimate(mut self, rows: u64) -> Self {
        self.total_rows_override = Some(rows);
        self
    }

    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = Some(delay);
        self
    }

    /// Delay every page fetch and chunk read
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Fail the n-th page fetch (1-based) with `UNAVAILABLE`
    pub fn fail_page_fetch_at(mut self, n: u64) -> Self {
        self.fail_page_fetch_at = Some(n);
        self
    }

    /// Fail the n-th chunk read (1-based) with `UNAVAILABLE`
    pub fn fail_chunk_read_at(mut self, n: u64) -> Self {
        self.fail_chunk_read_at = Some(n);
        self
    }

    pub fn reject_client_info(mut self, name: impl Into<String>) -> Self {
        self.rejected_client_info.insert(name.into());
        self
    }

    /// Serve `fixture` for queries whose text equals `sql`
    pub fn register(&self, sql: &str, fixture: ResultFixture) {
        self.state
            .lock()
            .results
            .insert(normalize(sql), Arc::new(fixture));
    }

    pub fn submissions(&self) -> u64 {
        self.state.lock().submissions
    }

    pub fn page_fetches(&self) -> u64 {
        self.state.lock().page_fetches
    }

    pub fn chunk_reads(&self) -> u64 {
        self.state.lock().chunk_reads
    }

    /// Streams opened and not yet closed
    pub fn open_streams(&self) -> usize {
        self.state.lock().streams.len()
    }

    pub fn last_request(&self) -> Option<QueryRequest> {
        self.state.lock().last_request.clone()
    }

    pub fn client_info(&self, name: &str) -> Option<String> {
        self.state.lock().client_info.get(name).cloned()
    }

    fn job_rows(&self, job: &JobId) -> Result<Arc<ResultFixture>, ServiceError> {
        self.state
            .lock()
            .jobs
            .get(&job.job)
            .cloned()
            .ok_or_else(|| ServiceError::new("NOT_FOUND", format!("Job {} not found", job)))
    }

    async fn read_pause(&self) {
        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }
    }
}

fn normalize(sql: &str) -> String {
    sql.trim().trim_end_matches(';').trim().to_string()
}

fn unavailable(what: &str, n: u64) -> ServiceError {
    ServiceError::new("UNAVAILABLE", format!("injected failure on {} #{}", what, n))
}

#[async_trait]
impl QuerySubmitter for InMemoryWarehouse {
    async fn submit(&self, request: &QueryRequest) -> Result<JobMetadata, ServiceError> {
        if let Some(delay) = self.submit_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.submissions += 1;
        state.last_request = Some(request.clone());

        let sql = normalize(&request.sql);
        let fixture = state.results.get(&sql).cloned().ok_or_else(|| {
            ServiceError::new("NOT_FOUND", format!("No result registered for query: {}", sql))
        })?;

        let job_id = JobId::new(&self.project, format!("job_{}", Uuid::new_v4().simple()));

        if request.dry_run {
            return Ok(JobMetadata {
                job_id,
                schema: fixture.schema.clone(),
                estimate: SizeEstimate {
                    total_rows: Some(0),
                    total_bytes: fixture.total_bytes,
                },
                first_page: FirstPage::default(),
                cache_hit: false,
                dry_run: true,
            });
        }

        let first = self.first_page_rows.min(fixture.rows.len());
        let next_page_token = (first < fixture.rows.len()).then(|| first.to_string());
        state.jobs.insert(job_id.job.clone(), fixture.clone());

        debug!(job = %job_id, rows = fixture.rows.len(), first_page = first, "Job completed");

        Ok(JobMetadata {
            job_id,
            schema: fixture.schema.clone(),
            estimate: SizeEstimate {
                total_rows: Some(
                    self.total_rows_override
                        .unwrap_or(fixture.rows.len() as u64),
                ),
                total_bytes: fixture.total_bytes,
            },
            first_page: FirstPage {
                rows: fixture.rows[..first].to_vec(),
                next_page_token,
            },
            cache_hit: false,
            dry_run: false,
        })
    }
}

#[async_trait]
impl PageFetcher for InMemoryWarehouse {
    async fn fetch_page(
        &self,
        job: &JobId,
        page_token: &str,
        max_rows: usize,
    ) -> Result<Page, ServiceError> {
        self.read_pause().await;

        let fetch = {
            let mut state = self.state.lock();
            state.page_fetches += 1;
            state.page_fetches
        };
        if self.fail_page_fetch_at == Some(fetch) {
            return Err(unavailable("page fetch", fetch));
        }

        let fixture = self.job_rows(job)?;
        let offset: usize = page_token.parse().map_err(|_| {
            ServiceError::new("INVALID_ARGUMENT", format!("Bad page token '{}'", page_token))
        })?;
        let end = (offset + max_rows.min(self.page_rows)).min(fixture.rows.len());
        let rows = fixture.rows.get(offset..end).unwrap_or_default().to_vec();

        Ok(Page {
            rows,
            next_page_token: (end < fixture.rows.len()).then(|| end.to_string()),
        })
    }
}

#[async_trait]
impl StreamReader for InMemoryWarehouse {
    async fn list_partitions(
        &self,
        job: &JobId,
        max_partitions: Option<usize>,
    ) -> Result<Vec<PartitionSpec>, ServiceError> {
        let fixture = self.job_rows(job)?;
        let total = fixture.rows.len();
        let count = max_partitions
            .map(|max| max.min(self.partitions))
            .unwrap_or(self.partitions)
            .max(1);
        let per_partition = total.div_ceil(count).max(1);

        let mut state = self.state.lock();
        Ok((0..count)
            .map(|index| {
                let start = (index * per_partition).min(total);
                let end = ((index + 1) * per_partition).min(total);
                let name = format!("{}/streams/{}", job.job, index);
                state
                    .partitions
                    .insert(name.clone(), start..end);
                PartitionSpec { index, name }
            })
            .collect())
    }

    async fn open_stream(
        &self,
        job: &JobId,
        partition: &PartitionSpec,
    ) -> Result<StreamHandle, ServiceError> {
        let fixture = self.job_rows(job)?;
        let mut state = self.state.lock();
        let range = state
            .partitions
            .get(&partition.name)
            .cloned()
            .ok_or_else(|| {
                ServiceError::new("NOT_FOUND", format!("Partition {} not found", partition.name))
            })?;
        let id = Uuid::new_v4().to_string();
        state.streams.insert(
            id.clone(),
            StreamState {
                position: range.start,
                end: range.end,
                fixture,
            },
        );
        Ok(StreamHandle {
            id,
            partition: partition.clone(),
        })
    }

    async fn read_chunk(
        &self,
        stream: &StreamHandle,
        max_rows: usize,
    ) -> Result<Chunk, ServiceError> {
        self.read_pause().await;

        let mut state = self.state.lock();
        state.chunk_reads += 1;
        let read = state.chunk_reads;
        if self.fail_chunk_read_at == Some(read) {
            return Err(unavailable("chunk read", read));
        }

        let chunk_rows = self.chunk_rows;
        let entry = state.streams.get_mut(&stream.id).ok_or_else(|| {
            ServiceError::new("NOT_FOUND", format!("Stream {} is not open", stream.id))
        })?;
        if entry.position >= entry.end {
            return Ok(Chunk::EndOfStream);
        }
        let end = (entry.position + max_rows.min(chunk_rows)).min(entry.end);
        let rows = entry.fixture.rows[entry.position..end].to_vec();
        entry.position = end;
        Ok(Chunk::Rows(rows))
    }

    async fn close_stream(&self, stream: &StreamHandle) {
        self.state.lock().streams.remove(&stream.id);
    }
}

#[async_trait]
impl ClientInfoService for InMemoryWarehouse {
    async fn set_property(&self, name: &str, value: Option<&str>) -> Result<(), ServiceError> {
        if self.rejected_client_info.contains(name) {
            return Err(ServiceError::new(
                "INVALID_ARGUMENT",
                format!("Client info property '{}' is not supported", name),
            ));
        }
        let mut state = self.state.lock();
        match value {
            Some(value) => state.client_info.insert(name.to_string(), value.to_string()),
            None => state.client_info.remove(name),
        };
        Ok(())
    }
}
