//! Adaptive result cursor
//!
//! A [`ResultCursor`] is returned by `Connection::execute_select`. It picks
//! its backend once from the job metadata, then serves rows forward-only out
//! of a bounded read-ahead buffer, refilling lazily when the buffer runs dry.
//!
//! Traversal is driven by one caller through `&mut self`. Only lifecycle
//! transitions are shared: a [`CursorCloser`] (or the owning connection) may
//! close the cursor from another task, which cancels an in-flight fill.

use bqlink_common::{BqlinkError, ReadClientConfig, Result};
use dashmap::DashMap;
use futures::stream::{self, Stream};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, BackendKind, FillOutcome, PagedBackend, StreamingBackend};
use crate::buffer::RowBuffer;
use crate::job::{JobId, JobMetadata, Row, Schema};
use crate::metrics;
use crate::selection::{select_backend, BackendSelection};
use crate::service::Services;

/// Open cursors of one connection, keyed by cursor id
pub(crate) type CursorRegistry = DashMap<Uuid, CursorCloser>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorPhase {
    /// Returned to the caller, nothing read yet
    Created,
    Active,
    /// Every row has been delivered
    Exhausted,
    Closed,
    /// A backend read failed
    Failed,
}

impl CursorPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CursorPhase::Exhausted | CursorPhase::Closed | CursorPhase::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CursorPhase::Created => "created",
            CursorPhase::Active => "active",
            CursorPhase::Exhausted => "exhausted",
            CursorPhase::Closed => "closed",
            CursorPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for CursorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-cursor settings captured from the connection at execution time
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CursorOptions {
    /// Client-side cap on delivered rows
    pub max_rows: Option<u64>,
    pub strict_ordering: bool,
}

struct Lifecycle {
    phase: CursorPhase,
    /// Cause of the transition to `Failed`
    failure: Option<BqlinkError>,
}

impl Lifecycle {
    fn state_error(&self) -> BqlinkError {
        BqlinkError::CursorState {
            state: self.phase.to_string(),
            cause: self.failure.clone().map(Box::new),
        }
    }
}

struct Engine {
    backend: Option<Backend>,
    buffer: RowBuffer,
    /// The backend has reported its last row
    drained: bool,
}

impl Engine {
    /// Release backend resources; only the first call does any work
    async fn release(&mut self) {
        self.buffer.clear();
        if let Some(mut backend) = self.backend.take() {
            backend.release().await;
            metrics::cursor_released();
        }
    }
}

struct Shared {
    id: Uuid,
    kind: BackendKind,
    lifecycle: Mutex<Lifecycle>,
    cancel: CancellationToken,
    engine: tokio::sync::Mutex<Engine>,
    registry: Option<Weak<CursorRegistry>>,
}

impl Shared {
    fn phase(&self) -> CursorPhase {
        self.lifecycle.lock().phase
    }

    fn state_error(&self) -> BqlinkError {
        self.lifecycle.lock().state_error()
    }

    /// Move `Created` to `Active`; reject reads in a terminal phase
    fn begin_read(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.phase {
            CursorPhase::Created => {
                lifecycle.phase = CursorPhase::Active;
                Ok(())
            }
            CursorPhase::Active => Ok(()),
            _ => Err(lifecycle.state_error()),
        }
    }

    /// Enter a terminal phase unless another one was reached first
    fn finish(&self, phase: CursorPhase, failure: Option<BqlinkError>) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.phase.is_terminal() {
            return false;
        }
        lifecycle.phase = phase;
        lifecycle.failure = failure;
        true
    }

    fn deregister(&self) {
        if let Some(registry) = self.registry.as_ref().and_then(Weak::upgrade) {
            registry.remove(&self.id);
        }
    }

    async fn close(&self) {
        if self.finish(CursorPhase::Closed, None) {
            info!(cursor_id = %self.id, backend = %self.kind, "Closing cursor");
        }
        // Stops an in-flight fill before we wait for the engine
        self.cancel.cancel();
        self.engine.lock().await.release().await;
        self.deregister();
    }
}

/// Closes a cursor from outside the task reading it
#[derive(Clone)]
pub struct CursorCloser {
    shared: Arc<Shared>,
}

impl CursorCloser {
    pub fn cursor_id(&self) -> Uuid {
        self.shared.id
    }

    pub async fn close(&self) {
        self.shared.close().await;
    }
}

impl fmt::Debug for CursorCloser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorCloser")
            .field("cursor_id", &self.shared.id)
            .finish()
    }
}

pub struct ResultCursor {
    shared: Arc<Shared>,
    job_id: JobId,
    schema: Schema,
    selection: BackendSelection,
    options: CursorOptions,
    delivered: u64,
}

impl ResultCursor {
    /// Select a backend for `metadata` and wrap it in a fresh cursor
    pub(crate) fn open(
        metadata: JobMetadata,
        config: &ReadClientConfig,
        services: &Services,
        options: CursorOptions,
        registry: Option<Weak<CursorRegistry>>,
    ) -> Self {
        let selection = select_backend(&metadata, config);
        let id = Uuid::new_v4();

        info!(
            cursor_id = %id,
            job = %metadata.job_id,
            backend = %selection.kind,
            reason = %selection.reason,
            total_rows = metadata.total_estimated_size(),
            first_page_rows = metadata.first_page_size(),
            "Selected result backend"
        );
        metrics::record_backend_selected(selection.kind.as_str(), selection.reason.label());

        let JobMetadata {
            job_id,
            schema,
            first_page,
            ..
        } = metadata;

        let backend = match selection.kind {
            BackendKind::Paged => Backend::Paged(PagedBackend::new(
                services.pages.clone(),
                job_id.clone(),
                first_page,
            )),
            // The stream covers the whole result, the resident first page is dropped
            BackendKind::Streaming => Backend::Streaming(StreamingBackend::new(
                services.streams.clone(),
                job_id.clone(),
                options.strict_ordering,
            )),
        };
        metrics::cursor_opened();

        let shared = Arc::new(Shared {
            id,
            kind: selection.kind,
            lifecycle: Mutex::new(Lifecycle {
                phase: CursorPhase::Created,
                failure: None,
            }),
            cancel: CancellationToken::new(),
            engine: tokio::sync::Mutex::new(Engine {
                backend: Some(backend),
                buffer: RowBuffer::new(config.buffer_size() as usize),
                drained: false,
            }),
            registry,
        });

        Self {
            shared,
            job_id,
            schema,
            selection,
            options,
            delivered: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.selection.kind
    }

    pub fn selection(&self) -> BackendSelection {
        self.selection
    }

    pub fn phase(&self) -> CursorPhase {
        self.shared.phase()
    }

    /// Rows handed to the caller so far
    pub fn rows_delivered(&self) -> u64 {
        self.delivered
    }

    /// Largest number of rows the read-ahead buffer has held at once
    pub async fn buffer_high_water_mark(&self) -> usize {
        self.shared.engine.lock().await.buffer.high_water_mark()
    }

    pub fn closer(&self) -> CursorCloser {
        CursorCloser {
            shared: self.shared.clone(),
        }
    }

    /// Next row, or `None` once the result (or the max-results cap) is
    /// exhausted. Calling again after `None`, after a failure or after close
    /// fails with `CursorState`.
    pub async fn next(&mut self) -> Result<Option<Row>> {
        let shared = self.shared.clone();
        shared.begin_read()?;

        let mut engine = shared.engine.lock().await;
        loop {
            if shared.cancel.is_cancelled() {
                engine.buffer.clear();
                return Err(shared.state_error());
            }

            if let Some(row) = engine.buffer.pop() {
                self.delivered += 1;
                metrics::record_row_delivered(self.selection.kind.as_str());
                return Ok(Some(row));
            }

            let allowed = match self.options.max_rows {
                Some(max) => max.saturating_sub(self.delivered),
                None => u64::MAX,
            };
            if engine.drained || allowed == 0 {
                if shared.finish(CursorPhase::Exhausted, None) {
                    info!(
                        cursor_id = %shared.id,
                        rows = self.delivered,
                        capped = !engine.drained,
                        "Cursor exhausted"
                    );
                }
                engine.release().await;
                drop(engine);
                shared.deregister();
                return Ok(None);
            }

            let Engine {
                backend, buffer, ..
            } = &mut *engine;
            let Some(backend) = backend.as_mut() else {
                return Err(shared.state_error());
            };
            let capacity = usize::try_from(allowed)
                .unwrap_or(usize::MAX)
                .min(buffer.capacity());

            let started = Instant::now();
            let filled = tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => None,
                result = backend.fill(buffer, capacity) => Some(result),
            };
            let elapsed = started.elapsed().as_secs_f64();

            match filled {
                None => {
                    debug!(cursor_id = %shared.id, "Fill interrupted by close");
                    buffer.clear();
                    return Err(shared.state_error());
                }
                Some(Ok(outcome)) => {
                    metrics::record_fill(self.selection.kind.as_str(), "ok", buffer.len(), elapsed);
                    debug!(
                        cursor_id = %shared.id,
                        rows = buffer.len(),
                        exhausted = outcome == FillOutcome::Exhausted,
                        "Filled read-ahead buffer"
                    );
                    if outcome == FillOutcome::Exhausted {
                        engine.drained = true;
                    }
                }
                Some(Err(err)) => {
                    metrics::record_fill(self.selection.kind.as_str(), "error", 0, elapsed);
                    warn!(
                        cursor_id = %shared.id,
                        job = %self.job_id,
                        code = %err.code,
                        error = %err.message,
                        rows_delivered = self.delivered,
                        "Backend read failed"
                    );
                    let failure = BqlinkError::BackendRead(err);
                    shared.finish(CursorPhase::Failed, Some(failure.clone()));
                    engine.release().await;
                    drop(engine);
                    shared.deregister();
                    return Err(failure);
                }
            }
        }
    }

    /// Up to `max` rows. An empty batch means the cursor is exhausted.
    ///
    /// A failure after some rows were taken returns those rows; the cursor is
    /// then `Failed` and the next call reports the cause.
    pub async fn next_batch(&mut self, max: usize) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(max.min(1024));
        while rows.len() < max {
            match self.next().await {
                Ok(Some(row)) => rows.push(row),
                Ok(None) => break,
                Err(err) if rows.is_empty() => return Err(err),
                Err(_) => break,
            }
        }
        Ok(rows)
    }

    /// Consume the cursor as a stream of rows. The stream ends after the
    /// last row or after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Row>> + Send {
        stream::unfold(Some(self), |state| async move {
            let mut cursor = state?;
            match cursor.next().await {
                Ok(Some(row)) => Some((Ok(row), Some(cursor))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    /// Release backend resources. Idempotent; a no-op once exhausted or
    /// failed apart from making sure resources are gone.
    pub async fn close(&self) {
        self.shared.close().await;
    }
}

impl Drop for ResultCursor {
    fn drop(&mut self) {
        if self.shared.phase().is_terminal() {
            return;
        }
        let shared = self.shared.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { shared.close().await });
            }
            Err(_) => {
                shared.cancel.cancel();
                // Backend handles are dropped without a remote close
                if let Ok(mut engine) = shared.engine.try_lock() {
                    engine.buffer.clear();
                    if engine.backend.take().is_some() {
                        metrics::cursor_released();
                    }
                }
                shared.deregister();
                warn!(cursor_id = %shared.id, "Cursor dropped outside a runtime, remote close skipped");
            }
        }
    }
}

impl fmt::Debug for ResultCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCursor")
            .field("id", &self.shared.id)
            .field("job_id", &self.job_id)
            .field("backend", &self.selection.kind)
            .field("phase", &self.phase())
            .field("rows_delivered", &self.delivered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryWarehouse, ResultFixture};
    use crate::service::{QueryRequest, QuerySubmitter};
    use futures::StreamExt;
    use std::time::Duration;

    fn config(ratio: i64, min: i64, buffer: i64) -> ReadClientConfig {
        ReadClientConfig::builder()
            .total_to_first_page_size_ratio(ratio)
            .minimum_table_size(min)
            .buffer_size(buffer)
            .build()
            .unwrap()
    }

    async fn open(
        warehouse: &Arc<InMemoryWarehouse>,
        rows: usize,
        config: ReadClientConfig,
        options: CursorOptions,
    ) -> ResultCursor {
        warehouse.register("SELECT n", ResultFixture::sequence("n", rows));
        let metadata = warehouse
            .submit(&QueryRequest::new("SELECT n"))
            .await
            .unwrap();
        let services = Services::from_backend(warehouse.clone());
        ResultCursor::open(metadata, &config, &services, options, None)
    }

    async fn collect(cursor: &mut ResultCursor) -> Vec<i64> {
        let mut seen = Vec::new();
        while let Some(row) = cursor.next().await.unwrap() {
            seen.push(row.values[0].as_i64().unwrap());
        }
        seen
    }

    #[tokio::test]
    async fn test_paged_cursor_delivers_in_order() {
        let warehouse = Arc::new(InMemoryWarehouse::new().with_first_page_rows(7).with_page_rows(9));
        let mut cursor = open(&warehouse, 40, config(3, 1000, 10), CursorOptions::default()).await;

        assert_eq!(cursor.backend_kind(), BackendKind::Paged);
        assert_eq!(cursor.phase(), CursorPhase::Created);

        let seen = collect(&mut cursor).await;
        assert_eq!(seen, (0..40).collect::<Vec<_>>());
        assert_eq!(cursor.rows_delivered(), 40);
        assert_eq!(cursor.phase(), CursorPhase::Exhausted);
        assert!(cursor.buffer_high_water_mark().await <= 10);

        let err = cursor.next().await.unwrap_err();
        assert_eq!(err.code(), "CURSOR_STATE");
    }

    #[tokio::test]
    async fn test_streaming_cursor_rereads_from_start() {
        let warehouse = Arc::new(
            InMemoryWarehouse::new()
                .with_first_page_rows(100)
                .with_partitions(3)
                .with_chunk_rows(25),
        );
        let mut cursor = open(&warehouse, 500, config(5, 50, 40), CursorOptions::default()).await;
        assert_eq!(cursor.backend_kind(), BackendKind::Streaming);

        let seen = collect(&mut cursor).await;
        assert_eq!(seen, (0..500).collect::<Vec<_>>());
        assert_eq!(warehouse.page_fetches(), 0);
        assert_eq!(warehouse.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_failure_on_third_fill() {
        let warehouse = Arc::new(
            InMemoryWarehouse::new()
                .with_first_page_rows(10)
                .with_page_rows(10)
                .fail_page_fetch_at(2),
        );
        let mut cursor = open(&warehouse, 100, config(3, 1000, 10), CursorOptions::default()).await;

        let mut kept = Vec::new();
        let err = loop {
            match cursor.next().await {
                Ok(Some(row)) => kept.push(row),
                Ok(None) => panic!("cursor should fail before exhaustion"),
                Err(err) => break err,
            }
        };

        assert_eq!(kept.len(), 20);
        assert_eq!(kept[19].values[0].as_i64(), Some(19));
        assert!(matches!(err, BqlinkError::BackendRead(_)));
        assert_eq!(cursor.phase(), CursorPhase::Failed);

        match cursor.next().await.unwrap_err() {
            BqlinkError::CursorState { state, cause } => {
                assert_eq!(state, "failed");
                assert!(matches!(cause.as_deref(), Some(BqlinkError::BackendRead(_))));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_close_releases_streams_and_is_idempotent() {
        let warehouse = Arc::new(InMemoryWarehouse::new().with_first_page_rows(10).with_partitions(2));
        let mut cursor = open(&warehouse, 200, config(2, 10, 10), CursorOptions::default()).await;

        assert!(cursor.next().await.unwrap().is_some());
        assert_eq!(warehouse.open_streams(), 1);

        cursor.close().await;
        cursor.close().await;
        assert_eq!(cursor.phase(), CursorPhase::Closed);
        assert_eq!(warehouse.open_streams(), 0);

        let err = cursor.next().await.unwrap_err();
        assert!(matches!(err, BqlinkError::CursorState { ref state, .. } if state == "closed"));
    }

    #[tokio::test]
    async fn test_close_after_exhaustion_keeps_phase() {
        let warehouse = Arc::new(InMemoryWarehouse::new());
        let mut cursor = open(&warehouse, 5, config(3, 100, 10), CursorOptions::default()).await;

        assert_eq!(collect(&mut cursor).await.len(), 5);
        cursor.close().await;
        assert_eq!(cursor.phase(), CursorPhase::Exhausted);
    }

    #[tokio::test]
    async fn test_max_rows_cap_reports_exhaustion() {
        let warehouse = Arc::new(InMemoryWarehouse::new().with_first_page_rows(10));
        let options = CursorOptions {
            max_rows: Some(25),
            strict_ordering: false,
        };
        let mut cursor = open(&warehouse, 100, config(3, 1000, 10), options).await;

        let seen = collect(&mut cursor).await;
        assert_eq!(seen, (0..25).collect::<Vec<_>>());
        assert_eq!(cursor.phase(), CursorPhase::Exhausted);
    }

    #[tokio::test]
    async fn test_close_interrupts_in_flight_fill() {
        let warehouse = Arc::new(
            InMemoryWarehouse::new()
                .with_first_page_rows(10)
                .with_read_delay(Duration::from_secs(30)),
        );
        let mut cursor = open(&warehouse, 200, config(2, 10, 10), CursorOptions::default()).await;
        let closer = cursor.closer();

        let reader = tokio::spawn(async move {
            let result = cursor.next().await;
            (result, cursor)
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        closer.close().await;

        let (result, cursor) = reader.await.unwrap();
        assert!(matches!(result, Err(BqlinkError::CursorState { .. })));
        assert_eq!(cursor.rows_delivered(), 0);
        assert_eq!(warehouse.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_drop_schedules_close() {
        let warehouse = Arc::new(InMemoryWarehouse::new().with_first_page_rows(10));
        let mut cursor = open(&warehouse, 200, config(2, 10, 10), CursorOptions::default()).await;
        cursor.next().await.unwrap();
        assert_eq!(warehouse.open_streams(), 1);

        drop(cursor);
        for _ in 0..50 {
            if warehouse.open_streams() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(warehouse.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_batches_and_stream() {
        let warehouse = Arc::new(InMemoryWarehouse::new().with_first_page_rows(4));
        let mut cursor = open(&warehouse, 23, config(3, 1000, 10), CursorOptions::default()).await;

        assert_eq!(cursor.next_batch(10).await.unwrap().len(), 10);
        let rest: Vec<_> = cursor.into_stream().collect().await;
        assert_eq!(rest.len(), 13);
        assert!(rest.iter().all(|row| row.is_ok()));
    }

    #[tokio::test]
    async fn test_next_batch_keeps_rows_taken_before_failure() {
        let warehouse = Arc::new(
            InMemoryWarehouse::new()
                .with_first_page_rows(10)
                .fail_page_fetch_at(1),
        );
        let mut cursor = open(&warehouse, 100, config(3, 1000, 10), CursorOptions::default()).await;

        let batch = cursor.next_batch(15).await.unwrap();
        assert_eq!(batch.len(), 10);
        assert_eq!(cursor.rows_delivered(), 10);
        assert_eq!(cursor.phase(), CursorPhase::Failed);

        match cursor.next_batch(15).await.unwrap_err() {
            BqlinkError::CursorState { state, cause } => {
                assert_eq!(state, "failed");
                assert!(matches!(cause.as_deref(), Some(BqlinkError::BackendRead(_))));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_next_batch_reports_failure_before_any_row() {
        let warehouse = Arc::new(
            InMemoryWarehouse::new()
                .with_first_page_rows(0)
                .fail_page_fetch_at(1),
        );
        let mut cursor = open(&warehouse, 100, config(3, 1000, 10), CursorOptions::default()).await;

        let err = cursor.next_batch(5).await.unwrap_err();
        assert!(matches!(err, BqlinkError::BackendRead(_)));
        assert_eq!(cursor.rows_delivered(), 0);
    }

    #[tokio::test]
    async fn test_resident_first_page_moves_in_buffer_sized_slices() {
        let warehouse = Arc::new(InMemoryWarehouse::new().with_first_page_rows(100));
        let mut cursor = open(&warehouse, 150, config(3, 1000, 10), CursorOptions::default()).await;
        assert_eq!(cursor.backend_kind(), BackendKind::Paged);

        for _ in 0..100 {
            assert!(cursor.next().await.unwrap().is_some());
        }
        assert_eq!(warehouse.page_fetches(), 0);
        assert!(cursor.buffer_high_water_mark().await <= 10);

        assert_eq!(collect(&mut cursor).await, (100..150).collect::<Vec<_>>());
        assert_eq!(warehouse.page_fetches(), 5);
        assert!(cursor.buffer_high_water_mark().await <= 10);
    }

    #[tokio::test]
    async fn test_delivered_rows_metric_follows_next() {
        let delivered = || metrics::ROWS_DELIVERED_TOTAL.with_label_values(&["paged"]).get();
        let before = delivered();

        let warehouse = Arc::new(InMemoryWarehouse::new().with_first_page_rows(10));
        let mut cursor = open(&warehouse, 40, config(3, 1000, 10), CursorOptions::default()).await;
        for _ in 0..5 {
            cursor.next().await.unwrap();
        }
        cursor.close().await;

        assert!(delivered() - before >= 5.0);
    }

    #[test]
    fn test_drop_outside_runtime_gives_up_backend() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let warehouse = Arc::new(InMemoryWarehouse::new().with_first_page_rows(10));
        let mut cursor = runtime.block_on(open(
            &warehouse,
            200,
            config(2, 10, 10),
            CursorOptions::default(),
        ));
        runtime.block_on(async { cursor.next().await.unwrap() });
        let closer = cursor.closer();

        drop(cursor);

        let shared = &closer.shared;
        assert!(shared.cancel.is_cancelled());
        assert!(shared.engine.try_lock().unwrap().backend.is_none());

        // The released backend is not counted again on a later close
        runtime.block_on(closer.close());
        assert_eq!(closer.shared.phase(), CursorPhase::Closed);
    }
}
