//! Streaming backend: reads the job's result through read streams, one
//! partition at a time in the order the service enumerates them.

use bqlink_common::ServiceError;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

use super::FillOutcome;
use crate::buffer::RowBuffer;
use crate::job::{JobId, Row};
use crate::service::{Chunk, PartitionSpec, StreamHandle, StreamReader};

pub struct StreamingBackend {
    reader: Arc<dyn StreamReader>,
    job: JobId,
    strict_ordering: bool,
    /// Partitions not yet opened; `None` until enumerated
    pending: Option<VecDeque<PartitionSpec>>,
    current: Option<StreamHandle>,
    staged: VecDeque<Row>,
    finished: bool,
    streams_opened: usize,
}

impl StreamingBackend {
    /// Nothing is opened until the first fill. With `strict_ordering` a
    /// single partition is requested so rows arrive in result order.
    pub fn new(reader: Arc<dyn StreamReader>, job: JobId, strict_ordering: bool) -> Self {
        Self {
            reader,
            job,
            strict_ordering,
            pending: None,
            current: None,
            staged: VecDeque::new(),
            finished: false,
            streams_opened: 0,
        }
    }

    pub fn streams_opened(&self) -> usize {
        self.streams_opened
    }

    pub(super) async fn fill(
        &mut self,
        buffer: &mut RowBuffer,
        capacity: usize,
    ) -> Result<FillOutcome, ServiceError> {
        while self.staged.is_empty() && !self.finished && capacity > 0 {
            let stream = match self.current.clone() {
                Some(stream) => stream,
                None => match self.open_next().await? {
                    Some(stream) => stream,
                    None => {
                        self.finished = true;
                        break;
                    }
                },
            };

            match self.reader.read_chunk(&stream, capacity).await? {
                Chunk::Rows(rows) => {
                    debug!(
                        job = %self.job,
                        partition = stream.partition.index,
                        rows = rows.len(),
                        "Read stream chunk"
                    );
                    self.staged.extend(rows);
                }
                Chunk::EndOfStream => {
                    debug!(job = %self.job, partition = stream.partition.index, "Stream finished");
                    self.reader.close_stream(&stream).await;
                    self.current = None;
                }
            }
        }

        buffer.drain_from(&mut self.staged, capacity);

        if self.finished && self.staged.is_empty() {
            Ok(FillOutcome::Exhausted)
        } else {
            Ok(FillOutcome::More)
        }
    }

    /// Open the next partition's stream, enumerating partitions on first use
    async fn open_next(&mut self) -> Result<Option<StreamHandle>, ServiceError> {
        if self.pending.is_none() {
            let max_partitions = self.strict_ordering.then_some(1);
            let partitions = self.reader.list_partitions(&self.job, max_partitions).await?;
            if self.strict_ordering && partitions.len() > 1 {
                return Err(ServiceError::new(
                    "INVALID_PARTITIONS",
                    format!(
                        "ordered read requested a single partition, service returned {}",
                        partitions.len()
                    ),
                ));
            }
            info!(
                job = %self.job,
                partitions = partitions.len(),
                strict_ordering = self.strict_ordering,
                "Opening streaming read"
            );
            self.pending = Some(partitions.into());
        }

        let Some(partition) = self.pending.as_mut().and_then(VecDeque::pop_front) else {
            return Ok(None);
        };
        let stream = self.reader.open_stream(&self.job, &partition).await?;
        self.streams_opened += 1;
        self.current = Some(stream.clone());
        Ok(Some(stream))
    }

    pub(super) async fn release(&mut self) {
        if let Some(stream) = self.current.take() {
            debug!(job = %self.job, stream = %stream.id, "Closing open stream");
            self.reader.close_stream(&stream).await;
        }
        self.pending = Some(VecDeque::new());
        self.staged.clear();
        self.finished = true;
    }
}
