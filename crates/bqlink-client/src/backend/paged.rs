//! Paged backend: walks the result page by page with page tokens

use bqlink_common::ServiceError;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use super::FillOutcome;
use crate::buffer::RowBuffer;
use crate::job::{FirstPage, JobId, Row};
use crate::service::PageFetcher;

pub struct PagedBackend {
    fetcher: Arc<dyn PageFetcher>,
    job: JobId,
    /// Rows received but not yet moved into the cursor buffer. Holds the
    /// resident first page, which arrives with the job and is not bounded by
    /// the buffer size; later pages are fetched at most `capacity` rows at a
    /// time and drained in the same fill.
    staged: VecDeque<Row>,
    next_page_token: Option<String>,
    pages_fetched: u64,
}

impl PagedBackend {
    /// Start from the resident first page
    pub fn new(fetcher: Arc<dyn PageFetcher>, job: JobId, first_page: FirstPage) -> Self {
        Self {
            fetcher,
            job,
            staged: first_page.rows.into(),
            next_page_token: first_page.next_page_token,
            pages_fetched: 0,
        }
    }

    pub fn pages_fetched(&self) -> u64 {
        self.pages_fetched
    }

    pub(super) async fn fill(
        &mut self,
        buffer: &mut RowBuffer,
        capacity: usize,
    ) -> Result<FillOutcome, ServiceError> {
        if self.staged.is_empty() && capacity > 0 {
            if let Some(token) = self.next_page_token.as_deref() {
                let page = self.fetcher.fetch_page(&self.job, token, capacity).await?;
                self.pages_fetched += 1;
                debug!(
                    job = %self.job,
                    page = self.pages_fetched,
                    rows = page.rows.len(),
                    has_next = page.next_page_token.is_some(),
                    "Fetched result page"
                );
                self.staged.extend(page.rows);
                self.next_page_token = page.next_page_token;
            }
        }

        buffer.drain_from(&mut self.staged, capacity);

        if self.staged.is_empty() && self.next_page_token.is_none() {
            Ok(FillOutcome::Exhausted)
        } else {
            Ok(FillOutcome::More)
        }
    }

    pub(super) fn release(&mut self) {
        self.staged.clear();
        self.next_page_token = None;
    }
}
