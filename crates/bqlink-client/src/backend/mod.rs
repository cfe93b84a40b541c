//! Row-producing backends
//!
//! A cursor holds exactly one [`Backend`], chosen once by
//! [`crate::selection::select_backend`]. Both variants expose the same
//! `fill` capability: append at most `capacity` rows to the read-ahead buffer
//! and report whether more rows may follow.

mod paged;
mod streaming;

pub use paged::PagedBackend;
pub use streaming::StreamingBackend;

use bqlink_common::ServiceError;
use serde::Serialize;
use std::fmt;

use crate::buffer::RowBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Paged,
    Streaming,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Paged => "paged",
            BackendKind::Streaming => "streaming",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a fill call left behind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// More rows may follow
    More,
    /// The backend has produced its last row
    Exhausted,
}

pub enum Backend {
    Paged(PagedBackend),
    Streaming(StreamingBackend),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Paged(_) => BackendKind::Paged,
            Backend::Streaming(_) => BackendKind::Streaming,
        }
    }

    /// Append at most `capacity` rows (never more than `buffer.remaining()`)
    pub async fn fill(
        &mut self,
        buffer: &mut RowBuffer,
        capacity: usize,
    ) -> Result<FillOutcome, ServiceError> {
        let capacity = capacity.min(buffer.remaining());
        match self {
            Backend::Paged(backend) => backend.fill(buffer, capacity).await,
            Backend::Streaming(backend) => backend.fill(buffer, capacity).await,
        }
    }

    /// Release every remote resource held. Safe to call more than once.
    pub async fn release(&mut self) {
        match self {
            Backend::Paged(backend) => backend.release(),
            Backend::Streaming(backend) => backend.release().await,
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Backend").field(&self.kind()).finish()
    }
}
