//! Backend selection
//!
//! One-shot, size-based choice between paging and streaming, made when the
//! cursor is created and never revisited.

use bqlink_common::ReadClientConfig;
use std::fmt;

use crate::backend::BackendKind;
use crate::job::JobMetadata;

/// Why a backend was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    /// Result smaller than the minimum table size
    BelowMinimumTableSize,
    /// Nothing in the first page, no ratio to compute
    EmptyFirstPage,
    /// Total / first page below the configured ratio
    RatioBelowThreshold { ratio: u64 },
    /// Total / first page at or above the configured ratio
    RatioAtOrAboveThreshold { ratio: u64 },
}

impl SelectionReason {
    /// Reason without the computed ratio, for metric labels
    pub fn label(&self) -> &'static str {
        match self {
            SelectionReason::BelowMinimumTableSize => "below_minimum_table_size",
            SelectionReason::EmptyFirstPage => "empty_first_page",
            SelectionReason::RatioBelowThreshold { .. } => "ratio_below_threshold",
            SelectionReason::RatioAtOrAboveThreshold { .. } => "ratio_at_or_above_threshold",
        }
    }
}

impl fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionReason::BelowMinimumTableSize => write!(f, "below_minimum_table_size"),
            SelectionReason::EmptyFirstPage => write!(f, "empty_first_page"),
            SelectionReason::RatioBelowThreshold { ratio } => write!(f, "ratio_below_threshold({})", ratio),
            SelectionReason::RatioAtOrAboveThreshold { ratio } => {
                write!(f, "ratio_at_or_above_threshold({})", ratio)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendSelection {
    pub kind: BackendKind,
    pub reason: SelectionReason,
}

/// Pick the backend for a result described by `metadata`
pub fn select_backend(metadata: &JobMetadata, config: &ReadClientConfig) -> BackendSelection {
    let total = metadata.total_estimated_size();
    if total < config.minimum_table_size() {
        return BackendSelection {
            kind: BackendKind::Paged,
            reason: SelectionReason::BelowMinimumTableSize,
        };
    }

    let first_page = metadata.first_page_size();
    if first_page == 0 {
        return BackendSelection {
            kind: BackendKind::Paged,
            reason: SelectionReason::EmptyFirstPage,
        };
    }

    let ratio = total / first_page;
    if ratio >= config.total_to_first_page_size_ratio() {
        BackendSelection {
            kind: BackendKind::Streaming,
            reason: SelectionReason::RatioAtOrAboveThreshold { ratio },
        }
    } else {
        BackendSelection {
            kind: BackendKind::Paged,
            reason: SelectionReason::RatioBelowThreshold { ratio },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{FieldValue, FirstPage, JobId, Row, Schema, SizeEstimate};
    use proptest::prelude::*;

    fn metadata(total_rows: u64, first_page_rows: usize) -> JobMetadata {
        JobMetadata {
            job_id: JobId::new("p", "j"),
            schema: Schema::default(),
            estimate: SizeEstimate {
                total_rows: Some(total_rows),
                total_bytes: None,
            },
            first_page: FirstPage {
                rows: vec![Row::new(vec![FieldValue::Null]); first_page_rows],
                next_page_token: Some("t".into()),
            },
            cache_hit: false,
            dry_run: false,
        }
    }

    fn config(ratio: i64, minimum_table_size: i64) -> ReadClientConfig {
        ReadClientConfig::builder()
            .total_to_first_page_size_ratio(ratio)
            .minimum_table_size(minimum_table_size)
            .build()
            .unwrap()
    }

    #[test]
    fn test_ratio_tie_selects_streaming() {
        let selection = select_backend(&metadata(500, 100), &config(5, 50));
        assert_eq!(selection.kind, BackendKind::Streaming);
        assert_eq!(
            selection.reason,
            SelectionReason::RatioAtOrAboveThreshold { ratio: 5 }
        );
    }

    #[test]
    fn test_small_result_is_paged_regardless_of_ratio() {
        let selection = select_backend(&metadata(40, 1), &config(1, 50));
        assert_eq!(selection.kind, BackendKind::Paged);
        assert_eq!(selection.reason, SelectionReason::BelowMinimumTableSize);
    }

    #[test]
    fn test_empty_first_page_is_paged() {
        let selection = select_backend(&metadata(1_000, 0), &config(2, 10));
        assert_eq!(selection.kind, BackendKind::Paged);
        assert_eq!(selection.reason, SelectionReason::EmptyFirstPage);
    }

    #[test]
    fn test_ratio_below_threshold_is_paged() {
        let selection = select_backend(&metadata(499, 100), &config(5, 50));
        assert_eq!(selection.kind, BackendKind::Paged);
        assert_eq!(selection.reason, SelectionReason::RatioBelowThreshold { ratio: 4 });
    }

    proptest! {
        #[test]
        fn test_below_minimum_always_paged(
            minimum in 1i64..10_000,
            ratio in 1i64..100,
            first_page in 0usize..200,
            shortfall in 1u64..10_000,
        ) {
            let total = (minimum as u64).saturating_sub(shortfall);
            let selection = select_backend(&metadata(total, first_page), &config(ratio, minimum));
            prop_assert_eq!(selection.kind, BackendKind::Paged);
        }

        #[test]
        fn test_large_ratio_always_streams(
            minimum in 1i64..1_000,
            ratio in 1i64..50,
            first_page in 1usize..200,
            extra in 0u64..10_000,
        ) {
            let total = (first_page as u64 * ratio as u64).max(minimum as u64) + extra;
            let selection = select_backend(&metadata(total, first_page), &config(ratio, minimum));
            prop_assert_eq!(selection.kind, BackendKind::Streaming);
        }
    }
}
