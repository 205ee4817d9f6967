//! Operational error model: classification codes, the bounded recent-error
//! ring kept per component, and the distinguishable failure types callers
//! match on.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::types::RunId;

/// Classification of a surfaced operational error. Stable across releases so
/// operators can alert on `code`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum ErrorCode {
    BatchReadFailed,
    CoordinatorUnavailable,
    StorageUnavailable,
    MetadataWaitTimeout,
    PermanentGap,
    InvalidTransition,
    WorkerFailed,
}

/// One user-visible error as retained for the monitoring interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorEntry {
    pub timestamp_ms: i64,
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<String>,
}

pub const ERROR_RING_CAPACITY: usize = 100;

/// Bounded ring of the most recent errors for one component. Shared between
/// the worker recording errors and the status snapshotter.
#[derive(Default)]
pub struct ErrorRing {
    entries: Mutex<VecDeque<ErrorEntry>>,
}

impl ErrorRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: ErrorEntry) {
        let mut entries = self.entries.lock();
        if entries.len() == ERROR_RING_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<ErrorEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Raised by metadata lookups when the run has no metadata yet. Callers poll
/// on this; anything else propagates.
#[derive(thiserror::Error, Debug)]
#[error("no metadata recorded for run {run_id}")]
pub struct MetadataNotFound {
    pub run_id: RunId,
}

/// A storage or coordinator call exceeded its bounded timeout.
#[derive(thiserror::Error, Debug)]
#[error("{operation} timed out after {timeout_ms}ms")]
pub struct OperationTimeout {
    pub operation: &'static str,
    pub timeout_ms: u64,
}

/// Log an error with its full chain. The single funnel for error reporting so
/// a tracing subscriber (or a future Sentry hook) sees everything.
pub fn report_error(err: &anyhow::Error) {
    tracing::error!("{err:#}");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: i64) -> ErrorEntry {
        ErrorEntry {
            timestamp_ms: n,
            code: ErrorCode::StorageUnavailable,
            message: format!("error {n}"),
            details: None,
        }
    }

    #[test]
    fn test_ring_drops_oldest_beyond_capacity() {
        let ring = ErrorRing::new();
        for n in 0..150 {
            ring.record(entry(n));
        }
        let snapshot = ring.snapshot();
        assert_eq!(snapshot.len(), ERROR_RING_CAPACITY);
        assert_eq!(snapshot.first().unwrap().timestamp_ms, 50);
        assert_eq!(snapshot.last().unwrap().timestamp_ms, 149);
    }
}
