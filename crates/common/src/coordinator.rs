//! Contract for the coordination store shared by all indexer instances of a
//! class: atomic batch claims plus the gap lifecycle, backed by one
//! relational schema per run.

use async_trait::async_trait;

use crate::types::{
    BatchFileName,
    IndexerInstanceId,
    RunId,
    TickRange,
};

/// Result of a claim attempt. Losing the race is a normal competing-consumer
/// outcome, not an error; callers match on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyClaimed,
}

/// Result of a gap split. `Conflict` means the gap row was concurrently
/// deleted or rewritten (or the row lock timed out); the split is skipped and
/// the next iteration re-reads gap state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitOutcome {
    Split,
    Conflict,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchStatus {
    Claimed,
    Completed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchRow {
    pub filename: BatchFileName,
    pub instance_id: IndexerInstanceId,
    pub claim_ts_ms: i64,
    pub completion_ts_ms: Option<i64>,
    pub status: BatchStatus,
    pub error_message: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GapStatus {
    Pending,
    Permanent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GapRow {
    pub range: TickRange,
    pub first_detected_ms: i64,
    pub status: GapStatus,
}

/// One per-(class, instance) handle onto the coordination schema of a run.
///
/// The indexer class is fixed at construction. Every mutation is atomic at
/// the row level; no method holds database locks across calls. All methods
/// other than [`set_run`] require `set_run` to have selected a run first.
///
/// [`set_run`]: BatchCoordinator::set_run
#[async_trait]
pub trait BatchCoordinator: Send + Sync {
    /// Select the run whose schema subsequent calls operate on, creating the
    /// coordination tables if this process has not done so yet.
    async fn set_run(&self, run_id: &RunId) -> anyhow::Result<()>;

    /// Durably record a claim on `filename` owned by `instance_id`, or
    /// report that some instance (possibly this one) already holds it.
    ///
    /// Implementations insert a `claimed` row under the composite primary
    /// key `(indexer_class, batch_filename)` in a single auto-committed
    /// statement and map the store's integrity-violation error code (never
    /// error-message text) to [`ClaimOutcome::AlreadyClaimed`].
    async fn try_claim(
        &self,
        filename: &BatchFileName,
        instance_id: &IndexerInstanceId,
    ) -> anyhow::Result<ClaimOutcome>;

    /// Transition a claimed batch to `completed`. Idempotent.
    async fn mark_completed(&self, filename: &BatchFileName) -> anyhow::Result<()>;

    /// Transition a claimed batch to `failed`, retaining the message. Failed
    /// rows are never re-claimed automatically; operator action is required.
    async fn mark_failed(&self, filename: &BatchFileName, error_message: &str)
        -> anyhow::Result<()>;

    /// MAX(tick_end) over rows in `{completed, claimed}` for this class, or
    /// -1 when there are none. Claimed rows count: an in-flight batch must
    /// anchor gap detection, otherwise the range another instance is
    /// actively processing would be re-announced as a gap.
    async fn max_completed_tick_end(&self) -> anyhow::Result<i64>;

    /// Record a newly detected gap. Keyed on `(indexer_class,
    /// gap_start_tick)`; concurrent detections of the same gap collapse to
    /// the earliest-written row.
    async fn record_gap(&self, gap: TickRange) -> anyhow::Result<()>;

    /// The pending gap with the smallest start tick, if any.
    async fn oldest_pending_gap(&self) -> anyhow::Result<Option<GapRow>>;

    /// Flip a gap to `permanent`. One-way; permanent gaps are excluded from
    /// [`oldest_pending_gap`] but stay visible for inspection.
    ///
    /// [`oldest_pending_gap`]: BatchCoordinator::oldest_pending_gap
    async fn mark_gap_permanent(&self, gap_start: i64) -> anyhow::Result<()>;

    /// Retire `gap` after a batch covering `batch` landed inside it,
    /// re-inserting the up-to-two non-empty remainders as pending gaps.
    /// Runs as one transaction over a `SELECT ... FOR UPDATE` of the gap
    /// row; if the row is gone or no longer matches `gap`, nothing happens
    /// and `Conflict` is returned.
    async fn split_gap(
        &self,
        gap: TickRange,
        batch: TickRange,
        sampling_interval: i64,
    ) -> anyhow::Result<SplitOutcome>;

    /// All batch rows for this class, for tests and operator inspection.
    async fn list_batches(&self) -> anyhow::Result<Vec<BatchRow>>;

    /// All gap rows for this class, pending and permanent.
    async fn list_gaps(&self) -> anyhow::Result<Vec<GapRow>>;

    /// Drop the cached database connection, if any. Called by the batch loop
    /// before idle sleeps so pooled connections scale with active work, not
    /// with instance count.
    fn release_connection(&self);
}
