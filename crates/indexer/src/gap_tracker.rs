//! Detects missing tick ranges, drives oldest-first gap filling, and retires
//! gaps once batches land inside them.
//!
//! Gaps are tick-range rows rather than filename rows: ranges are stable
//! under the variable batch sizes produced by timeout-triggered flushes on
//! the write side, and storage can answer "any batch in range" directly.

use std::{
    sync::Arc,
    time::Duration,
};

use common::{
    coordinator::{
        BatchCoordinator,
        SplitOutcome,
    },
    runtime::Runtime,
    types::{
        BatchFileName,
        IndexerClass,
        TickRange,
    },
};
use storage::BatchStorage;

use crate::metrics::{
    log_gap_split,
    log_permanent_gap,
    log_split_gap_conflict,
};

/// The range missing between the highest anchored tick and a newly
/// discovered batch, if any.
///
/// `max_completed_tick_end == -1` means nothing is anchored yet; a first
/// batch that does not start at tick 0 opens a gap from 0. Otherwise a batch
/// that does not start exactly one interval after the anchor opens a gap in
/// between. A batch at or behind the anchor opens nothing (it is either
/// claimed already or being filled through the gap path).
pub(crate) fn missing_range(
    max_completed_tick_end: i64,
    batch_start: i64,
    sampling_interval: i64,
) -> Option<TickRange> {
    let expected_start = if max_completed_tick_end < 0 {
        0
    } else {
        max_completed_tick_end + sampling_interval
    };
    if batch_start > expected_start {
        Some(TickRange {
            start: expected_start,
            end: batch_start - sampling_interval,
        })
    } else {
        None
    }
}

/// Result of one gap-phase attempt.
pub enum FillAttempt {
    /// No pending gap, or no batch has landed in the oldest one yet.
    Nothing,
    /// The oldest pending gap aged out and was just declared permanent.
    WentPermanent(TickRange),
    /// A batch intersecting the oldest pending gap, ready to claim.
    Candidate {
        filename: BatchFileName,
        gap: TickRange,
    },
}

pub struct GapTracker<RT: Runtime> {
    rt: RT,
    class: IndexerClass,
    coordinator: Arc<dyn BatchCoordinator>,
    storage: Arc<dyn BatchStorage>,
    sampling_interval: i64,
    gap_warning_timeout: Duration,
}

impl<RT: Runtime> GapTracker<RT> {
    pub fn new(
        rt: RT,
        class: IndexerClass,
        coordinator: Arc<dyn BatchCoordinator>,
        storage: Arc<dyn BatchStorage>,
        sampling_interval: i64,
        gap_warning_timeout: Duration,
    ) -> Self {
        Self {
            rt,
            class,
            coordinator,
            storage,
            sampling_interval,
            gap_warning_timeout,
        }
    }

    /// Forward-phase detection: record the gap (if any) in front of a newly
    /// discovered batch.
    pub async fn detect_and_record(
        &self,
        max_completed_tick_end: i64,
        batch_start: i64,
    ) -> anyhow::Result<Option<TickRange>> {
        let Some(gap) = missing_range(max_completed_tick_end, batch_start, self.sampling_interval)
        else {
            return Ok(None);
        };
        tracing::info!(
            gap_start = gap.start,
            gap_end = gap.end,
            "detected missing tick range"
        );
        self.coordinator.record_gap(gap).await?;
        Ok(Some(gap))
    }

    /// One fill attempt against the oldest pending gap.
    ///
    /// The returned candidate carries the gap range captured at decision
    /// time: the row may be deleted under us before the split. Both
    /// `Nothing` and `WentPermanent` fall through to forward discovery.
    pub async fn next_fill_candidate(&self, prefix: &str) -> anyhow::Result<FillAttempt> {
        let Some(gap) = self.coordinator.oldest_pending_gap().await? else {
            return Ok(FillAttempt::Nothing);
        };
        let age_ms = self.rt.unix_timestamp_ms() - gap.first_detected_ms;
        if age_ms >= self.gap_warning_timeout.as_millis() as i64 {
            self.coordinator.mark_gap_permanent(gap.range.start).await?;
            // The pending -> permanent transition happens once, so this warns
            // once per gap.
            tracing::warn!(
                gap_start = gap.range.start,
                gap_end = gap.range.end,
                age_ms,
                "tick gap was never filled; marking permanent"
            );
            log_permanent_gap(&self.class);
            return Ok(FillAttempt::WentPermanent(gap.range));
        }
        let page = self
            .storage
            .list_batch_files_in_range(prefix, None, 1, gap.range)
            .await?;
        Ok(match page.files.into_iter().next() {
            Some(filename) => FillAttempt::Candidate {
                filename,
                gap: gap.range,
            },
            None => FillAttempt::Nothing,
        })
    }

    /// Retire the captured gap range around a processed batch.
    pub async fn split_after_processing(
        &self,
        gap: TickRange,
        batch: TickRange,
    ) -> anyhow::Result<SplitOutcome> {
        let outcome = self
            .coordinator
            .split_gap(gap, batch, self.sampling_interval)
            .await?;
        match outcome {
            SplitOutcome::Split => log_gap_split(&self.class),
            SplitOutcome::Conflict => {
                tracing::debug!(gap_start = gap.start, "gap split lost a race; skipping");
                log_split_gap_conflict(&self.class);
            },
        }
        Ok(outcome)
    }
}
