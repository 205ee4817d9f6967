//! The batch-processing loop: one iteration fills the oldest gap if it can,
//! otherwise scans forward from the continuation token. Runs on a dedicated
//! task per instance; all cross-instance coordination goes through the
//! coordinator store.

use std::{
    sync::Arc,
    time::Duration,
};

use common::{
    backoff::Backoff,
    coordinator::{
        BatchCoordinator,
        ClaimOutcome,
        SplitOutcome,
    },
    errors::{
        report_error,
        ErrorCode,
        ErrorEntry,
    },
    knobs::{
        INDEXER_INITIAL_BACKOFF,
        INDEXER_MAX_BACKOFF,
    },
    runtime::Runtime,
    types::{
        BatchFileName,
        IndexerClass,
        IndexerInstanceId,
        TickRecord,
    },
};
use storage::BatchStorage;
use tokio::sync::watch;

use crate::{
    config::IndexerConfig,
    gap_tracker::{
        FillAttempt,
        GapTracker,
    },
    metrics::{
        log_batch_processed,
        log_batch_read_failure,
        log_claim_conflict,
        log_flush,
        log_iteration_failure,
        log_ticks_processed,
    },
    processor::TickProcessor,
    status::{
        BindingState,
        IndexerState,
        StatusRegistry,
        PORT_COORDINATOR,
        PORT_STORAGE,
    },
    tick_buffer::{
        FlushPayload,
        TickBuffer,
    },
};

/// What the control surface currently wants the worker to do. The worker
/// reacts at iteration boundaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DesiredState {
    Run,
    Pause,
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum IterationOutcome {
    Processed,
    Idle,
}

pub(crate) struct BatchWorker<RT: Runtime> {
    pub(crate) rt: RT,
    pub(crate) class: IndexerClass,
    pub(crate) instance_id: IndexerInstanceId,
    pub(crate) config: IndexerConfig,
    pub(crate) prefix: String,
    pub(crate) storage: Arc<dyn BatchStorage>,
    pub(crate) coordinator: Arc<dyn BatchCoordinator>,
    pub(crate) processor: Arc<dyn TickProcessor>,
    pub(crate) gap_tracker: Option<GapTracker<RT>>,
    pub(crate) buffer: Option<TickBuffer<RT>>,
    pub(crate) status: Arc<StatusRegistry>,
    pub(crate) continuation_token: Option<String>,
}

impl<RT: Runtime> BatchWorker<RT> {
    pub(crate) async fn run(mut self, mut desired: watch::Receiver<DesiredState>) {
        let mut backoff = Backoff::new(*INDEXER_INITIAL_BACKOFF, *INDEXER_MAX_BACKOFF);
        loop {
            let desired_now = *desired.borrow_and_update();
            match desired_now {
                DesiredState::Stop => break,
                DesiredState::Pause => {
                    self.status.set_state(IndexerState::Paused);
                    if desired.changed().await.is_err() {
                        break;
                    }
                    continue;
                },
                DesiredState::Run => {},
            }
            self.status.set_state(IndexerState::Running);
            match self.run_iteration().await {
                Ok(IterationOutcome::Processed) => {
                    backoff.reset();
                },
                Ok(IterationOutcome::Idle) => {
                    backoff.reset();
                    if let Err(e) = self.maybe_idle_flush().await {
                        self.note_iteration_failure(e);
                    }
                    self.coordinator.release_connection();
                    self.sleep_or_control_change(&mut desired, self.config.poll_interval)
                        .await;
                },
                Err(e) => {
                    self.note_iteration_failure(e);
                    let delay = {
                        let mut rng = self.rt.rng();
                        backoff.fail(&mut *rng)
                    };
                    self.coordinator.release_connection();
                    self.sleep_or_control_change(&mut desired, delay).await;
                },
            }
        }
        self.shutdown().await;
    }

    async fn sleep_or_control_change(
        &self,
        desired: &mut watch::Receiver<DesiredState>,
        duration: Duration,
    ) {
        tokio::select! {
            () = self.rt.wait(duration) => {},
            _ = desired.changed() => {},
        }
    }

    async fn shutdown(&mut self) {
        let remaining = match &mut self.buffer {
            Some(buffer) => buffer.take_remaining(),
            None => None,
        };
        if let Some(payload) = remaining {
            if let Err(e) = self.flush(payload).await {
                let e = e.context("flushing buffered ticks during shutdown");
                report_error(&e);
            }
        }
        self.coordinator.release_connection();
        self.status.set_state(IndexerState::Stopped);
        tracing::info!(instance_id = %self.instance_id, "indexer worker stopped");
    }

    async fn run_iteration(&mut self) -> anyhow::Result<IterationOutcome> {
        if let Some(outcome) = self.fill_oldest_gap().await? {
            return Ok(outcome);
        }
        self.scan_forward().await
    }

    /// Gap phase. `None` falls through to the forward scan; `Some(outcome)`
    /// ends the iteration.
    async fn fill_oldest_gap(&mut self) -> anyhow::Result<Option<IterationOutcome>> {
        let attempt = match &self.gap_tracker {
            Some(tracker) => tracker
                .next_fill_candidate(&self.prefix)
                .await
                .map_err(|e| self.fail_port(PORT_COORDINATOR, ErrorCode::CoordinatorUnavailable, e))?,
            None => FillAttempt::Nothing,
        };
        // The gap range is captured here; the row may be split or deleted by
        // other instances while we process.
        let (filename, gap) = match attempt {
            FillAttempt::Nothing => return Ok(None),
            FillAttempt::WentPermanent(range) => {
                let now = self.rt.monotonic_now();
                self.status.record("permanent_gaps", now, 1);
                self.status.record_error(ErrorEntry {
                    timestamp_ms: self.rt.unix_timestamp_ms(),
                    code: ErrorCode::PermanentGap,
                    message: format!("tick range {range} was never filled"),
                    details: None,
                });
                return Ok(None);
            },
            FillAttempt::Candidate { filename, gap } => (filename, gap),
        };
        match self
            .coordinator
            .try_claim(&filename, &self.instance_id)
            .await
            .map_err(|e| self.fail_port(PORT_COORDINATOR, ErrorCode::CoordinatorUnavailable, e))?
        {
            ClaimOutcome::AlreadyClaimed => {
                // Another instance is filling this gap; abandon the
                // iteration rather than racing it to the split.
                self.note_claim_conflict();
                return Ok(Some(IterationOutcome::Idle));
            },
            ClaimOutcome::Claimed => {},
        }
        let ticks = match self.storage.read_batch(&self.prefix, &filename).await {
            Ok(ticks) => ticks,
            Err(e) => {
                // The gap stays as it is: an unreadable batch must not
                // shrink it.
                self.handle_read_failure(&filename, e).await?;
                return Ok(Some(IterationOutcome::Idle));
            },
        };
        self.deliver(filename.clone(), ticks).await?;
        if let Some(tracker) = &self.gap_tracker {
            let outcome = tracker
                .split_after_processing(gap, filename.range())
                .await
                .map_err(|e| self.fail_port(PORT_COORDINATOR, ErrorCode::CoordinatorUnavailable, e))?;
            let now = self.rt.monotonic_now();
            match outcome {
                SplitOutcome::Split => self.status.record("gap_splits", now, 1),
                SplitOutcome::Conflict => self.status.record("split_conflicts", now, 1),
            }
        }
        Ok(Some(IterationOutcome::Processed))
    }

    /// Forward phase: take the next batch file after the continuation token.
    async fn scan_forward(&mut self) -> anyhow::Result<IterationOutcome> {
        let page = self
            .storage
            .list_batch_files(&self.prefix, self.continuation_token.as_deref(), 1)
            .await
            .map_err(|e| self.fail_port(PORT_STORAGE, ErrorCode::StorageUnavailable, e))?;
        let Some(filename) = page.files.into_iter().next() else {
            return Ok(IterationOutcome::Idle);
        };
        if let Some(tracker) = &self.gap_tracker {
            let max = self
                .coordinator
                .max_completed_tick_end()
                .await
                .map_err(|e| self.fail_port(PORT_COORDINATOR, ErrorCode::CoordinatorUnavailable, e))?;
            tracker
                .detect_and_record(max, filename.tick_start())
                .await
                .map_err(|e| self.fail_port(PORT_COORDINATOR, ErrorCode::CoordinatorUnavailable, e))?;
        }
        match self
            .coordinator
            .try_claim(&filename, &self.instance_id)
            .await
            .map_err(|e| self.fail_port(PORT_COORDINATOR, ErrorCode::CoordinatorUnavailable, e))?
        {
            ClaimOutcome::AlreadyClaimed => {
                // The claiming instance owns this batch now; advance past it.
                // The token is never rewound.
                self.note_claim_conflict();
                self.continuation_token = Some(filename.as_str().to_owned());
                return Ok(IterationOutcome::Idle);
            },
            ClaimOutcome::Claimed => {},
        }
        let ticks = match self.storage.read_batch(&self.prefix, &filename).await {
            Ok(ticks) => ticks,
            Err(e) => {
                self.handle_read_failure(&filename, e).await?;
                self.continuation_token = Some(filename.as_str().to_owned());
                return Ok(IterationOutcome::Idle);
            },
        };
        self.deliver(filename.clone(), ticks).await?;
        self.continuation_token = Some(filename.as_str().to_owned());
        Ok(IterationOutcome::Processed)
    }

    /// Hand a claimed-and-read batch onward: into the buffer when one is
    /// attached, straight through the processor otherwise.
    async fn deliver(&mut self, filename: BatchFileName, ticks: Vec<TickRecord>) -> anyhow::Result<()> {
        let now = self.rt.monotonic_now();
        self.status.record_port_event(PORT_STORAGE, now, 1);
        self.status.record("batches_processed", now, 1);
        log_batch_processed(&self.class);
        if self.buffer.is_some() {
            self.buffer
                .as_mut()
                .expect("checked above")
                .append(filename, ticks);
            loop {
                let payload = self
                    .buffer
                    .as_mut()
                    .expect("checked above")
                    .take_if_full();
                match payload {
                    Some(payload) => self.flush(payload).await?,
                    None => break,
                }
            }
        } else {
            self.processor.process_batch(&ticks).await?;
            self.coordinator
                .mark_completed(&filename)
                .await
                .map_err(|e| self.fail_port(PORT_COORDINATOR, ErrorCode::CoordinatorUnavailable, e))?;
            let now = self.rt.monotonic_now();
            self.status.record_port_event(PORT_COORDINATOR, now, 1);
            self.status.record("ticks_processed", now, ticks.len() as u64);
            log_ticks_processed(&self.class, ticks.len());
        }
        Ok(())
    }

    /// One flush: the processor sees the ticks exactly once, and only after
    /// it succeeds are the drained batch files marked completed.
    async fn flush(&mut self, payload: FlushPayload) -> anyhow::Result<()> {
        self.processor.process_batch(&payload.ticks).await?;
        for filename in &payload.filenames {
            self.coordinator
                .mark_completed(filename)
                .await
                .map_err(|e| self.fail_port(PORT_COORDINATOR, ErrorCode::CoordinatorUnavailable, e))?;
        }
        let now = self.rt.monotonic_now();
        self.status
            .record_port_event(PORT_COORDINATOR, now, payload.filenames.len() as u64);
        self.status.record("flushes", now, 1);
        self.status
            .record("ticks_processed", now, payload.ticks.len() as u64);
        log_flush(&self.class);
        log_ticks_processed(&self.class, payload.ticks.len());
        Ok(())
    }

    async fn maybe_idle_flush(&mut self) -> anyhow::Result<()> {
        let payload = match &mut self.buffer {
            Some(buffer) => buffer.take_if_idle(),
            None => None,
        };
        if let Some(payload) = payload {
            self.flush(payload).await?;
        }
        Ok(())
    }

    async fn handle_read_failure(
        &mut self,
        filename: &BatchFileName,
        e: anyhow::Error,
    ) -> anyhow::Result<()> {
        tracing::error!("failed to read batch {filename}: {e:#}");
        log_batch_read_failure(&self.class);
        let now = self.rt.monotonic_now();
        self.status.record("read_failures", now, 1);
        self.status.record_error(ErrorEntry {
            timestamp_ms: self.rt.unix_timestamp_ms(),
            code: ErrorCode::BatchReadFailed,
            message: format!("failed to read batch {filename}"),
            details: Some(format!("{e:#}")),
        });
        self.coordinator
            .mark_failed(filename, &format!("{e:#}"))
            .await
            .map_err(|e| self.fail_port(PORT_COORDINATOR, ErrorCode::CoordinatorUnavailable, e))?;
        Ok(())
    }

    fn note_claim_conflict(&self) {
        // Losing a claim race is the normal competing-consumer outcome;
        // counter only, no log.
        log_claim_conflict(&self.class);
        self.status
            .record("claim_conflicts", self.rt.monotonic_now(), 1);
    }

    fn fail_port(&self, port: &'static str, code: ErrorCode, e: anyhow::Error) -> anyhow::Error {
        self.status.set_binding(port, BindingState::Failed);
        self.status.record_error(ErrorEntry {
            timestamp_ms: self.rt.unix_timestamp_ms(),
            code,
            message: e.to_string(),
            details: Some(format!("{e:#}")),
        });
        e
    }

    fn note_iteration_failure(&self, e: anyhow::Error) {
        report_error(&e);
        log_iteration_failure(&self.class);
        self.status
            .record("iteration_failures", self.rt.monotonic_now(), 1);
    }
}
