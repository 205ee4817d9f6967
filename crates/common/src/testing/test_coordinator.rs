//! In-memory implementation of the coordinator contracts. One shared `Store`
//! stands in for the relational database; handles carved off it via
//! [`TestCoordinator::for_class`] behave like separate instances contending
//! over the same tables.

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;

use crate::{
    coordinator::{
        BatchCoordinator,
        BatchRow,
        BatchStatus,
        ClaimOutcome,
        GapRow,
        GapStatus,
        SplitOutcome,
    },
    errors::MetadataNotFound,
    metadata::{
        MetadataReader,
        RunMetadata,
        SAMPLING_INTERVAL_KEY,
    },
    runtime::Runtime,
    types::{
        BatchFileName,
        IndexerClass,
        IndexerInstanceId,
        RunId,
        TickRange,
    },
};

#[derive(Default)]
struct RunTables {
    // (class, filename) -> row
    batches: BTreeMap<(String, String), BatchRow>,
    // (class, gap_start) -> row
    gaps: BTreeMap<(String, i64), GapRow>,
    metadata: BTreeMap<String, JsonValue>,
}

#[derive(Default)]
struct Store {
    // schema name -> tables
    runs: BTreeMap<String, RunTables>,
    // Remaining operations to fail with an injected error, across all
    // handles, mimicking a coordinator outage.
    failures_remaining: u32,
}

#[derive(Clone)]
pub struct TestCoordinator<RT: Runtime> {
    rt: RT,
    class: IndexerClass,
    store: Arc<Mutex<Store>>,
    run: Arc<Mutex<Option<RunId>>>,
}

impl<RT: Runtime> TestCoordinator<RT> {
    pub fn new(rt: RT, class: IndexerClass) -> Self {
        Self {
            rt,
            class,
            store: Arc::new(Mutex::new(Store::default())),
            run: Arc::new(Mutex::new(None)),
        }
    }

    /// A handle onto the same backing store for another class (or another
    /// instance of the same class). Run selection is per-handle.
    pub fn for_class(&self, class: IndexerClass) -> Self {
        Self {
            rt: self.rt.clone(),
            class,
            store: self.store.clone(),
            run: Arc::new(Mutex::new(None)),
        }
    }

    /// Acts as the external metadata indexer: writes the run's metadata
    /// table, creating the schema if needed.
    pub fn set_sampling_interval(&self, run_id: &RunId, sampling_interval: i64) {
        let mut store = self.store.lock();
        let tables = store.runs.entry(run_id.schema_name()).or_default();
        tables.metadata.insert(
            SAMPLING_INTERVAL_KEY.to_owned(),
            JsonValue::from(sampling_interval),
        );
    }

    /// The next `n` coordinator operations (from any handle) fail with an
    /// injected error.
    pub fn inject_failures(&self, n: u32) {
        self.store.lock().failures_remaining = n;
    }

    fn with_tables<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut RunTables, &str) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let run = self
            .run
            .lock()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("{op}: no run selected"))?;
        let mut store = self.store.lock();
        if store.failures_remaining > 0 {
            store.failures_remaining -= 1;
            anyhow::bail!("injected coordinator failure during {op}");
        }
        let tables = store
            .runs
            .get_mut(&run.schema_name())
            .ok_or_else(|| anyhow::anyhow!("{op}: schema {} missing", run.schema_name()))?;
        f(tables, self.class.as_str())
    }
}

#[async_trait]
impl<RT: Runtime> BatchCoordinator for TestCoordinator<RT> {
    async fn set_run(&self, run_id: &RunId) -> anyhow::Result<()> {
        self.store
            .lock()
            .runs
            .entry(run_id.schema_name())
            .or_default();
        *self.run.lock() = Some(run_id.clone());
        Ok(())
    }

    async fn try_claim(
        &self,
        filename: &BatchFileName,
        instance_id: &IndexerInstanceId,
    ) -> anyhow::Result<ClaimOutcome> {
        let now = self.rt.unix_timestamp_ms();
        self.with_tables("try_claim", |tables, class| {
            let key = (class.to_owned(), filename.as_str().to_owned());
            if tables.batches.contains_key(&key) {
                return Ok(ClaimOutcome::AlreadyClaimed);
            }
            tables.batches.insert(
                key,
                BatchRow {
                    filename: filename.clone(),
                    instance_id: instance_id.clone(),
                    claim_ts_ms: now,
                    completion_ts_ms: None,
                    status: BatchStatus::Claimed,
                    error_message: None,
                },
            );
            Ok(ClaimOutcome::Claimed)
        })
    }

    async fn mark_completed(&self, filename: &BatchFileName) -> anyhow::Result<()> {
        let now = self.rt.unix_timestamp_ms();
        self.with_tables("mark_completed", |tables, class| {
            let key = (class.to_owned(), filename.as_str().to_owned());
            if let Some(row) = tables.batches.get_mut(&key) {
                row.status = BatchStatus::Completed;
                row.completion_ts_ms = Some(now);
            }
            Ok(())
        })
    }

    async fn mark_failed(
        &self,
        filename: &BatchFileName,
        error_message: &str,
    ) -> anyhow::Result<()> {
        self.with_tables("mark_failed", |tables, class| {
            let key = (class.to_owned(), filename.as_str().to_owned());
            if let Some(row) = tables.batches.get_mut(&key) {
                row.status = BatchStatus::Failed;
                row.error_message = Some(error_message.to_owned());
            }
            Ok(())
        })
    }

    async fn max_completed_tick_end(&self) -> anyhow::Result<i64> {
        self.with_tables("max_completed_tick_end", |tables, class| {
            Ok(tables
                .batches
                .iter()
                .filter(|((c, _), row)| {
                    c == class
                        && matches!(row.status, BatchStatus::Completed | BatchStatus::Claimed)
                })
                .map(|(_, row)| row.filename.tick_end())
                .max()
                .unwrap_or(-1))
        })
    }

    async fn record_gap(&self, gap: TickRange) -> anyhow::Result<()> {
        let now = self.rt.unix_timestamp_ms();
        self.with_tables("record_gap", |tables, class| {
            // Collapse concurrent detections: first writer wins, keeping the
            // earliest first_detected.
            tables
                .gaps
                .entry((class.to_owned(), gap.start))
                .or_insert(GapRow {
                    range: gap,
                    first_detected_ms: now,
                    status: GapStatus::Pending,
                });
            Ok(())
        })
    }

    async fn oldest_pending_gap(&self) -> anyhow::Result<Option<GapRow>> {
        self.with_tables("oldest_pending_gap", |tables, class| {
            Ok(tables
                .gaps
                .iter()
                .filter(|((c, _), row)| c == class && row.status == GapStatus::Pending)
                .map(|(_, row)| *row)
                .next())
        })
    }

    async fn mark_gap_permanent(&self, gap_start: i64) -> anyhow::Result<()> {
        self.with_tables("mark_gap_permanent", |tables, class| {
            if let Some(row) = tables.gaps.get_mut(&(class.to_owned(), gap_start)) {
                row.status = GapStatus::Permanent;
            }
            Ok(())
        })
    }

    async fn split_gap(
        &self,
        gap: TickRange,
        batch: TickRange,
        sampling_interval: i64,
    ) -> anyhow::Result<SplitOutcome> {
        let now = self.rt.unix_timestamp_ms();
        self.with_tables("split_gap", |tables, class| {
            let key = (class.to_owned(), gap.start);
            let row = match tables.gaps.get(&key) {
                Some(row) if row.range == gap => *row,
                // Concurrently deleted or already rewritten by another
                // instance's split.
                _ => return Ok(SplitOutcome::Conflict),
            };
            tables.gaps.remove(&key);
            if gap.start <= batch.start - sampling_interval {
                tables.gaps.insert(
                    (class.to_owned(), gap.start),
                    GapRow {
                        range: TickRange {
                            start: gap.start,
                            end: batch.start - sampling_interval,
                        },
                        first_detected_ms: now,
                        status: row.status,
                    },
                );
            }
            if batch.end + sampling_interval <= gap.end {
                tables.gaps.insert(
                    (class.to_owned(), batch.end + sampling_interval),
                    GapRow {
                        range: TickRange {
                            start: batch.end + sampling_interval,
                            end: gap.end,
                        },
                        first_detected_ms: now,
                        status: row.status,
                    },
                );
            }
            Ok(SplitOutcome::Split)
        })
    }

    async fn list_batches(&self) -> anyhow::Result<Vec<BatchRow>> {
        self.with_tables("list_batches", |tables, class| {
            Ok(tables
                .batches
                .iter()
                .filter(|((c, _), _)| c == class)
                .map(|(_, row)| row.clone())
                .collect())
        })
    }

    async fn list_gaps(&self) -> anyhow::Result<Vec<GapRow>> {
        self.with_tables("list_gaps", |tables, class| {
            Ok(tables
                .gaps
                .iter()
                .filter(|((c, _), _)| c == class)
                .map(|(_, row)| *row)
                .collect())
        })
    }

    fn release_connection(&self) {}
}

#[async_trait]
impl<RT: Runtime> MetadataReader for TestCoordinator<RT> {
    async fn has_metadata(&self, run_id: &RunId) -> anyhow::Result<bool> {
        let store = self.store.lock();
        Ok(store
            .runs
            .get(&run_id.schema_name())
            .is_some_and(|tables| tables.metadata.contains_key(SAMPLING_INTERVAL_KEY)))
    }

    async fn get_metadata(&self, run_id: &RunId) -> anyhow::Result<RunMetadata> {
        let values = {
            let store = self.store.lock();
            match store.runs.get(&run_id.schema_name()) {
                Some(tables) if !tables.metadata.is_empty() => tables.metadata.clone(),
                _ => {
                    return Err(MetadataNotFound {
                        run_id: run_id.clone(),
                    }
                    .into())
                },
            }
        };
        RunMetadata::from_values(run_id, values)
    }
}
