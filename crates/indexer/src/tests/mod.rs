//! Scenario tests for the full coordination loop, driven on virtual time
//! against the in-memory coordinator and storage doubles.

mod lifecycle;
mod scenarios;

use std::{
    future::Future,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use common::{
    coordinator::{
        BatchCoordinator,
        BatchRow,
        BatchStatus,
        GapRow,
    },
    runtime::{
        testing::TestRuntime,
        Runtime,
    },
    shutdown::ShutdownSignal,
    testing::TestCoordinator,
    types::{
        IndexerClass,
        RunId,
        TickRecord,
    },
};
use storage::testing::TestStorage;

use crate::{
    config::IndexerConfig,
    indexer::Indexer,
    processor::{
        testing::CollectingProcessor,
        TickProcessor,
    },
};

pub(crate) const INTERVAL: i64 = 10;

/// Everything a scenario needs: shared storage, shared coordinator state, a
/// shared collecting processor, and an observer coordinator handle with the
/// run already selected.
pub(crate) struct TestPipeline {
    pub rt: TestRuntime,
    pub storage: TestStorage<TestRuntime>,
    pub coordinator: TestCoordinator<TestRuntime>,
    pub class: IndexerClass,
    pub run: RunId,
    pub processor: CollectingProcessor,
}

impl TestPipeline {
    pub async fn new() -> anyhow::Result<Self> {
        let rt = TestRuntime::new();
        let class: IndexerClass = "organism".parse()?;
        let run: RunId = "run1".parse()?;
        let storage = TestStorage::new(rt.clone());
        let coordinator = TestCoordinator::new(rt.clone(), class.clone());
        coordinator.set_sampling_interval(&run, INTERVAL);
        coordinator.set_run(&run).await?;
        Ok(Self {
            rt,
            storage,
            coordinator,
            class,
            run,
            processor: CollectingProcessor::new(),
        })
    }

    /// A config with test-sized timing knobs; scenarios override the rest.
    pub fn config(&self) -> IndexerConfig {
        IndexerConfig {
            run_id: Some(self.run.clone()),
            poll_interval: Duration::from_millis(100),
            ..IndexerConfig::default()
        }
    }

    /// Build an indexer instance with its own coordinator handle onto the
    /// shared state and the shared processor.
    pub fn indexer(&self, config: IndexerConfig) -> anyhow::Result<Indexer<TestRuntime>> {
        self.indexer_with_processor(config, Arc::new(self.processor.clone()))
    }

    pub fn indexer_with_processor(
        &self,
        config: IndexerConfig,
        processor: Arc<dyn TickProcessor>,
    ) -> anyhow::Result<Indexer<TestRuntime>> {
        let handle = self.coordinator.for_class(self.class.clone());
        Indexer::new(
            self.rt.clone(),
            self.class.clone(),
            config,
            Arc::new(self.storage.clone()),
            Arc::new(handle.clone()),
            Arc::new(handle),
            processor,
            ShutdownSignal::noop(),
        )
    }

    pub fn publish(&self, start: i64, end: i64) -> anyhow::Result<()> {
        self.storage
            .publish_range(&self.run.storage_prefix(), start, end, INTERVAL)?;
        Ok(())
    }

    pub async fn batch_rows(&self) -> anyhow::Result<Vec<BatchRow>> {
        self.coordinator.list_batches().await
    }

    pub async fn completed_rows(&self) -> anyhow::Result<Vec<BatchRow>> {
        Ok(self
            .batch_rows()
            .await?
            .into_iter()
            .filter(|row| row.status == BatchStatus::Completed)
            .collect())
    }

    pub async fn gaps(&self) -> anyhow::Result<Vec<GapRow>> {
        self.coordinator.list_gaps().await
    }

    /// Advance virtual time in small steps until `f` reports done.
    pub async fn wait_until<F, Fut>(&self, what: &str, mut f: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<bool>>,
    {
        for _ in 0..600 {
            if f().await.expect(what) {
                return;
            }
            self.rt.advance(Duration::from_millis(100)).await;
        }
        panic!("timed out waiting for {what}");
    }
}

/// Wraps a processor with a per-flush latency so concurrently running
/// instances interleave on the virtual clock the way they would on real
/// database inserts.
pub(crate) struct SlowProcessor {
    pub rt: TestRuntime,
    pub delay: Duration,
    pub inner: CollectingProcessor,
}

#[async_trait]
impl TickProcessor for SlowProcessor {
    async fn process_batch(&self, ticks: &[TickRecord]) -> anyhow::Result<()> {
        self.rt.wait(self.delay).await;
        self.inner.process_batch(ticks).await
    }
}
