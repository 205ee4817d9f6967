//! The indexer base: composes storage, coordinator, metadata reader, gap
//! tracker, tick buffer, and processor into one instance with a
//! `STOPPED -> RUNNING <-> PAUSED` lifecycle.
//!
//! Startup sequence, all on the worker task so `start()` returns
//! immediately: discover the run (unless pinned), run the schema-preparation
//! hook, select the run schema on the coordinator, wait for metadata, then
//! enter the batch-processing loop.

use std::sync::Arc;

use async_trait::async_trait;
use common::{
    coordinator::BatchCoordinator,
    errors::{
        report_error,
        ErrorCode,
        ErrorEntry,
    },
    metadata::MetadataReader,
    runtime::{
        Runtime,
        SpawnHandle,
    },
    shutdown::ShutdownSignal,
    types::{
        IndexerClass,
        IndexerInstanceId,
        RunId,
    },
};
use parking_lot::Mutex;
use storage::BatchStorage;
use tokio::sync::watch;

use crate::{
    config::IndexerConfig,
    gap_tracker::GapTracker,
    processor::TickProcessor,
    status::{
        IndexerState,
        IndexerStatus,
        StatusRegistry,
        PORT_METADATA,
    },
    tick_buffer::TickBuffer,
    worker::{
        BatchWorker,
        DesiredState,
    },
};

/// Hook run once per startup before the coordinator selects the run schema.
/// The metadata indexer creates the schema here; batch indexers leave it
/// unset.
#[async_trait]
pub trait SchemaPreparer: Send + Sync {
    async fn prepare_schema(&self, run_id: &RunId) -> anyhow::Result<()>;
}

struct Control {
    desired_tx: watch::Sender<DesiredState>,
    worker: Option<Box<dyn SpawnHandle>>,
}

pub struct Indexer<RT: Runtime> {
    rt: RT,
    seed: WorkerSeed<RT>,
    status: Arc<StatusRegistry>,
    shutdown: ShutdownSignal,
    control: Mutex<Control>,
}

/// Everything the worker task needs, cloneable out of the handle.
struct WorkerSeed<RT: Runtime> {
    rt: RT,
    class: IndexerClass,
    instance_id: IndexerInstanceId,
    config: IndexerConfig,
    storage: Arc<dyn BatchStorage>,
    coordinator: Arc<dyn BatchCoordinator>,
    metadata: Arc<dyn MetadataReader>,
    processor: Arc<dyn TickProcessor>,
    schema_preparer: Option<Arc<dyn SchemaPreparer>>,
    status: Arc<StatusRegistry>,
}

impl<RT: Runtime> Clone for WorkerSeed<RT> {
    fn clone(&self) -> Self {
        Self {
            rt: self.rt.clone(),
            class: self.class.clone(),
            instance_id: self.instance_id.clone(),
            config: self.config.clone(),
            storage: self.storage.clone(),
            coordinator: self.coordinator.clone(),
            metadata: self.metadata.clone(),
            processor: self.processor.clone(),
            schema_preparer: self.schema_preparer.clone(),
            status: self.status.clone(),
        }
    }
}

impl<RT: Runtime> Indexer<RT> {
    pub fn new(
        rt: RT,
        class: IndexerClass,
        config: IndexerConfig,
        storage: Arc<dyn BatchStorage>,
        coordinator: Arc<dyn BatchCoordinator>,
        metadata: Arc<dyn MetadataReader>,
        processor: Arc<dyn TickProcessor>,
        shutdown: ShutdownSignal,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let instance_id = IndexerInstanceId::generate(&class, &mut *rt.rng());
        let status = Arc::new(StatusRegistry::new(
            config.metrics_window,
            rt.monotonic_now(),
        ));
        let (desired_tx, _) = watch::channel(DesiredState::Run);
        Ok(Self {
            rt: rt.clone(),
            seed: WorkerSeed {
                rt,
                class,
                instance_id,
                config,
                storage,
                coordinator,
                metadata,
                processor,
                schema_preparer: None,
                status: status.clone(),
            },
            status,
            shutdown,
            control: Mutex::new(Control {
                desired_tx,
                worker: None,
            }),
        })
    }

    pub fn with_schema_preparer(mut self, preparer: Arc<dyn SchemaPreparer>) -> Self {
        self.seed.schema_preparer = Some(preparer);
        self
    }

    pub fn instance_id(&self) -> &IndexerInstanceId {
        &self.seed.instance_id
    }

    pub fn state(&self) -> IndexerState {
        self.status.state()
    }

    pub fn status(&self) -> IndexerStatus {
        self.status.snapshot(self.rt.monotonic_now())
    }

    /// Spawn the worker. Rejected unless currently `STOPPED`.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut control = self.control.lock();
        self.status
            .state()
            .validate_transition(IndexerState::Running)?;
        self.status.set_state(IndexerState::Running);
        let (desired_tx, desired_rx) = watch::channel(DesiredState::Run);
        control.desired_tx = desired_tx;
        let seed = self.seed.clone();
        let status = self.status.clone();
        let shutdown = self.shutdown.clone();
        let worker = self.rt.spawn("batch_indexer", async move {
            if let Err(e) = seed.startup_and_run(desired_rx).await {
                report_error(&e);
                status.set_state(IndexerState::Error);
                shutdown.signal(e);
            }
        });
        control.worker = Some(worker);
        Ok(())
    }

    /// Stop the worker and wait for it to flush and exit. Rejected unless
    /// currently `RUNNING`.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let worker = {
            let mut control = self.control.lock();
            anyhow::ensure!(
                *control.desired_tx.borrow() == DesiredState::Run,
                "cannot stop indexer while a pause or stop is in flight"
            );
            self.status
                .state()
                .validate_transition(IndexerState::Stopped)?;
            _ = control.desired_tx.send(DesiredState::Stop);
            control.worker.take()
        };
        if let Some(worker) = worker {
            worker.into_join_future().await?;
        }
        Ok(())
    }

    /// Rejected unless currently `RUNNING`.
    pub fn pause(&self) -> anyhow::Result<()> {
        let control = self.control.lock();
        anyhow::ensure!(
            *control.desired_tx.borrow() == DesiredState::Run,
            "cannot pause indexer while a pause or stop is in flight"
        );
        self.status
            .state()
            .validate_transition(IndexerState::Paused)?;
        _ = control.desired_tx.send(DesiredState::Pause);
        Ok(())
    }

    /// Rejected unless currently `PAUSED` (or pausing).
    pub fn resume(&self) -> anyhow::Result<()> {
        let control = self.control.lock();
        anyhow::ensure!(
            *control.desired_tx.borrow() == DesiredState::Pause,
            "cannot resume an indexer that is not paused"
        );
        _ = control.desired_tx.send(DesiredState::Run);
        Ok(())
    }
}

impl<RT: Runtime> WorkerSeed<RT> {
    async fn startup_and_run(self, mut desired: watch::Receiver<DesiredState>) -> anyhow::Result<()> {
        let run_id = match self.config.run_id.clone() {
            Some(run_id) => run_id,
            None => match self.discover_run(&mut desired).await? {
                Some(run_id) => run_id,
                // Stopped before any run appeared.
                None => {
                    self.status.set_state(IndexerState::Stopped);
                    return Ok(());
                },
            },
        };
        tracing::info!(
            instance_id = %self.instance_id,
            run_id = %run_id,
            "indexer starting against run"
        );
        if let Some(preparer) = &self.schema_preparer {
            preparer.prepare_schema(&run_id).await?;
        }
        self.coordinator.set_run(&run_id).await?;
        let run_metadata = match self.await_metadata(&run_id, &mut desired).await? {
            Some(metadata) => metadata,
            None => {
                self.status.set_state(IndexerState::Stopped);
                return Ok(());
            },
        };
        let prefix = self.config.batch_prefix(&run_id);
        let gap_tracker = self.config.gap_tracking.then(|| {
            GapTracker::new(
                self.rt.clone(),
                self.class.clone(),
                self.coordinator.clone(),
                self.storage.clone(),
                run_metadata.sampling_interval,
                self.config.gap_warning_timeout,
            )
        });
        let buffer = self.config.buffering.then(|| {
            TickBuffer::new(
                self.rt.clone(),
                self.config.insert_batch_size,
                self.config.flush_timeout,
            )
        });
        let worker = BatchWorker {
            rt: self.rt.clone(),
            class: self.class.clone(),
            instance_id: self.instance_id.clone(),
            config: self.config.clone(),
            prefix,
            storage: self.storage.clone(),
            coordinator: self.coordinator.clone(),
            processor: self.processor.clone(),
            gap_tracker,
            buffer,
            status: self.status.clone(),
            continuation_token: None,
        };
        worker.run(desired).await;
        Ok(())
    }

    /// Poll storage until any run appears, then pick the one seen most
    /// recently. `None` means we were stopped while waiting.
    async fn discover_run(
        &self,
        desired: &mut watch::Receiver<DesiredState>,
    ) -> anyhow::Result<Option<RunId>> {
        loop {
            if *desired.borrow_and_update() == DesiredState::Stop {
                return Ok(None);
            }
            match self.storage.list_runs().await {
                Ok(runs) => {
                    if let Some(run) = runs.iter().max_by_key(|r| r.first_seen) {
                        return Ok(Some(run.run_id.clone()));
                    }
                },
                Err(e) => {
                    let e = e.context("listing runs during discovery");
                    report_error(&e);
                },
            }
            self.wait_or_control_change(desired).await;
        }
    }

    /// Poll for metadata up to `max_poll_duration`. `None` means stopped
    /// while waiting; exceeding the deadline is a fatal error.
    async fn await_metadata(
        &self,
        run_id: &RunId,
        desired: &mut watch::Receiver<DesiredState>,
    ) -> anyhow::Result<Option<common::metadata::RunMetadata>> {
        let deadline = self.rt.monotonic_now() + self.config.max_poll_duration;
        loop {
            if *desired.borrow_and_update() == DesiredState::Stop {
                return Ok(None);
            }
            match self.metadata.has_metadata(run_id).await {
                Ok(true) => break,
                Ok(false) => {},
                Err(e) => {
                    let e = e.context("polling run metadata");
                    report_error(&e);
                },
            }
            if self.rt.monotonic_now() >= deadline {
                self.status.record_error(ErrorEntry {
                    timestamp_ms: self.rt.unix_timestamp_ms(),
                    code: ErrorCode::MetadataWaitTimeout,
                    message: format!("metadata for run {run_id} never appeared"),
                    details: Some(format!(
                        "waited {}ms",
                        self.config.max_poll_duration.as_millis()
                    )),
                });
                anyhow::bail!(
                    "metadata for run {run_id} did not appear within {}ms",
                    self.config.max_poll_duration.as_millis()
                );
            }
            self.wait_or_control_change(desired).await;
        }
        let metadata = self.metadata.get_metadata(run_id).await?;
        self.status
            .record_port_event(PORT_METADATA, self.rt.monotonic_now(), 1);
        Ok(Some(metadata))
    }

    async fn wait_or_control_change(&self, desired: &mut watch::Receiver<DesiredState>) {
        tokio::select! {
            () = self.rt.wait(self.config.poll_interval) => {},
            _ = desired.changed() => {},
        }
    }
}
