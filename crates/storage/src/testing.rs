//! In-memory batch storage for tests.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::SystemTime,
};

use async_trait::async_trait;
use common::{
    runtime::Runtime,
    types::{
        BatchFileName,
        RunId,
        TickRange,
        TickRecord,
    },
};
use parking_lot::Mutex;

use crate::{
    batch_format::{
        decode_batch,
        encode_batch,
    },
    BatchListPage,
    BatchStorage,
    RunInfo,
};

#[derive(Default)]
struct State {
    // prefix -> filename -> encoded payload
    files: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    // run id -> first time a batch appeared under its prefix
    runs: BTreeMap<RunId, SystemTime>,
    failures_remaining: u32,
}

/// In-memory stand-in for the blob store. Cloning shares the store, so many
/// indexer instances can contend over the same set of files.
#[derive(Clone)]
pub struct TestStorage<RT: Runtime> {
    rt: RT,
    state: Arc<Mutex<State>>,
}

impl<RT: Runtime> std::fmt::Debug for TestStorage<RT> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestStorage").finish()
    }
}

impl<RT: Runtime> TestStorage<RT> {
    pub fn new(rt: RT) -> Self {
        Self {
            rt,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Publish a batch the way the persistence service would. Visible to
    /// listers immediately and atomically.
    pub fn publish_batch(
        &self,
        prefix: &str,
        ticks: &[TickRecord],
    ) -> anyhow::Result<BatchFileName> {
        anyhow::ensure!(!ticks.is_empty(), "refusing to publish an empty batch");
        let range = TickRange::new(
            ticks.first().expect("nonempty").tick_number,
            ticks.last().expect("nonempty").tick_number,
        )?;
        let filename = BatchFileName::from_range(range);
        let now = self.rt.system_time();
        let mut state = self.state.lock();
        if let Ok(run_id) = prefix.trim_end_matches('/').parse::<RunId>() {
            state.runs.entry(run_id).or_insert(now);
        }
        state
            .files
            .entry(prefix.to_owned())
            .or_default()
            .insert(filename.as_str().to_owned(), encode_batch(ticks)?);
        Ok(filename)
    }

    /// Convenience for scenario tests: publish `[start, end]` with one tick
    /// every `interval`.
    pub fn publish_range(
        &self,
        prefix: &str,
        start: i64,
        end: i64,
        interval: i64,
    ) -> anyhow::Result<BatchFileName> {
        let ticks: Vec<_> = (start..=end)
            .step_by(interval as usize)
            .map(|tick_number| TickRecord {
                tick_number,
                payload: tick_number.to_be_bytes().to_vec(),
            })
            .collect();
        self.publish_batch(prefix, &ticks)
    }

    /// The next `n` storage operations fail with an injected error.
    pub fn inject_failures(&self, n: u32) {
        self.state.lock().failures_remaining = n;
    }

    fn guard(&self, state: &mut State, op: &'static str) -> anyhow::Result<()> {
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            anyhow::bail!("injected storage failure during {op}");
        }
        Ok(())
    }

    fn list(
        &self,
        prefix: &str,
        continuation_token: Option<&str>,
        max_count: usize,
        range: Option<TickRange>,
    ) -> anyhow::Result<BatchListPage> {
        let mut state = self.state.lock();
        self.guard(&mut state, "list_batch_files")?;
        let files: Vec<BatchFileName> = state
            .files
            .get(prefix)
            .into_iter()
            .flat_map(|files| files.keys())
            .filter(|name| match continuation_token {
                Some(token) => name.as_str() > token,
                None => true,
            })
            .map(|name| name.parse().expect("published names match the grammar"))
            .filter(|f: &BatchFileName| match range {
                Some(range) => f.range().intersects(&range),
                None => true,
            })
            .take(max_count)
            .collect();
        let next_token = files
            .last()
            .map(|f| f.as_str().to_owned())
            .or_else(|| continuation_token.map(str::to_owned));
        Ok(BatchListPage { files, next_token })
    }
}

#[async_trait]
impl<RT: Runtime> BatchStorage for TestStorage<RT> {
    async fn list_batch_files(
        &self,
        prefix: &str,
        continuation_token: Option<&str>,
        max_count: usize,
    ) -> anyhow::Result<BatchListPage> {
        self.list(prefix, continuation_token, max_count, None)
    }

    async fn list_batch_files_in_range(
        &self,
        prefix: &str,
        continuation_token: Option<&str>,
        max_count: usize,
        range: TickRange,
    ) -> anyhow::Result<BatchListPage> {
        self.list(prefix, continuation_token, max_count, Some(range))
    }

    async fn read_batch(
        &self,
        prefix: &str,
        filename: &BatchFileName,
    ) -> anyhow::Result<Vec<TickRecord>> {
        let mut state = self.state.lock();
        self.guard(&mut state, "read_batch")?;
        let bytes = state
            .files
            .get(prefix)
            .and_then(|files| files.get(filename.as_str()))
            .ok_or_else(|| anyhow::anyhow!("no such batch file {prefix}{filename}"))?;
        decode_batch(bytes)
    }

    async fn list_runs(&self) -> anyhow::Result<Vec<RunInfo>> {
        let mut state = self.state.lock();
        self.guard(&mut state, "list_runs")?;
        Ok(state
            .runs
            .iter()
            .map(|(run_id, first_seen)| RunInfo {
                run_id: run_id.clone(),
                first_seen: *first_seen,
            })
            .collect())
    }
}
