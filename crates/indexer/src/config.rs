//! Per-instance configuration.

use std::time::Duration;

use common::types::RunId;

/// Configuration surface of one indexer instance. The defaults match a
/// steady-state deployment; tests shrink the timing knobs.
#[derive(Clone, Debug)]
pub struct IndexerConfig {
    /// Pin to this run instead of discovering the most recent one.
    pub run_id: Option<RunId>,
    /// Idle sleep between loop iterations.
    pub poll_interval: Duration,
    /// How long to wait for run metadata before giving up.
    pub max_poll_duration: Duration,
    /// Storage prefix template; `{runId}` is substituted.
    pub batch_path: String,
    /// Tick count at which the buffer emits a flush. Must be > 0.
    pub insert_batch_size: usize,
    /// Idle time since the last flush after which a non-empty buffer is
    /// flushed. Must be > 0.
    pub flush_timeout: Duration,
    /// Age at which a pending gap is declared permanent.
    pub gap_warning_timeout: Duration,
    /// Sliding-window size for the per-instance rate metrics.
    pub metrics_window: Duration,
    /// Attach the gap tracker. Off only for indexer classes that tolerate
    /// holes (e.g. sampling probes).
    pub gap_tracking: bool,
    /// Attach the tick buffer. Off means every batch goes straight through
    /// the processor and is completed individually.
    pub buffering: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            run_id: None,
            poll_interval: Duration::from_millis(1000),
            max_poll_duration: Duration::from_millis(300_000),
            batch_path: "{runId}/".to_owned(),
            insert_batch_size: 1000,
            flush_timeout: Duration::from_millis(5000),
            gap_warning_timeout: Duration::from_millis(60_000),
            metrics_window: Duration::from_secs(5),
            gap_tracking: true,
            buffering: true,
        }
    }
}

impl IndexerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.insert_batch_size > 0, "insert_batch_size must be > 0");
        anyhow::ensure!(
            !self.flush_timeout.is_zero(),
            "flush_timeout must be > 0"
        );
        anyhow::ensure!(
            !self.poll_interval.is_zero(),
            "poll_interval must be > 0"
        );
        anyhow::ensure!(
            self.metrics_window >= Duration::from_secs(1),
            "metrics_window must be at least one second"
        );
        Ok(())
    }

    pub fn batch_prefix(&self, run_id: &RunId) -> String {
        self.batch_path.replace("{runId}", run_id.as_str())
    }
}
