//! Per-instance lifecycle state and the O(1) status snapshot: binding states
//! per logical port, sliding-window rates, and the recent-error ring.

use std::{
    collections::BTreeMap,
    time::Duration,
};

use common::errors::{
    ErrorEntry,
    ErrorRing,
};
use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum IndexerState {
    Stopped,
    Running,
    Paused,
    Error,
}

impl IndexerState {
    /// The lifecycle state machine: `STOPPED -> RUNNING <-> PAUSED`,
    /// `RUNNING -> STOPPED`, `RUNNING -> ERROR` (terminal).
    pub fn validate_transition(self, to: IndexerState) -> anyhow::Result<()> {
        use IndexerState::*;
        let allowed = matches!(
            (self, to),
            (Stopped, Running) | (Running, Paused) | (Paused, Running) | (Running, Stopped)
                | (Running, Error)
        );
        anyhow::ensure!(allowed, "cannot transition indexer from {self} to {to}");
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum BindingState {
    Active,
    Waiting,
    Failed,
}

/// Status of one logical resource port.
#[derive(Clone, Debug, PartialEq)]
pub struct PortStatus {
    pub port: &'static str,
    pub state: BindingState,
    pub recent_events_per_sec: f64,
}

/// Structured status snapshot; retrieval cost is independent of how much the
/// instance has processed.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexerStatus {
    pub state: IndexerState,
    pub bindings: Vec<PortStatus>,
    pub metrics: BTreeMap<&'static str, f64>,
    pub recent_errors: Vec<ErrorEntry>,
}

pub const PORT_STORAGE: &str = "storage";
pub const PORT_COORDINATOR: &str = "coordinator";
pub const PORT_METADATA: &str = "metadataReader";
const PORTS: [&str; 3] = [PORT_STORAGE, PORT_COORDINATOR, PORT_METADATA];

pub(crate) const COUNTERS: [&str; 9] = [
    "batches_processed",
    "ticks_processed",
    "claim_conflicts",
    "read_failures",
    "permanent_gaps",
    "gap_splits",
    "split_conflicts",
    "flushes",
    "iteration_failures",
];

/// Event counter over a ring of one-second buckets plus a cumulative total.
struct WindowedCounter {
    total: u64,
    buckets: Vec<u64>,
    /// Seconds-since-origin of the bucket currently being filled.
    current_second: u64,
}

impl WindowedCounter {
    fn new(window: Duration) -> Self {
        Self {
            total: 0,
            buckets: vec![0; window.as_secs().max(1) as usize],
            current_second: 0,
        }
    }

    fn advance(&mut self, origin: Instant, now: Instant) {
        let second = now.saturating_duration_since(origin).as_secs();
        let window = self.buckets.len() as u64;
        if second.saturating_sub(self.current_second) >= window {
            self.buckets.fill(0);
        } else {
            for s in (self.current_second + 1)..=second {
                let idx = (s % window) as usize;
                self.buckets[idx] = 0;
            }
        }
        self.current_second = second;
    }

    fn record(&mut self, origin: Instant, now: Instant, n: u64) {
        self.advance(origin, now);
        self.total += n;
        let idx = (self.current_second % self.buckets.len() as u64) as usize;
        self.buckets[idx] += n;
    }

    fn rate_per_sec(&mut self, origin: Instant, now: Instant) -> f64 {
        self.advance(origin, now);
        self.buckets.iter().sum::<u64>() as f64 / self.buckets.len() as f64
    }
}

struct Binding {
    state: BindingState,
    events: WindowedCounter,
}

pub(crate) struct StatusRegistry {
    origin: Instant,
    state: Mutex<IndexerState>,
    bindings: Mutex<BTreeMap<&'static str, Binding>>,
    counters: Mutex<BTreeMap<&'static str, WindowedCounter>>,
    errors: ErrorRing,
}

impl StatusRegistry {
    pub fn new(window: Duration, origin: Instant) -> Self {
        let bindings = PORTS
            .iter()
            .map(|port| {
                (
                    *port,
                    Binding {
                        state: BindingState::Waiting,
                        events: WindowedCounter::new(window),
                    },
                )
            })
            .collect();
        let counters = COUNTERS
            .iter()
            .map(|name| (*name, WindowedCounter::new(window)))
            .collect();
        Self {
            origin,
            state: Mutex::new(IndexerState::Stopped),
            bindings: Mutex::new(bindings),
            counters: Mutex::new(counters),
            errors: ErrorRing::new(),
        }
    }

    pub fn state(&self) -> IndexerState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: IndexerState) {
        *self.state.lock() = state;
    }

    pub fn set_binding(&self, port: &'static str, state: BindingState) {
        if let Some(binding) = self.bindings.lock().get_mut(port) {
            binding.state = state;
        }
    }

    pub fn record_port_event(&self, port: &'static str, now: Instant, n: u64) {
        let mut bindings = self.bindings.lock();
        if let Some(binding) = bindings.get_mut(port) {
            binding.state = BindingState::Active;
            binding.events.record(self.origin, now, n);
        }
    }

    pub fn record(&self, counter: &'static str, now: Instant, n: u64) {
        let mut counters = self.counters.lock();
        if let Some(c) = counters.get_mut(counter) {
            c.record(self.origin, now, n);
        }
    }

    pub fn record_error(&self, entry: ErrorEntry) {
        self.errors.record(entry);
    }

    pub fn snapshot(&self, now: Instant) -> IndexerStatus {
        let bindings = {
            let mut bindings = self.bindings.lock();
            bindings
                .iter_mut()
                .map(|(port, binding)| PortStatus {
                    port,
                    state: binding.state,
                    recent_events_per_sec: binding.events.rate_per_sec(self.origin, now),
                })
                .collect()
        };
        let metrics = {
            let mut counters = self.counters.lock();
            let mut metrics = BTreeMap::new();
            for (name, counter) in counters.iter_mut() {
                metrics.insert(*name, counter.total as f64);
                // Keyed totals and rates are both fixed-cardinality, so the
                // snapshot stays O(1) in processed volume.
                let rate = counter.rate_per_sec(self.origin, now);
                metrics.insert(rate_key(name), rate);
            }
            metrics
        };
        IndexerStatus {
            state: self.state(),
            bindings,
            metrics,
            recent_errors: self.errors.snapshot(),
        }
    }
}

fn rate_key(name: &'static str) -> &'static str {
    match name {
        "batches_processed" => "batches_processed_per_sec",
        "ticks_processed" => "ticks_processed_per_sec",
        "claim_conflicts" => "claim_conflicts_per_sec",
        "read_failures" => "read_failures_per_sec",
        "permanent_gaps" => "permanent_gaps_per_sec",
        "gap_splits" => "gap_splits_per_sec",
        "split_conflicts" => "split_conflicts_per_sec",
        "flushes" => "flushes_per_sec",
        "iteration_failures" => "iteration_failures_per_sec",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use IndexerState::*;
        assert!(Stopped.validate_transition(Running).is_ok());
        assert!(Running.validate_transition(Paused).is_ok());
        assert!(Paused.validate_transition(Running).is_ok());
        assert!(Running.validate_transition(Stopped).is_ok());
        assert!(Running.validate_transition(Error).is_ok());

        assert!(Stopped.validate_transition(Paused).is_err());
        assert!(Paused.validate_transition(Stopped).is_err());
        assert!(Error.validate_transition(Running).is_err());
        assert!(Paused.validate_transition(Error).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_windowed_counter_ages_out() {
        let origin = Instant::now();
        let mut counter = WindowedCounter::new(Duration::from_secs(5));
        counter.record(origin, origin, 50);
        assert_eq!(counter.rate_per_sec(origin, origin), 10.0);

        // Still inside the window.
        let later = origin + Duration::from_secs(3);
        assert_eq!(counter.rate_per_sec(origin, later), 10.0);

        // Aged out entirely, total survives.
        let much_later = origin + Duration::from_secs(10);
        assert_eq!(counter.rate_per_sec(origin, much_later), 0.0);
        assert_eq!(counter.total, 50);
    }
}
