//! The seam between coordination and the per-class analysis writes.

use async_trait::async_trait;
use common::types::TickRecord;

/// Writes one flush worth of ticks into the analysis database.
///
/// Called exactly once per flush. Writes must be idempotent keyed on
/// `(run, tick_number)`: after a crash between a successful `process_batch`
/// and the completion marks, the same ticks are delivered again.
#[async_trait]
pub trait TickProcessor: Send + Sync {
    async fn process_batch(&self, ticks: &[TickRecord]) -> anyhow::Result<()>;
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use std::sync::Arc;

    use async_trait::async_trait;
    use common::types::TickRecord;
    use parking_lot::Mutex;

    use super::TickProcessor;

    #[derive(Default)]
    struct Inner {
        ticks: Vec<TickRecord>,
        invocations: usize,
        failures_remaining: u32,
    }

    /// Remembers everything it is handed. Stands in for a real per-class
    /// processor; duplicate ticks are kept so tests can assert there are
    /// none.
    #[derive(Clone, Default)]
    pub struct CollectingProcessor {
        inner: Arc<Mutex<Inner>>,
    }

    impl CollectingProcessor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn ticks(&self) -> Vec<TickRecord> {
            self.inner.lock().ticks.clone()
        }

        pub fn tick_numbers(&self) -> Vec<i64> {
            self.inner.lock().ticks.iter().map(|t| t.tick_number).collect()
        }

        pub fn invocations(&self) -> usize {
            self.inner.lock().invocations
        }

        /// The next `n` flushes fail after recording nothing.
        pub fn inject_failures(&self, n: u32) {
            self.inner.lock().failures_remaining = n;
        }
    }

    #[async_trait]
    impl TickProcessor for CollectingProcessor {
        async fn process_batch(&self, ticks: &[TickRecord]) -> anyhow::Result<()> {
            let mut inner = self.inner.lock();
            if inner.failures_remaining > 0 {
                inner.failures_remaining -= 1;
                anyhow::bail!("injected processor failure");
            }
            inner.invocations += 1;
            inner.ticks.extend_from_slice(ticks);
            Ok(())
        }
    }
}
