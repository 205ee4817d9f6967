//! Test [`Runtime`] with a deterministic seed and a wall clock that advances
//! in lockstep with tokio's paused test clock.
//!
//! Intended for use under `#[tokio::test(start_paused = true)]`: sleeps
//! auto-advance virtual time, and `system_time()` is derived from the same
//! virtual clock, so age-based decisions (gap timeouts, idle flushes) are
//! fully deterministic.

use std::{
    future::Future,
    sync::Arc,
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

use futures::{
    future::BoxFuture,
    FutureExt,
};
use parking_lot::Mutex;
use rand::{
    RngCore,
    SeedableRng,
};
use rand_chacha::ChaCha12Rng;

use super::{
    prod::TokioSpawnHandle,
    Runtime,
    SpawnHandle,
};

const DEFAULT_SEED: u64 = 0;

// Virtual runs start at a fixed, readable instant rather than the real
// current time so failures reproduce byte-for-byte.
const TEST_EPOCH_OFFSET: Duration = Duration::from_secs(1_700_000_000);

#[derive(Clone)]
pub struct TestRuntime {
    origin: tokio::time::Instant,
    base: SystemTime,
    rng: Arc<Mutex<ChaCha12Rng>>,
}

impl TestRuntime {
    /// Must be called from within a tokio runtime (typically a
    /// `#[tokio::test(start_paused = true)]` body).
    pub fn new() -> Self {
        Self::with_seed(DEFAULT_SEED)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            origin: tokio::time::Instant::now(),
            base: UNIX_EPOCH + TEST_EPOCH_OFFSET,
            rng: Arc::new(Mutex::new(ChaCha12Rng::seed_from_u64(seed))),
        }
    }

    /// Let virtual time pass. Yields so that any timer that fires within the
    /// window gets to run.
    pub async fn advance(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

struct SharedRng(Arc<Mutex<ChaCha12Rng>>);

impl RngCore for SharedRng {
    fn next_u32(&mut self) -> u32 {
        self.0.lock().next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.0.lock().next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.lock().fill_bytes(dest)
    }
}

impl Runtime for TestRuntime {
    fn wait(&self, duration: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(duration).boxed()
    }

    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        Box::new(TokioSpawnHandle::new(name, tokio::spawn(f)))
    }

    fn system_time(&self) -> SystemTime {
        self.base + self.origin.elapsed()
    }

    fn monotonic_now(&self) -> tokio::time::Instant {
        tokio::time::Instant::now()
    }

    fn rng(&self) -> Box<dyn RngCore> {
        Box::new(SharedRng(self.rng.clone()))
    }
}
