//! Abstraction over core systems functionality (time, sleeping, spawning,
//! randomness) so that timing-sensitive coordination logic runs on a
//! virtualized clock in tests.

pub mod prod;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::{
    future::Future,
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

use futures::future::BoxFuture;
use rand::RngCore;

/// Handle to a spawned worker. Dropping the handle detaches the task;
/// [`SpawnHandle::shutdown`] aborts it.
pub trait SpawnHandle: Send {
    fn shutdown(&mut self);
    fn into_join_future(self: Box<Self>) -> BoxFuture<'static, anyhow::Result<()>>;
}

pub trait Runtime: Clone + Send + Sync + 'static {
    /// Sleep for the given duration.
    fn wait(&self, duration: Duration) -> BoxFuture<'static, ()>;

    /// Spawn a future on the runtime's executor.
    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle>;

    /// A (potentially virtualized) wall clock. Compare with
    /// `std::time::UNIX_EPOCH` to obtain a Unix timestamp.
    fn system_time(&self) -> SystemTime;

    /// A (potentially virtualized) monotonic clock.
    fn monotonic_now(&self) -> tokio::time::Instant;

    /// The runtime's source of randomness.
    fn rng(&self) -> Box<dyn RngCore>;

    /// Milliseconds since the Unix epoch on the runtime's wall clock.
    fn unix_timestamp_ms(&self) -> i64 {
        self.system_time()
            .duration_since(UNIX_EPOCH)
            .expect("runtime clock before 1970")
            .as_millis() as i64
    }
}
