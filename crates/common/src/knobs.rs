//! Environment-variable overridable tunables.

use std::{
    num::NonZeroUsize,
    str::FromStr,
    sync::LazyLock,
    time::Duration,
};

/// Reads `name` from the environment, falling back to `default`. Panics on a
/// malformed value: a typo'd override should fail loudly at startup, not
/// silently run with the default.
pub fn env_config<T: FromStr>(name: &str, default: T) -> T
where
    T::Err: std::fmt::Debug,
{
    match std::env::var(name) {
        Ok(value) => match value.parse() {
            Ok(parsed) => {
                tracing::info!("Overriding {name} to {value}");
                parsed
            },
            Err(e) => panic!("failed to parse ${name}={value}: {e:?}"),
        },
        Err(_) => default,
    }
}

/// Bound on any single coordinator statement or storage call.
pub static COORDINATOR_TIMEOUT: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_secs(env_config("COORDINATOR_TIMEOUT_SECONDS", 30))
});

/// Upper bound on concurrently checked-out coordinator connections per
/// process. Kept far below the instance count; see the connection release
/// discipline in the batch loop.
pub static COORDINATOR_MAX_CONNECTIONS: LazyLock<usize> =
    LazyLock::new(|| env_config("COORDINATOR_MAX_CONNECTIONS", 16));

/// Idle pooled connections older than this are closed by the reaper.
pub static COORDINATOR_INACTIVE_CONNECTION_LIFETIME: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_secs(env_config("COORDINATOR_INACTIVE_CONNECTION_LIFETIME_SECONDS", 300))
});

/// Per-connection cap on cached prepared statements.
pub static COORDINATOR_MAX_CACHED_STATEMENTS: LazyLock<NonZeroUsize> = LazyLock::new(|| {
    NonZeroUsize::new(env_config("COORDINATOR_MAX_CACHED_STATEMENTS", 128))
        .expect("COORDINATOR_MAX_CACHED_STATEMENTS must be nonzero")
});

/// First retry delay after a failed loop iteration.
pub static INDEXER_INITIAL_BACKOFF: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_millis(env_config("INDEXER_INITIAL_BACKOFF_MS", 500))
});

/// Cap on the retry delay after repeated loop failures.
pub static INDEXER_MAX_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("INDEXER_MAX_BACKOFF_SECONDS", 30)));
