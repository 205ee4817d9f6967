//! Jittered exponential backoff for worker retry loops.

use std::time::Duration;

use rand::{
    Rng,
    RngCore,
};

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            failures: 0,
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failure and return how long to wait before retrying: the
    /// capped exponential for the current failure count, scaled by a random
    /// factor in `[0, 1)` (full jitter).
    pub fn fail(&mut self, rng: &mut dyn RngCore) -> Duration {
        let exponent = self.failures.min(31);
        self.failures += 1;
        let uncapped = self
            .initial
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max);
        uncapped.min(self.max).mul_f64(rng.random::<f64>())
    }
}
