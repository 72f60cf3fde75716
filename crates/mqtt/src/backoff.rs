//! Reconnect pacing for the connection kernel.
//!
//! rumqttc reconnects on the next `EventLoop::poll` after a failure, so the
//! kernel sleeps between failed polls. The wait grows geometrically from
//! `initial` by `factor` per failure and is clamped at `ceiling`. With the
//! defaults (1s, x1.5, cap 30s) that is 1.0s, 1.5s, 2.25s and so on up to 30s.
//!
//! A CONNACK resets the schedule. Without [`Backoff::with_attempt_limit`] it
//! never runs out: the device broker often returns minutes later when the
//! robot drives back into range.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackoffError {
    #[error("gave up after {0} reconnect attempts")]
    Exhausted(u32),
}

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    ceiling: Duration,
    factor: f64,
    pending: Duration,
    failures: u32,
    limit: Option<u32>,
}

impl Backoff {
    /// A `factor` below 1.0 is clamped to 1.0, which gives a constant wait.
    pub fn new(initial: Duration, ceiling: Duration, factor: f64) -> Self {
        Self {
            initial,
            ceiling,
            factor: factor.max(1.0),
            pending: initial.min(ceiling),
            failures: 0,
            limit: None,
        }
    }

    /// Stop after `limit` consecutive failures. A limit of `0` refuses the
    /// first retry.
    pub fn with_attempt_limit(mut self, limit: Option<u32>) -> Self {
        self.limit = limit;
        self
    }

    pub fn reset(&mut self) {
        self.pending = self.initial.min(self.ceiling);
        self.failures = 0;
    }

    /// Records one more failure and hands back how long to wait before
    /// polling again.
    pub fn next_delay(&mut self) -> Result<Duration, BackoffError> {
        self.failures += 1;
        match self.limit {
            Some(limit) if self.failures > limit => return Err(BackoffError::Exhausted(limit)),
            _ => {}
        }

        let wait = self.pending;
        self.pending = self.pending.mul_f64(self.factor).min(self.ceiling);
        Ok(wait)
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn pending(&self) -> Duration {
        self.pending
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 1.5)
    }
}
