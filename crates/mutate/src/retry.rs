//! Bounded polling used by the conflict-retrying write paths.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, sleep_until, Instant};

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(2);

/// Retry tuning: first attempt after `initial_delay`, then one attempt per
/// `interval` until `timeout` has elapsed since the call started.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { initial_delay: Duration::ZERO, interval: DEFAULT_RETRY_INTERVAL, timeout: DEFAULT_RETRY_TIMEOUT }
    }
}

impl RetryConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout, ..Self::default() }
    }

    /// Defaults overridden by `KMUT_RETRY_INTERVAL_MS`, `KMUT_RETRY_TIMEOUT_MS`
    /// and `KMUT_RETRY_INITIAL_DELAY_MS`; unparsable values are ignored.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            initial_delay: env_millis("KMUT_RETRY_INITIAL_DELAY_MS").unwrap_or(d.initial_delay),
            interval: env_millis("KMUT_RETRY_INTERVAL_MS").unwrap_or(d.interval),
            timeout: env_millis("KMUT_RETRY_TIMEOUT_MS").unwrap_or(d.timeout),
        }
    }
}

fn env_millis(var: &str) -> Option<Duration> {
    std::env::var(var).ok().and_then(|s| s.trim().parse::<u64>().ok()).map(Duration::from_millis)
}

/// Attempt counter plus deadline for one retry loop.
pub(crate) struct Poller {
    interval: Duration,
    deadline: Instant,
    attempts: u32,
}

impl Poller {
    /// Starts the clock, then waits out the initial delay.
    pub(crate) async fn start(cfg: &RetryConfig) -> Self {
        let deadline = Instant::now() + cfg.timeout;
        if !cfg.initial_delay.is_zero() {
            sleep(cfg.initial_delay).await;
        }
        Self { interval: cfg.interval, deadline, attempts: 0 }
    }

    /// Count the attempt about to run; returns its 1-based number.
    pub(crate) fn attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Wait for the next slot. Returns false (after sleeping up to the
    /// deadline) when no further attempt fits in the budget.
    pub(crate) async fn tick(&mut self) -> bool {
        let next = Instant::now() + self.interval;
        if next > self.deadline {
            sleep_until(self.deadline).await;
            return false;
        }
        sleep_until(next).await;
        true
    }
}
