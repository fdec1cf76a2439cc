use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::types::unix_timestamp_millis;

/// Wall-clock source for pointer staleness checks.
pub trait Clock: Send + Sync {
    fn now_unix_millis(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_millis(&self) -> u64 {
        unix_timestamp_millis()
    }
}

/// Manually advanced clock for tests and replay tooling.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now_unix_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(now_unix_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_unix_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
