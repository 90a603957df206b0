//! Injected time source
//!
//! Consensus lease checks and replication lag accounting go through a
//! `Clock` handle passed in at construction, so tests can drive time
//! explicitly instead of sleeping against the wall clock.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Time source consulted by the consensus core and the replica sync loop.
pub trait Clock: Send + Sync {
    /// Monotonic instant for deadlines and lease windows.
    fn now(&self) -> Instant;

    /// Wall-clock seconds since the Unix epoch, for stats and logging.
    fn unix_seconds(&self) -> u64;
}

/// Production clock backed by the OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_seconds(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// Manually advanced clock for tests.
#[derive(Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<(Instant, u64)>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new((Instant::now(), 0))),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock();
        inner.0 += by;
        inner.1 += by.as_secs();
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.inner.lock().0
    }

    fn unix_seconds(&self) -> u64 {
        self.inner.lock().1
    }
}
