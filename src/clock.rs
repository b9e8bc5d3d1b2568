/// Time sources for the scheduler
///
/// All engine timestamps are absolute seconds on one of these clocks. The
/// scheduler never looks at wall time directly.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::Result;

pub trait Clock: Send + Sync {
    /// Current time in seconds. Must never go backwards.
    fn now(&self) -> f64;

    /// False when the underlying time source is halted or suspended.
    fn is_running(&self) -> bool {
        true
    }

    /// Bring a halted clock back. Called by the transport on start.
    fn resume(&self) -> Result<()> {
        Ok(())
    }
}

/// Monotonic clock backed by `Instant`, zeroed at construction
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Externally driven clock for offline rendering and deterministic tests.
///
/// Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    inner: Arc<ManualClockInner>,
}

#[derive(Debug, Default)]
struct ManualClockInner {
    secs: AtomicU64,
    suspended: AtomicBool,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, secs: f64) {
        self.inner.secs.store(secs.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, secs: f64) {
        let now = self.now();
        self.set(now + secs);
    }

    pub fn suspend(&self) {
        self.inner.suspended.store(true, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.inner.secs.load(Ordering::SeqCst))
    }

    fn is_running(&self) -> bool {
        !self.inner.suspended.load(Ordering::SeqCst)
    }

    fn resume(&self) -> Result<()> {
        self.inner.suspended.store(false, Ordering::SeqCst);
        Ok(())
    }
}
