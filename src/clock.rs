use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Zero-argument nanosecond time source. The connection samples it on frame ingress for
///  liveness and receives it as a parameter on conductor duty cycles, so a single
///  conductor tick sees one consistent `now`.
pub trait Clock: Send + Sync + 'static {
    fn nanos(&self) -> u64;
}

/// Monotonic production clock: nanoseconds since the clock instance was created.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> MonotonicClock {
        MonotonicClock { origin: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// A clock that only moves when told to - for tests and deterministic simulations.
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now: u64) -> ManualClock {
        ManualClock { now: AtomicU64::new(now) }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::Release);
    }

    pub fn advance(&self, delta: u64) {
        self.now.fetch_add(delta, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn nanos(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}
