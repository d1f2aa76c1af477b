//! Named atomic counters and lock-free position handles.
//!
//! Positions are the backbone of cross-thread progress publication: 64-bit counters
//!  written with release stores and read with acquire loads, so that a reader observing
//!  a position also observes every byte written below it. In a full deployment they are
//!  backed by a shared-memory counters file; the in-process [`SharedPosition`] here
//!  carries the same memory-ordering contract.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
#[cfg(test)] use mockall::automock;

/// Write side of a position counter, owned by the connection.
#[cfg_attr(test, automock)]
pub trait PositionReporter: Send + Sync + 'static {
    fn report(&self, position: u64);
    fn close(&self);
}

/// Read side of a position counter owned elsewhere (e.g. the subscriber's consumption
///  point, which the subscriber advances and the connection only observes).
#[cfg_attr(test, automock)]
pub trait PositionIndicator: Send + Sync + 'static {
    fn position(&self) -> u64;
    fn close(&self);
}

/// A position counter on the process heap. Clone the `Arc` to hand the read side and the
///  write side to different threads.
#[derive(Default)]
pub struct SharedPosition {
    value: AtomicU64,
}

impl SharedPosition {
    pub fn new() -> Arc<SharedPosition> {
        Arc::new(SharedPosition { value: AtomicU64::new(0) })
    }
}

impl PositionReporter for SharedPosition {
    fn report(&self, position: u64) {
        self.value.store(position, Ordering::Release);
    }

    fn close(&self) {}
}

impl PositionIndicator for SharedPosition {
    fn position(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    fn close(&self) {}
}

/// numeric type ids for the counters, part of the observable counters contract
pub const STATUS_MESSAGES_SENT_TYPE_ID: u32 = 1;
pub const FLOW_CONTROL_UNDER_RUNS_TYPE_ID: u32 = 2;
pub const FLOW_CONTROL_OVER_RUNS_TYPE_ID: u32 = 3;

/// A single named monotonic event counter.
pub struct Counter {
    type_id: u32,
    label: String,
    value: AtomicU64,
}

impl Counter {
    pub fn new(type_id: u32, label: String) -> Counter {
        Counter {
            type_id,
            label,
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn type_id(&self) -> u32 {
        self.type_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// The per-connection system counters, labelled with the connection key so that an
///  operator scanning a counters dump can attribute them.
pub struct SystemCounters {
    status_messages_sent: Counter,
    flow_control_under_runs: Counter,
    flow_control_over_runs: Counter,
}

impl SystemCounters {
    pub fn new(session_id: u32, stream_id: u32) -> Arc<SystemCounters> {
        let key = format!("sessionId={} streamId={}", session_id, stream_id);

        Arc::new(SystemCounters {
            status_messages_sent: Counter::new(
                STATUS_MESSAGES_SENT_TYPE_ID,
                format!("status-messages-sent: {}", key),
            ),
            flow_control_under_runs: Counter::new(
                FLOW_CONTROL_UNDER_RUNS_TYPE_ID,
                format!("flow-control-under-runs: {}", key),
            ),
            flow_control_over_runs: Counter::new(
                FLOW_CONTROL_OVER_RUNS_TYPE_ID,
                format!("flow-control-over-runs: {}", key),
            ),
        })
    }

    pub fn status_messages_sent(&self) -> &Counter {
        &self.status_messages_sent
    }

    pub fn flow_control_under_runs(&self) -> &Counter {
        &self.flow_control_under_runs
    }

    pub fn flow_control_over_runs(&self) -> &Counter {
        &self.flow_control_over_runs
    }

    /// point-in-time view of all counters, for observability tooling
    pub fn snapshot(&self) -> Vec<(u32, String, u64)> {
        [&self.status_messages_sent, &self.flow_control_under_runs, &self.flow_control_over_runs]
            .iter()
            .map(|c| (c.type_id(), c.label().to_owned(), c.get()))
            .collect()
    }

    pub fn log_snapshot(&self) {
        for (type_id, label, value) in self.snapshot() {
            debug!("counter [{}] {}: {}", type_id, label, value);
        }
    }
}
