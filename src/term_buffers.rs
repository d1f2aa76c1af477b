use crate::log_buffer::LogBuffer;
use crate::position::TERM_RING_SIZE;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
#[cfg(test)] use mockall::automock;

/// The log allocation behind one connection: exactly three raw term buffers of identical
///  power-of-two capacity. The connection owns the allocation and releases it via
///  `close()`; how the buffers come into being (shared memory mapping, huge pages, ...)
///  is the allocator's business.
#[cfg_attr(test, automock)]
pub trait TermBuffers: Send + Sync + 'static {
    /// the three raw logs, in ring order
    fn raw_logs(&self) -> Vec<Arc<LogBuffer>>;

    /// release the allocation; the raw logs must not be touched afterwards
    fn close(&self);
}

/// Process-heap implementation of [`TermBuffers`], for embedded single-process use and
///  tests. `close()` has nothing to unmap and only flags the handle.
pub struct HeapTermBuffers {
    logs: Vec<Arc<LogBuffer>>,
    closed: AtomicBool,
}

impl HeapTermBuffers {
    pub fn new(term_capacity: usize) -> HeapTermBuffers {
        HeapTermBuffers {
            logs: (0..TERM_RING_SIZE).map(|_| Arc::new(LogBuffer::new(term_capacity))).collect(),
            closed: AtomicBool::new(false),
        }
    }
}

impl TermBuffers for HeapTermBuffers {
    fn raw_logs(&self) -> Vec<Arc<LogBuffer>> {
        self.logs.clone()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("releasing heap term buffers");
        }
    }
}
