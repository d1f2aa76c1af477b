//! The raw per-term log buffer: a fixed-capacity byte region plus the two atomic words
//!  that coordinate its reuse across threads.
//!
//! A term buffer cycles through the following lifecycle, driven by the term ring:
//!
//! ```ascii
//! CLEAN --(writer rotates into the slot, appends frames)--> still CLEAN, filling up
//!       --(ring rotates past the slot)--> NEEDS_CLEANING
//!       --(conductor wins the CAS)--> IN_CLEANING --(zero-fill done)--> CLEAN
//! ```
//!
//! The state word is the whole synchronization story: the receiver thread only ever
//!  writes into a buffer it observed as CLEAN (asserted at rotation), and the conductor
//!  only zero-fills a buffer it moved to IN_CLEANING via CAS. That makes the byte region
//!  single-writer at every point in time without a lock on the frame hot path.
//!
//! The contiguous tail is published with a release store after the frame bytes are
//!  written; a reader's acquire load of the tail therefore establishes happens-before on
//!  the bytes below it.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Cleaning-handshake state of a term buffer, with its numeric wire/shared-memory contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum CleanState {
    Clean = 0,
    NeedsCleaning = 1,
    InCleaning = 2,
}

pub struct LogBuffer {
    bytes: UnsafeCell<Box<[u8]>>,
    tail: AtomicUsize,
    state: AtomicU32,
}

/// Safety: the byte region is aliased across threads, but the clean-state machine makes
///  it exclusive-writer at every point in time (see the module docs). The tail and state
///  words are atomics.
unsafe impl Sync for LogBuffer {}
unsafe impl Send for LogBuffer {}

impl LogBuffer {
    pub fn new(capacity: usize) -> LogBuffer {
        LogBuffer {
            bytes: UnsafeCell::new(vec![0; capacity].into_boxed_slice()),
            tail: AtomicUsize::new(0),
            state: AtomicU32::new(CleanState::Clean.into()),
        }
    }

    pub fn capacity(&self) -> usize {
        unsafe { (&*self.bytes.get()).len() }
    }

    /// first unfilled byte of the contiguous prefix
    pub fn tail(&self) -> usize {
        self.tail.load(Ordering::Acquire)
    }

    pub(crate) fn set_tail(&self, tail: usize) {
        self.tail.store(tail, Ordering::Release);
    }

    pub fn state(&self) -> CleanState {
        self.state.load(Ordering::Acquire)
            .try_into()
            .expect("this is a bug: the state word only ever holds CleanState values")
    }

    /// Ordered write marking the buffer as rotated out and awaiting a zero-fill.
    pub(crate) fn mark_needs_cleaning(&self) {
        self.state.store(CleanState::NeedsCleaning.into(), Ordering::Release);
    }

    /// The conductor's half of the cleaning handshake: claim the buffer for cleaning.
    ///  At most one caller wins; the writer never touches a buffer in this state.
    pub(crate) fn try_begin_cleaning(&self) -> bool {
        self.state
            .compare_exchange(
                CleanState::NeedsCleaning.into(),
                CleanState::InCleaning.into(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Zero-fill the buffer and hand it back to the ring as CLEAN. Must only be called
    ///  after winning `try_begin_cleaning`.
    pub(crate) fn clean(&self) {
        assert_eq!(self.state(), CleanState::InCleaning,
            "this is a bug: clean() requires the buffer to be claimed via try_begin_cleaning");

        unsafe {
            (&mut *self.bytes.get()).fill(0);
        }
        self.tail.store(0, Ordering::Release);
        self.state.store(CleanState::Clean.into(), Ordering::Release);
    }

    /// Read access to the raw bytes.
    ///
    /// NB: Callers must hold a tail or state observation that orders their reads against
    ///      the writer, e.g. read only below an acquire-loaded tail.
    pub unsafe fn as_slice(&self) -> &[u8] {
        &*self.bytes.get()
    }

    /// Write access to the raw bytes.
    ///
    /// NB: Callers must be the buffer's current exclusive writer under the clean-state
    ///      protocol - the receiver thread for the active / high-water terms, the
    ///      conductor while the buffer is IN_CLEANING.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn as_mut_slice(&self) -> &mut [u8] {
        &mut *self.bytes.get()
    }
}
