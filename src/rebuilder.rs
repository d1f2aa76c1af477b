use crate::frame_header::DataFrameHeader;
use crate::log_buffer::{CleanState, LogBuffer};
use std::sync::Arc;
use tracing::warn;

/// Per-term reassembly state: turns potentially out-of-order, potentially duplicated
///  frames into a contiguous byte sequence inside one term buffer.
///
/// Frames are copied verbatim (header included) to the term offset their header names.
///  The contiguous tail advances by scanning frame-length prefixes: a zero length marks
///  unfilled space, which is reliable because the buffer is zero-filled by the cleaning
///  handshake before the writer reaches it.
///
/// NB: Inserts are idempotent - a duplicate frame rewrites the same bytes at the same
///      offset, and a frame entirely below the tail is skipped outright.
pub struct LogRebuilder {
    buffer: Arc<LogBuffer>,
}

impl LogRebuilder {
    pub fn new(buffer: Arc<LogBuffer>) -> LogRebuilder {
        LogRebuilder { buffer }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn tail(&self) -> usize {
        self.buffer.tail()
    }

    /// the term is complete when the contiguous tail has reached the capacity
    pub fn is_complete(&self) -> bool {
        self.buffer.tail() == self.buffer.capacity()
    }

    pub fn state(&self) -> CleanState {
        self.buffer.state()
    }

    pub fn mark_needs_cleaning(&self) {
        self.buffer.mark_needs_cleaning();
    }

    pub fn try_begin_cleaning(&self) -> bool {
        self.buffer.try_begin_cleaning()
    }

    pub fn clean(&self) {
        self.buffer.clean();
    }

    /// Copy a frame into the term at the given offset and advance the contiguous tail
    ///  over whatever prefix is now gap-free.
    ///
    /// Must only be called by the receiver thread, and only while this rebuilder holds
    ///  the active or high-water term (the buffer's exclusive-writer protocol).
    pub fn insert(&self, term_offset: u32, frame: &[u8]) {
        let offset = term_offset as usize;

        if offset + frame.len() > self.buffer.capacity() {
            warn!("frame at offset {} with length {} exceeds the term capacity of {} - this is a sender-side bug, dropping",
                offset, frame.len(), self.buffer.capacity());
            return;
        }

        let tail = self.buffer.tail();
        if offset + frame.len() <= tail {
            // duplicate entirely below the tail: already part of the contiguous prefix
            return;
        }

        unsafe {
            self.buffer.as_mut_slice()[offset..offset + frame.len()].copy_from_slice(frame);
        }

        if offset <= tail {
            self.scan_tail(tail);
        }
    }

    /// Advance the tail over contiguous frames, reading each frame's length prefix out
    ///  of the buffer. A zero length is unfilled space and stops the scan.
    fn scan_tail(&self, mut tail: usize) {
        let capacity = self.buffer.capacity();
        let bytes = unsafe { self.buffer.as_slice() };

        while tail + DataFrameHeader::SERIALIZED_LEN <= capacity {
            let frame_length = u32::from_be_bytes(
                bytes[tail..tail + 4].try_into().expect("slice is exactly four bytes"),
            ) as usize;

            if frame_length == 0 {
                break;
            }
            if frame_length < DataFrameHeader::SERIALIZED_LEN || tail + frame_length > capacity {
                warn!("frame at tail {} declares a length of {} which does not fit the term - this is a sender-side bug, stopping the tail scan",
                    tail, frame_length);
                break;
            }

            tail += frame_length;
        }

        self.buffer.set_tail(tail);
    }
}
