//! Subscriber-side receive engine for a term-based reliable UDP messaging transport.
//!
//! One [`connection::Connection`] tracks a single unique stream - identified by the pair
//!  `(sessionId, streamId)` arriving on one receive endpoint - and turns its datagram
//!  frames back into an ordered byte stream that subscribers consume through lock-free
//!  position counters.
//!
//! ## Design goals
//!
//! * Minimise latency on the frame path: every received datagram goes through exactly
//!   one connection, so that path is wait-free - no locks, no queues, no allocation
//! * Reassemble lossy, reordered input: frames carry their own placement (`termId`,
//!   `termOffset`), so they can be written where they belong as they arrive, and gaps
//!   are repaired by retransmission rather than by stalling delivery
//! * Bound memory and sender run-ahead with fixed-window flow control: the receiver
//!   advertises credit relative to the subscriber's consumption point, and drops (and
//!   counts) anything outside the window rather than buffering it
//! * Keep the stream's storage reusable without hot-path zeroing: terms rotate through
//!   a fixed ring of three buffers, and zero-filling happens off the frame path in the
//!   conductor's duty cycle
//!
//! ## Terms, positions and the ring
//!
//! The logical byte stream is cut into fixed-capacity *terms*, numbered by a
//!  monotonically increasing 32-bit term id. Term capacity is a power of two, so a
//!  64-bit stream *position* splits into a term count and a term offset:
//!
//! ```ascii
//! position = ((termId - initialTermId) << log2(termCapacity)) | termOffset
//! ```
//!
//! Three term buffers form a ring (`termId mod 3` picks the slot):
//!
//! * the *active* term accepts contiguous appends,
//! * the slot just rotated out holds drained bytes awaiting a zero-fill,
//! * the third slot is already cleaned, ready for the next rotation.
//!
//! Rotation happens when the active term's rebuilder reports completeness. An early
//!  fragment of term `active + 1` claims the next slot ahead of rotation (the
//!  *high-water* slot) without moving the active term, so moderate reordering across a
//!  term boundary costs nothing.
//!
//! ## Flow control
//!
//! The receiver periodically reports a *status message* `(termId, termOffset,
//!  windowSize)` back to the sender: everything below the named point is consumed, and
//!  the sender may run at most `windowSize` bytes beyond it. Status messages are
//!  emitted when the subscriber crosses into a new term, when it advances by more than
//!  the configured *gain*, or after a timeout so that a lost status message cannot
//!  stall the sender permanently.
//!
//! Ingress is policed against the same accounting: a frame below the contiguous tail
//!  is an *underrun* (duplicate or very late - dropped and counted), a frame ending
//!  beyond the advertised credit is an *overrun* (a misbehaving sender - dropped and
//!  counted). Neither is an error; both are normal network weather.
//!
//! ## Threading
//!
//! Three execution contexts share a connection, none of them ever blocking:
//!
//! * the *receiver* thread demultiplexes datagrams and inserts frames,
//! * the *conductor* thread runs periodic duties: status messages, gap scanning, term
//!   cleaning, lifecycle transitions, and eventually `close`,
//! * *subscriber* threads only read the position counters and the term bytes below
//!   them.
//!
//! Publication is by release store, observation by acquire load; the cleaning
//!  handshake (`CLEAN -> NEEDS_CLEANING -> IN_CLEANING -> CLEAN`) runs over a CAS per
//!  term buffer so that at most one cleaner runs and never races the writer.
//!
//! The collaborators a connection needs beyond its own state - loss detection / NAK
//!  generation, the status-message transport, the log allocator, the time source - are
//!  narrow traits, so the engine stays testable and the heavy machinery stays
//!  replaceable.

pub mod clock;
pub mod config;
pub mod connection;
pub mod counters;
pub mod end_point;
pub mod frame_header;
pub mod log_buffer;
pub mod loss_handler;
pub mod position;
pub mod rebuilder;
pub mod status_message;
pub mod term_buffers;
