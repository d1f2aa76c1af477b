//! Arithmetic between `(termId, termOffset)` pairs and the stream-global byte position.
//!
//! A position is a 64-bit monotonically non-decreasing byte offset from the start of the
//!  stream. Terms have power-of-two capacity, so the position splits into a term count in
//!  the upper bits and a term offset in the lower bits:
//!
//! ```ascii
//! position = ((termId - initialTermId) << positionBitsToShift) | termOffset
//! ```
//!
//! NB: The term id subtraction wraps - term ids are 32-bit and monotonically increasing,
//!      and a stream never spans anywhere near 2^32 terms within one connection's lifetime.

/// Number of term buffers in the ring: one accepting appends, one just rotated out and
///  awaiting cleaning, one already cleaned and ready for the next rotation.
pub const TERM_RING_SIZE: usize = 3;

/// The shift that converts a term count into a byte position, i.e. `log2(termCapacity)`.
///  Only valid for power-of-two capacities - the configuration layer enforces that.
pub fn position_bits_to_shift(term_capacity: usize) -> u32 {
    term_capacity.trailing_zeros()
}

pub fn compute_position(term_id: u32, term_offset: u32, position_bits_to_shift: u32, initial_term_id: u32) -> u64 {
    let term_count = term_id.wrapping_sub(initial_term_id) as u64;
    (term_count << position_bits_to_shift) | term_offset as u64
}

pub fn term_id_from_position(position: u64, position_bits_to_shift: u32, initial_term_id: u32) -> u32 {
    initial_term_id.wrapping_add((position >> position_bits_to_shift) as u32)
}

pub fn term_offset_from_position(position: u64, position_bits_to_shift: u32) -> u32 {
    (position & ((1u64 << position_bits_to_shift) - 1)) as u32
}

/// The ring slot a term lands in. Consecutive terms cycle through the three slots, so a
///  term's slot is free again two rotations after it was rotated out.
pub fn term_id_to_ring_index(term_id: u32) -> usize {
    (term_id % TERM_RING_SIZE as u32) as usize
}

pub fn rotate_next(index: usize) -> usize {
    (index + 1) % TERM_RING_SIZE
}

pub fn rotate_previous(index: usize) -> usize {
    (index + TERM_RING_SIZE - 1) % TERM_RING_SIZE
}
