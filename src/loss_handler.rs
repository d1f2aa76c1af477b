#[cfg(test)] use mockall::automock;

/// Gap detection and NAK generation for one connection. The connection feeds it every
///  accepted frame's end position and publishes its view of the contiguous tail; the
///  conductor drives its periodic scan.
///
/// Implementations are shared between the receiver thread (`tail_position`,
///  `highest_position_candidate`) and the conductor thread (`scan`) and must tolerate
///  that without blocking.
#[cfg_attr(test, automock)]
pub trait LossHandler: Send + Sync + 'static {
    /// Scan the active term for gaps, emitting NAKs as needed. Returns true if the
    ///  scanner moved on to a new term and should be serviced again soon.
    fn scan(&self) -> bool;

    /// the position up to which the stream has been contiguously rebuilt
    fn tail_position(&self) -> u64;

    /// Offer a potentially new highest observed position; returns the high-water
    ///  position the connection should publish.
    fn highest_position_candidate(&self, position: u64) -> u64;
}
