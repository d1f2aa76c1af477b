//! The per-connection receive engine: everything that happens between a parsed data
//!  frame arriving from the receiver thread and its bytes becoming visible to the
//!  subscriber at a published position.
//!
//! A connection is keyed by `(receive endpoint, sessionId, streamId)` and owns the ring
//!  of three term buffers the stream is reassembled into. Three threads touch it, none
//!  of them ever blocking:
//!
//! * the receiver thread inserts frames and toggles status-message emission,
//! * the conductor thread runs the periodic duties (status messages, gap scan, term
//!   cleaning, lifecycle bookkeeping) and eventually closes the connection,
//! * subscriber threads observe progress through the position counters.
//!
//! Coordination is a handful of atomics: the active term id and the progress positions
//!  are published with release stores, the cleaning handshake runs over a CAS per term
//!  buffer, and fields confined to a single thread use relaxed accesses.

use crate::clock::Clock;
use crate::config::EffectiveConnectionConfig;
use crate::counters::{PositionIndicator, PositionReporter, SystemCounters};
use crate::end_point::ReceiveChannelEndpoint;
use crate::frame_header::DataFrameHeader;
use crate::log_buffer::CleanState;
use crate::loss_handler::LossHandler;
use crate::position::{
    compute_position, position_bits_to_shift, rotate_next, rotate_previous,
    term_id_from_position, term_id_to_ring_index, term_offset_from_position, TERM_RING_SIZE,
};
use crate::rebuilder::LogRebuilder;
use crate::status_message::StatusMessageSender;
use crate::term_buffers::TermBuffers;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Lifecycle status of a connection, with the numeric contract observed by the
///  conductor. Transitions are driven externally based on liveness and draining.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum ConnectionStatus {
    /// actively receiving
    Active = 1,
    /// the publication side has timed out
    Inactive = 2,
    /// drained or timed out, lingering until the conductor reclaims it
    Linger = 3,
}

pub struct Connection {
    receive_channel_endpoint: Arc<ReceiveChannelEndpoint>,
    session_id: u32,
    stream_id: u32,

    term_buffers: Arc<dyn TermBuffers>,
    rebuilders: [LogRebuilder; TERM_RING_SIZE],
    loss_handler: Arc<dyn LossHandler>,
    status_message_sender: Arc<dyn StatusMessageSender>,
    subscriber_position: Arc<dyn PositionIndicator>,
    contiguous_received_position: Arc<dyn PositionReporter>,
    highest_received_position: Arc<dyn PositionReporter>,
    clock: Arc<dyn Clock>,
    system_counters: Arc<SystemCounters>,

    /// the term currently accepting contiguous appends; release-published on rotation,
    ///  acquire-read by subscribers to order their reads of the term bytes
    active_term_id: AtomicU32,
    time_of_last_frame: AtomicU64,

    /// receiver-thread confined; `active_index == termIdToRingIndex(active_term_id)`
    ///  outside of rotation
    active_index: AtomicUsize,
    /// highest term id touched so far; always `active_term_id` or `active_term_id + 1`
    hwm_term_id: AtomicU32,
    hwm_index: AtomicUsize,

    /// conductor-thread confined lifecycle state
    status: AtomicU32,
    time_of_last_status_change: AtomicU64,

    /// conductor-thread confined status-message scheduler state
    last_sm_position: AtomicU64,
    last_sm_timestamp: AtomicU64,
    last_sm_term_id: AtomicU32,

    status_messages_enabled: AtomicBool,
    closed: AtomicBool,

    position_bits_to_shift: u32,
    initial_term_id: u32,
    /// hard bound on outstanding credit beyond the subscriber position
    term_window_size: u32,
    /// the window actually advertised in status messages
    current_window_size: u32,
    /// subscriber progress that triggers a status message between rotations/timeouts
    current_gain: u32,
    status_message_timeout: u64,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        receive_channel_endpoint: Arc<ReceiveChannelEndpoint>,
        session_id: u32,
        stream_id: u32,
        initial_term_id: u32,
        config: &EffectiveConnectionConfig,
        term_buffers: Arc<dyn TermBuffers>,
        loss_handler: Arc<dyn LossHandler>,
        status_message_sender: Arc<dyn StatusMessageSender>,
        subscriber_position: Arc<dyn PositionIndicator>,
        contiguous_received_position: Arc<dyn PositionReporter>,
        highest_received_position: Arc<dyn PositionReporter>,
        clock: Arc<dyn Clock>,
        system_counters: Arc<SystemCounters>,
    ) -> Connection {
        let rebuilders: [LogRebuilder; TERM_RING_SIZE] = term_buffers
            .raw_logs()
            .into_iter()
            .map(LogRebuilder::new)
            .collect::<Vec<_>>()
            .try_into()
            .unwrap_or_else(|_| panic!("this is a bug: the allocator must provide exactly {} term buffers", TERM_RING_SIZE));

        let term_capacity = rebuilders[0].capacity();
        assert!(term_capacity.is_power_of_two(),
            "term capacity must be a power of two, was {}", term_capacity);

        let initial_index = term_id_to_ring_index(initial_term_id);
        let bits_to_shift = position_bits_to_shift(term_capacity);
        let now = clock.nanos();

        let current_window_size = u32::min(config.term_window_size, config.initial_window_size);
        // progress threshold that trips a status message as frames are consumed
        let current_gain = u32::min(current_window_size / 4, (term_capacity / 4) as u32);

        Connection {
            receive_channel_endpoint,
            session_id,
            stream_id,
            term_buffers,
            rebuilders,
            loss_handler,
            status_message_sender,
            subscriber_position,
            contiguous_received_position,
            highest_received_position,
            clock,
            system_counters,
            active_term_id: AtomicU32::new(initial_term_id),
            time_of_last_frame: AtomicU64::new(now),
            active_index: AtomicUsize::new(initial_index),
            hwm_term_id: AtomicU32::new(initial_term_id),
            hwm_index: AtomicUsize::new(initial_index),
            status: AtomicU32::new(ConnectionStatus::Active.into()),
            time_of_last_status_change: AtomicU64::new(now),
            last_sm_position: AtomicU64::new(compute_position(initial_term_id, 0, bits_to_shift, initial_term_id)),
            // zero marks 'no SM sent yet' and triggers the initial SM on the first
            //  scheduler tick after status messages are enabled
            last_sm_timestamp: AtomicU64::new(0),
            last_sm_term_id: AtomicU32::new(initial_term_id),
            status_messages_enabled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            position_bits_to_shift: bits_to_shift,
            initial_term_id,
            term_window_size: config.term_window_size,
            current_window_size,
            current_gain,
            status_message_timeout: config.status_message_timeout_ns,
        }
    }

    pub fn receive_channel_endpoint(&self) -> &ReceiveChannelEndpoint {
        &self.receive_channel_endpoint
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Status of the connection, as set by the conductor.
    pub fn status(&self) -> ConnectionStatus {
        self.status.load(Ordering::Relaxed)
            .try_into()
            .expect("this is a bug: the status word only ever holds ConnectionStatus values")
    }

    /// the numeric status contract (`ACTIVE=1`, `INACTIVE=2`, `LINGER=3`)
    pub fn status_code(&self) -> u32 {
        self.status.load(Ordering::Relaxed)
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        self.status.store(status.into(), Ordering::Relaxed);
    }

    pub fn time_of_last_status_change(&self) -> u64 {
        self.time_of_last_status_change.load(Ordering::Relaxed)
    }

    pub fn set_time_of_last_status_change(&self, now: u64) {
        self.time_of_last_status_change.store(now, Ordering::Relaxed);
    }

    /// Time of the most recent frame from this source, read by the conductor for
    ///  liveness timeouts.
    pub fn time_of_last_frame(&self) -> u64 {
        self.time_of_last_frame.load(Ordering::Acquire)
    }

    /// Release everything the connection owns. Idempotent; no operation may be issued
    ///  after the first close.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.contiguous_received_position.close();
        self.highest_received_position.close();
        self.term_buffers.close();
        self.subscriber_position.close();
    }

    /// The conductor's half of the cleaning handshake: zero-fill at most one rotated-out
    ///  term per call. Returns 1 if work was done, else 0.
    pub fn clean_log_buffer(&self) -> u32 {
        for rebuilder in &self.rebuilders {
            if rebuilder.state() == CleanState::NeedsCleaning && rebuilder.try_begin_cleaning() {
                rebuilder.clean();
                return 1;
            }
        }

        0
    }

    /// Drive the loss handler's periodic gap scan. Returns 1 if the scanner advanced to
    ///  a new term and should be serviced again soon, else 0.
    pub fn scan_for_gaps(&self) -> u32 {
        if self.loss_handler.scan() { 1 } else { 0 }
    }

    /// Bytes buffered ahead of the subscriber, i.e. received contiguously but not yet
    ///  consumed. Single-subscriber semantics.
    pub fn remaining(&self) -> u64 {
        self.loss_handler.tail_position().saturating_sub(self.subscriber_position.position())
    }

    /// Insert a data frame into the term ring. `frame` is the complete on-wire frame,
    ///  header included, at its wire length.
    ///
    /// Frames rejected by the flow-control guard (underrun / overrun) are dropped
    ///  without touching the liveness timestamp; frames for a term outside
    ///  `{active, active + 1}` are dropped silently but still count for liveness and the
    ///  high-water candidate.
    pub fn insert_into_term(&self, header: &DataFrameHeader, frame: &[u8]) {
        let active_index = self.active_index.load(Ordering::Relaxed);
        let current_rebuilder = &self.rebuilders[active_index];
        let term_id = header.term_id;
        let active_term_id = self.active_term_id.load(Ordering::Acquire);

        let packet_position = self.calculate_position(term_id, header.term_offset);
        let current_position = self.calculate_position(active_term_id, current_rebuilder.tail() as u32);

        if self.is_flow_control_under_run(packet_position, current_position)
            || self.is_flow_control_over_run(packet_position, frame.len())
        {
            return;
        }

        if term_id == active_term_id {
            trace!("inserting frame at term {} offset {} into the active term", term_id, header.term_offset);
            current_rebuilder.insert(header.term_offset, frame);
            self.contiguous_received_position.report(self.loss_handler.tail_position());

            if current_rebuilder.is_complete() {
                let next_index = self.prepare_for_rotation(active_index, active_term_id);
                self.active_index.store(next_index, Ordering::Relaxed);
                self.hwm_index.store(next_index, Ordering::Relaxed);
                self.active_term_id.store(active_term_id.wrapping_add(1), Ordering::Release);
            }
        }
        else if term_id == active_term_id.wrapping_add(1) {
            // an early fragment of the next term - move the high-water slot forward
            //  without advancing the active term, which keeps accepting in-order frames
            if term_id != self.hwm_term_id.load(Ordering::Relaxed) {
                trace!("first frame of next term {}: pre-rotating the high-water slot", term_id);
                let next_index = self.prepare_for_rotation(active_index, active_term_id);
                self.hwm_index.store(next_index, Ordering::Relaxed);
                self.hwm_term_id.store(term_id, Ordering::Relaxed);
            }

            self.rebuilders[self.hwm_index.load(Ordering::Relaxed)].insert(header.term_offset, frame);
        }
        else {
            // below active is already covered by the underrun guard; beyond active + 1
            //  cannot be reassembled yet - drop, but fall through to the liveness update
            debug!("dropping frame for term {} (active term is {})", term_id, active_term_id);
        }

        self.time_of_last_frame.store(self.clock.nanos(), Ordering::Release);
        self.highest_received_position.report(self.loss_handler.highest_position_candidate(packet_position));
    }

    /// Inform the loss handler of a potentially new high position without inserting -
    ///  used for frames the dispatcher consumes itself (e.g. heartbeats).
    pub fn highest_position_candidate(&self, header: &DataFrameHeader) {
        let packet_position = self.calculate_position(header.term_id, header.term_offset);

        self.time_of_last_frame.store(self.clock.nanos(), Ordering::Release);
        self.loss_handler.highest_position_candidate(packet_position);
    }

    /// Emit a status message if any trigger fires: no SM sent yet, the subscriber
    ///  crossed into a new term, progress beyond the gain, or the timeout elapsed.
    ///
    /// NB: The work count is inverted - 0 after emitting, 1 when idle. The conductor's
    ///      idle strategy consumes it this way round.
    pub fn send_pending_status_messages(&self, now: u64) -> u32 {
        // not yet added to the dispatcher: anything received would be dropped anyway
        if !self.status_messages_enabled.load(Ordering::Acquire) {
            return 0;
        }

        let position = self.subscriber_position.position();
        let current_sm_term_id = term_id_from_position(position, self.position_bits_to_shift, self.initial_term_id);
        let current_sm_tail = term_offset_from_position(position, self.position_bits_to_shift);

        if self.last_sm_timestamp.load(Ordering::Relaxed) == 0 {
            return self.send_status_message(current_sm_term_id, current_sm_tail, position, now);
        }

        if current_sm_term_id != self.last_sm_term_id.load(Ordering::Relaxed) {
            return self.send_status_message(current_sm_term_id, current_sm_tail, position, now);
        }

        if position.saturating_sub(self.last_sm_position.load(Ordering::Relaxed)) > self.current_gain as u64 {
            return self.send_status_message(current_sm_term_id, current_sm_tail, position, now);
        }

        // send on timeout so a lost SM cannot stall the sender
        if self.last_sm_timestamp.load(Ordering::Relaxed) + self.status_message_timeout < now {
            return self.send_status_message(current_sm_term_id, current_sm_tail, position, now);
        }

        1
    }

    /// Called by the receiver thread once the connection is added to the dispatcher.
    pub fn enable_status_messages(&self) {
        self.status_messages_enabled.store(true, Ordering::Release);
    }

    /// Called by the receiver thread once the connection is removed from the dispatcher.
    pub fn disable_status_messages(&self) {
        self.status_messages_enabled.store(false, Ordering::Release);
    }

    fn send_status_message(&self, term_id: u32, term_offset: u32, position: u64, now: u64) -> u32 {
        trace!("sending status message: term {} offset {} window {}", term_id, term_offset, self.current_window_size);
        self.system_counters.status_messages_sent().inc();

        self.status_message_sender.send(term_id, term_offset, self.current_window_size);
        self.last_sm_term_id.store(term_id, Ordering::Relaxed);
        self.last_sm_timestamp.store(now, Ordering::Relaxed);
        self.last_sm_position.store(position, Ordering::Relaxed);

        0
    }

    fn calculate_position(&self, term_id: u32, term_offset: u32) -> u64 {
        compute_position(term_id, term_offset, self.position_bits_to_shift, self.initial_term_id)
    }

    fn is_flow_control_under_run(&self, packet_position: u64, current_position: u64) -> bool {
        let is_under_run = packet_position < current_position;

        if is_under_run {
            debug!("frame at position {} is behind the contiguous tail {} - dropping", packet_position, current_position);
            self.system_counters.flow_control_under_runs().inc();
        }

        is_under_run
    }

    fn is_flow_control_over_run(&self, packet_position: u64, length: usize) -> bool {
        let window_limit = self.subscriber_position.position() + self.term_window_size as u64;
        let is_over_run = packet_position + length as u64 > window_limit;

        if is_over_run {
            debug!("frame ending at position {} exceeds the advertised window limit {} - dropping", packet_position + length as u64, window_limit);
            self.system_counters.flow_control_over_runs().inc();
        }

        is_over_run
    }

    /// Rotate the ring forward by one slot. The slot two behind the active term is
    ///  handed to the cleaning handshake; the slot being rotated into must be clean
    ///  unless an early next-term fragment already claimed it.
    fn prepare_for_rotation(&self, active_index: usize, active_term_id: u32) -> usize {
        let next_index = rotate_next(active_index);

        if next_index != self.hwm_index.load(Ordering::Relaxed) {
            self.ensure_clean(next_index, active_term_id.wrapping_add(1));
        }

        self.rebuilders[rotate_previous(active_index)].mark_needs_cleaning();

        next_index
    }

    fn ensure_clean(&self, index: usize, term_id: u32) {
        let state = self.rebuilders[index].state();
        if state != CleanState::Clean {
            // cleaning has fallen behind the rotation - a broken conductor, not a
            //  network condition
            panic!(
                "term buffer for channel {} streamId={} term {} is not clean (state {:?}): cleaning has fallen behind",
                self.receive_channel_endpoint.channel(), self.stream_id, term_id, state,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::counters::{MockPositionIndicator, MockPositionReporter, SharedPosition};
    use crate::log_buffer::LogBuffer;
    use crate::loss_handler::MockLossHandler;
    use crate::status_message::MockStatusMessageSender;
    use crate::term_buffers::{HeapTermBuffers, MockTermBuffers};
    use bytes::BytesMut;
    use mockall::predicate::eq;
    use rstest::rstest;
    use std::net::SocketAddr;

    const TERM_CAPACITY: usize = 65536;
    const INITIAL_TERM_ID: u32 = 7;
    const INITIAL_WINDOW_SIZE: u32 = 32768;
    const TERM_WINDOW_SIZE: u32 = 32768;
    const CURRENT_GAIN: u64 = 8192;
    const SM_TIMEOUT_NS: u64 = 1_000_000_000;
    const FRAME_LENGTH: u32 = 1024;

    struct Harness {
        connection: Connection,
        raw_logs: Vec<Arc<LogBuffer>>,
        subscriber_position: Arc<SharedPosition>,
        contiguous_position: Arc<SharedPosition>,
        highest_position: Arc<SharedPosition>,
        clock: Arc<ManualClock>,
        counters: Arc<SystemCounters>,
    }

    impl Harness {
        fn insert(&self, term_id: u32, term_offset: u32) {
            let (header, frame) = frame(term_id, term_offset, FRAME_LENGTH);
            self.connection.insert_into_term(&header, &frame);
        }

        /// insert a full term's worth of frames, advancing the subscriber alongside the
        ///  way a draining consumer would
        fn fill_term(&self, term_id: u32) {
            let term_base = compute_position(term_id, 0, 16, INITIAL_TERM_ID);
            for term_offset in (0..TERM_CAPACITY as u32).step_by(FRAME_LENGTH as usize) {
                self.insert(term_id, term_offset);
                self.subscriber_position.report(term_base + term_offset as u64 + FRAME_LENGTH as u64);
            }
        }
    }

    fn frame(term_id: u32, term_offset: u32, frame_length: u32) -> (DataFrameHeader, Vec<u8>) {
        let header = DataFrameHeader {
            frame_length,
            session_id: 5,
            stream_id: 9,
            term_id,
            term_offset,
        };
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        buf.resize(frame_length as usize, 0x5a);
        (header, buf.to_vec())
    }

    fn tracking_loss_handler() -> MockLossHandler {
        let mut loss_handler = MockLossHandler::new();
        loss_handler.expect_tail_position().returning(|| 0);
        loss_handler.expect_highest_position_candidate().returning(|p| p);
        loss_handler
    }

    fn harness(loss_handler: MockLossHandler, status_message_sender: MockStatusMessageSender) -> Harness {
        let endpoint = Arc::new(ReceiveChannelEndpoint::new(
            "udp://239.0.0.1:40456",
            SocketAddr::from(([127, 0, 0, 1], 40456)),
        ));
        let term_buffers = Arc::new(HeapTermBuffers::new(TERM_CAPACITY));
        let raw_logs = term_buffers.raw_logs();
        let subscriber_position = SharedPosition::new();
        let contiguous_position = SharedPosition::new();
        let highest_position = SharedPosition::new();
        let clock = Arc::new(ManualClock::new(100));
        let counters = SystemCounters::new(5, 9);

        let config = EffectiveConnectionConfig {
            term_capacity: TERM_CAPACITY,
            term_window_size: TERM_WINDOW_SIZE,
            initial_window_size: INITIAL_WINDOW_SIZE,
            status_message_timeout_ns: SM_TIMEOUT_NS,
        };

        let connection = Connection::new(
            endpoint,
            5,
            9,
            INITIAL_TERM_ID,
            &config,
            term_buffers,
            Arc::new(loss_handler),
            Arc::new(status_message_sender),
            subscriber_position.clone(),
            contiguous_position.clone(),
            highest_position.clone(),
            clock.clone(),
            counters.clone(),
        );

        Harness {
            connection,
            raw_logs,
            subscriber_position,
            contiguous_position,
            highest_position,
            clock,
            counters,
        }
    }

    #[test]
    fn test_initial_state() {
        let harness = harness(tracking_loss_handler(), MockStatusMessageSender::new());

        assert_eq!(harness.connection.session_id(), 5);
        assert_eq!(harness.connection.stream_id(), 9);
        assert_eq!(harness.connection.status(), ConnectionStatus::Active);
        assert_eq!(harness.connection.status_code(), 1);
        assert_eq!(harness.connection.time_of_last_frame(), 100);
        assert_eq!(harness.connection.time_of_last_status_change(), 100);
        // initial term 7 occupies ring slot 7 mod 3 == 1
        assert_eq!(harness.connection.active_index.load(Ordering::Relaxed), 1);
    }

    #[rstest]
    #[case::active(ConnectionStatus::Active, 1)]
    #[case::inactive(ConnectionStatus::Inactive, 2)]
    #[case::linger(ConnectionStatus::Linger, 3)]
    fn test_status_numeric_contract(#[case] status: ConnectionStatus, #[case] code: u32) {
        let harness = harness(tracking_loss_handler(), MockStatusMessageSender::new());

        harness.connection.set_status(status);
        assert_eq!(harness.connection.status(), status);
        assert_eq!(harness.connection.status_code(), code);
    }

    #[test]
    fn test_lifecycle_timestamps() {
        let harness = harness(tracking_loss_handler(), MockStatusMessageSender::new());

        harness.connection.set_time_of_last_status_change(4711);
        assert_eq!(harness.connection.time_of_last_status_change(), 4711);
    }

    #[test]
    fn test_happy_path_append_fills_term_and_rotates() {
        let harness = harness(tracking_loss_handler(), MockStatusMessageSender::new());

        harness.fill_term(INITIAL_TERM_ID);

        // term 7 (slot 1) is complete and the ring rotated to term 8 (slot 2)
        assert_eq!(harness.raw_logs[1].tail(), TERM_CAPACITY);
        assert_eq!(harness.connection.active_term_id.load(Ordering::Acquire), 8);
        assert_eq!(harness.connection.active_index.load(Ordering::Relaxed), 2);
        assert_eq!(harness.connection.hwm_index.load(Ordering::Relaxed), 2);
        // the slot two behind the new active term is handed to the cleaning handshake
        assert_eq!(harness.raw_logs[0].state(), CleanState::NeedsCleaning);
        assert_eq!(harness.raw_logs[2].state(), CleanState::Clean);
    }

    #[test]
    fn test_no_rotation_while_term_is_incomplete() {
        let harness = harness(tracking_loss_handler(), MockStatusMessageSender::new());

        for term_offset in (0..(TERM_CAPACITY as u32 - FRAME_LENGTH)).step_by(FRAME_LENGTH as usize) {
            harness.insert(INITIAL_TERM_ID, term_offset);
            harness.subscriber_position.report(term_offset as u64 + FRAME_LENGTH as u64);
        }

        assert_eq!(harness.connection.active_term_id.load(Ordering::Acquire), INITIAL_TERM_ID);
        assert_eq!(harness.raw_logs[1].tail(), TERM_CAPACITY - FRAME_LENGTH as usize);
    }

    #[test]
    fn test_early_next_term_fragment_pre_rotates_the_high_water_slot() {
        let harness = harness(tracking_loss_handler(), MockStatusMessageSender::new());

        // subscriber credit must cover the next-term frame's position
        harness.subscriber_position.report(40000);
        harness.insert(INITIAL_TERM_ID + 1, 0);

        // the fragment landed in slot 2 while the active term is still 7
        assert_eq!(harness.connection.active_term_id.load(Ordering::Acquire), INITIAL_TERM_ID);
        assert_eq!(harness.connection.active_index.load(Ordering::Relaxed), 1);
        assert_eq!(harness.connection.hwm_term_id.load(Ordering::Relaxed), INITIAL_TERM_ID + 1);
        assert_eq!(harness.connection.hwm_index.load(Ordering::Relaxed), 2);
        assert_eq!(harness.raw_logs[2].tail(), FRAME_LENGTH as usize);
        assert_eq!(harness.raw_logs[1].tail(), 0);

        // the active term keeps accepting in-order frames
        harness.insert(INITIAL_TERM_ID, 0);
        assert_eq!(harness.raw_logs[1].tail(), FRAME_LENGTH as usize);

        // a second early fragment must not pre-rotate again
        harness.insert(INITIAL_TERM_ID + 1, FRAME_LENGTH);
        assert_eq!(harness.connection.hwm_index.load(Ordering::Relaxed), 2);
        assert_eq!(harness.raw_logs[2].tail(), 2 * FRAME_LENGTH as usize);
    }

    #[test]
    fn test_flow_control_under_run_drops_the_frame() {
        let harness = harness(tracking_loss_handler(), MockStatusMessageSender::new());

        for term_offset in (0..4096).step_by(FRAME_LENGTH as usize) {
            harness.insert(INITIAL_TERM_ID, term_offset);
        }
        assert_eq!(harness.raw_logs[1].tail(), 4096);

        harness.clock.set(999);
        harness.insert(INITIAL_TERM_ID, 0);

        assert_eq!(harness.counters.flow_control_under_runs().get(), 1);
        assert_eq!(harness.raw_logs[1].tail(), 4096);
        // a frame rejected by the flow-control guard does not count for liveness
        assert_ne!(harness.connection.time_of_last_frame(), 999);
    }

    #[test]
    fn test_flow_control_over_run_drops_the_frame() {
        let harness = harness(tracking_loss_handler(), MockStatusMessageSender::new());

        harness.clock.set(999);
        harness.insert(INITIAL_TERM_ID, TERM_WINDOW_SIZE);

        assert_eq!(harness.counters.flow_control_over_runs().get(), 1);
        assert_eq!(harness.raw_logs[1].tail(), 0);
        assert_ne!(harness.connection.time_of_last_frame(), 999);
    }

    #[test]
    fn test_frame_at_the_window_limit_is_accepted() {
        let harness = harness(tracking_loss_handler(), MockStatusMessageSender::new());

        harness.insert(INITIAL_TERM_ID, TERM_WINDOW_SIZE - FRAME_LENGTH);

        assert_eq!(harness.counters.flow_control_over_runs().get(), 0);
    }

    #[test]
    fn test_frame_beyond_next_term_is_dropped_but_counts_for_liveness() {
        let harness = harness(tracking_loss_handler(), MockStatusMessageSender::new());

        // subscriber far enough ahead that the frame passes the window check
        harness.subscriber_position.report(2 * TERM_CAPACITY as u64 - 1024);
        harness.clock.set(777);
        harness.insert(INITIAL_TERM_ID + 2, 0);

        assert!(harness.raw_logs.iter().all(|log| log.tail() == 0));
        assert_eq!(harness.counters.flow_control_under_runs().get(), 0);
        assert_eq!(harness.counters.flow_control_over_runs().get(), 0);
        assert_eq!(harness.connection.time_of_last_frame(), 777);
    }

    #[test]
    fn test_accepted_frame_updates_liveness_timestamp() {
        let harness = harness(tracking_loss_handler(), MockStatusMessageSender::new());

        harness.clock.set(12345);
        harness.insert(INITIAL_TERM_ID, 0);

        assert_eq!(harness.connection.time_of_last_frame(), 12345);
    }

    #[test]
    fn test_contiguous_position_is_published_from_the_loss_handler() {
        let mut loss_handler = MockLossHandler::new();
        loss_handler.expect_tail_position().returning(|| 4242);
        loss_handler.expect_highest_position_candidate().returning(|p| p);
        let harness = harness(loss_handler, MockStatusMessageSender::new());

        harness.insert(INITIAL_TERM_ID, 0);

        assert_eq!(harness.contiguous_position.position(), 4242);
    }

    #[test]
    fn test_highest_position_is_published_from_the_loss_handler_candidate() {
        let mut loss_handler = MockLossHandler::new();
        loss_handler.expect_tail_position().returning(|| 0);
        loss_handler.expect_highest_position_candidate()
            .with(eq(2048u64))
            .returning(|p| p + 7);
        let harness = harness(loss_handler, MockStatusMessageSender::new());

        harness.insert(INITIAL_TERM_ID, 2048);

        assert_eq!(harness.highest_position.position(), 2055);
    }

    #[test]
    fn test_highest_position_candidate_without_insert() {
        let mut loss_handler = MockLossHandler::new();
        loss_handler.expect_highest_position_candidate()
            .with(eq(512u64))
            .times(1)
            .returning(|p| p);
        let harness = harness(loss_handler, MockStatusMessageSender::new());

        harness.clock.set(321);
        let (header, _) = frame(INITIAL_TERM_ID, 512, FRAME_LENGTH);
        harness.connection.highest_position_candidate(&header);

        assert_eq!(harness.connection.time_of_last_frame(), 321);
        assert!(harness.raw_logs.iter().all(|log| log.tail() == 0));
    }

    #[test]
    #[should_panic(expected = "not clean")]
    fn test_rotation_into_a_dirty_slot_panics() {
        let harness = harness(tracking_loss_handler(), MockStatusMessageSender::new());

        // two full terms without the conductor ever cleaning: the second rotation finds
        //  its target slot still NEEDS_CLEANING
        harness.fill_term(INITIAL_TERM_ID);
        harness.fill_term(INITIAL_TERM_ID + 1);
    }

    #[test]
    fn test_clean_log_buffer_handshake() {
        let harness = harness(tracking_loss_handler(), MockStatusMessageSender::new());

        assert_eq!(harness.connection.clean_log_buffer(), 0);

        harness.fill_term(INITIAL_TERM_ID);
        assert_eq!(harness.raw_logs[0].state(), CleanState::NeedsCleaning);

        assert_eq!(harness.connection.clean_log_buffer(), 1);
        assert_eq!(harness.raw_logs[0].state(), CleanState::Clean);

        assert_eq!(harness.connection.clean_log_buffer(), 0);
    }

    #[test]
    fn test_cleaning_keeps_the_ring_rotating() {
        let harness = harness(tracking_loss_handler(), MockStatusMessageSender::new());

        for term in INITIAL_TERM_ID..INITIAL_TERM_ID + 4 {
            harness.fill_term(term);
            assert_eq!(harness.connection.clean_log_buffer(), 1);
        }

        assert_eq!(harness.connection.active_term_id.load(Ordering::Acquire), INITIAL_TERM_ID + 4);
    }

    #[rstest]
    #[case::scanner_advanced(true, 1)]
    #[case::scanner_lazy(false, 0)]
    fn test_scan_for_gaps_reports_the_loss_handler_work(#[case] advanced: bool, #[case] expected: u32) {
        let mut loss_handler = MockLossHandler::new();
        loss_handler.expect_scan().times(1).return_const(advanced);
        let harness = harness(loss_handler, MockStatusMessageSender::new());

        assert_eq!(harness.connection.scan_for_gaps(), expected);
    }

    #[rstest]
    #[case::bytes_buffered(10_000, 4_000, 6_000)]
    #[case::fully_drained(10_000, 10_000, 0)]
    #[case::subscriber_ahead_clamps_to_zero(10_000, 15_000, 0)]
    fn test_remaining(#[case] tail: u64, #[case] subscriber: u64, #[case] expected: u64) {
        let mut loss_handler = MockLossHandler::new();
        loss_handler.expect_tail_position().returning(move || tail);
        let harness = harness(loss_handler, MockStatusMessageSender::new());

        harness.subscriber_position.report(subscriber);

        assert_eq!(harness.connection.remaining(), expected);
    }

    #[test]
    fn test_no_status_messages_before_enabled() {
        let harness = harness(tracking_loss_handler(), MockStatusMessageSender::new());

        assert_eq!(harness.connection.send_pending_status_messages(500), 0);
        assert_eq!(harness.counters.status_messages_sent().get(), 0);
    }

    #[test]
    fn test_initial_status_message_after_enable() {
        let mut sender = MockStatusMessageSender::new();
        sender.expect_send()
            .with(eq(INITIAL_TERM_ID), eq(0u32), eq(INITIAL_WINDOW_SIZE))
            .times(1)
            .return_const(());
        let harness = harness(tracking_loss_handler(), sender);

        harness.connection.enable_status_messages();

        assert_eq!(harness.connection.send_pending_status_messages(500), 0);
        assert_eq!(harness.counters.status_messages_sent().get(), 1);

        // no trigger fires on the next tick
        assert_eq!(harness.connection.send_pending_status_messages(501), 1);
        assert_eq!(harness.counters.status_messages_sent().get(), 1);
    }

    #[test]
    fn test_status_message_on_subscriber_progress_beyond_the_gain() {
        let mut sender = MockStatusMessageSender::new();
        sender.expect_send().times(2).return_const(());
        let harness = harness(tracking_loss_handler(), sender);

        harness.connection.enable_status_messages();
        assert_eq!(harness.connection.send_pending_status_messages(500), 0);

        // progress of exactly the gain is not enough
        harness.subscriber_position.report(CURRENT_GAIN);
        assert_eq!(harness.connection.send_pending_status_messages(501), 1);

        // one byte beyond the gain trips the scheduler
        harness.subscriber_position.report(CURRENT_GAIN + 1);
        assert_eq!(harness.connection.send_pending_status_messages(502), 0);
        assert_eq!(harness.counters.status_messages_sent().get(), 2);

        // and the gain accounting restarts from the new position
        assert_eq!(harness.connection.send_pending_status_messages(503), 1);
    }

    #[test]
    fn test_status_message_on_timeout_without_progress() {
        let mut sender = MockStatusMessageSender::new();
        sender.expect_send().times(2).return_const(());
        let harness = harness(tracking_loss_handler(), sender);

        harness.connection.enable_status_messages();
        assert_eq!(harness.connection.send_pending_status_messages(500), 0);

        assert_eq!(harness.connection.send_pending_status_messages(500 + SM_TIMEOUT_NS), 1);
        assert_eq!(harness.connection.send_pending_status_messages(500 + SM_TIMEOUT_NS + 1), 0);
        assert_eq!(harness.counters.status_messages_sent().get(), 2);
    }

    #[test]
    fn test_status_message_on_subscriber_term_rotation() {
        let mut sender = MockStatusMessageSender::new();
        sender.expect_send()
            .with(eq(INITIAL_TERM_ID), eq(0u32), eq(INITIAL_WINDOW_SIZE))
            .times(1)
            .return_const(());
        sender.expect_send()
            .with(eq(INITIAL_TERM_ID + 1), eq(10u32), eq(INITIAL_WINDOW_SIZE))
            .times(1)
            .return_const(());
        let harness = harness(tracking_loss_handler(), sender);

        harness.connection.enable_status_messages();
        assert_eq!(harness.connection.send_pending_status_messages(500), 0);

        harness.subscriber_position.report(TERM_CAPACITY as u64 + 10);
        assert_eq!(harness.connection.send_pending_status_messages(501), 0);
    }

    #[test]
    fn test_disable_status_messages_stops_emission() {
        let mut sender = MockStatusMessageSender::new();
        sender.expect_send().times(1).return_const(());
        let harness = harness(tracking_loss_handler(), sender);

        harness.connection.enable_status_messages();
        assert_eq!(harness.connection.send_pending_status_messages(500), 0);

        harness.connection.disable_status_messages();
        assert_eq!(harness.connection.send_pending_status_messages(500 + 2 * SM_TIMEOUT_NS), 0);
        assert_eq!(harness.counters.status_messages_sent().get(), 1);
    }

    #[test]
    fn test_close_releases_owned_resources_exactly_once() {
        let endpoint = Arc::new(ReceiveChannelEndpoint::new(
            "udp://239.0.0.1:40456",
            SocketAddr::from(([127, 0, 0, 1], 40456)),
        ));

        let mut term_buffers = MockTermBuffers::new();
        term_buffers.expect_raw_logs()
            .returning(|| (0..TERM_RING_SIZE).map(|_| Arc::new(LogBuffer::new(TERM_CAPACITY))).collect());
        term_buffers.expect_close().times(1).return_const(());

        let mut subscriber_position = MockPositionIndicator::new();
        subscriber_position.expect_close().times(1).return_const(());

        let mut contiguous_position = MockPositionReporter::new();
        contiguous_position.expect_close().times(1).return_const(());

        let mut highest_position = MockPositionReporter::new();
        highest_position.expect_close().times(1).return_const(());

        let config = EffectiveConnectionConfig {
            term_capacity: TERM_CAPACITY,
            term_window_size: TERM_WINDOW_SIZE,
            initial_window_size: INITIAL_WINDOW_SIZE,
            status_message_timeout_ns: SM_TIMEOUT_NS,
        };

        let connection = Connection::new(
            endpoint,
            5,
            9,
            INITIAL_TERM_ID,
            &config,
            Arc::new(term_buffers),
            Arc::new(tracking_loss_handler()),
            Arc::new(MockStatusMessageSender::new()),
            Arc::new(subscriber_position),
            Arc::new(contiguous_position),
            Arc::new(highest_position),
            Arc::new(ManualClock::new(100)),
            SystemCounters::new(5, 9),
        );

        connection.close();
        connection.close();
    }
}
