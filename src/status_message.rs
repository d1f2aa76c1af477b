#[cfg(test)] use mockall::automock;

/// Transport for flow-control feedback from this receiver to the sender: a status
///  message advertises the subscriber's consumption point and the receive window the
///  sender may fill beyond it.
///
/// `send` is non-blocking and best-effort - a status message lost to congestion is
///  simply re-sent on the scheduler's next trigger, so failures are not reported.
#[cfg_attr(test, automock)]
pub trait StatusMessageSender: Send + Sync + 'static {
    fn send(&self, term_id: u32, term_offset: u32, window_size: u32);
}
