use anyhow::bail;
use rustc_hash::FxHashMap;
use std::time::Duration;

/// Receiver-side configuration, shared by all connections created on one endpoint.
pub struct ReceiverConfig {
    /// Capacity of a single term buffer in bytes. Must be a power of two: position
    ///  arithmetic splits a 64-bit position into term count and term offset by shifting,
    ///  and the ring rotation relies on terms being uniform.
    pub term_capacity: usize,

    /// The window advertised to senders before any feedback from the subscriber side.
    ///  Clamped to the term window at connection setup.
    pub initial_window_size: u32,

    /// Maximum silence between two status messages on a connection. A lost SM stalls the
    ///  sender until this fires, so configure it well below the sender's give-up timeout.
    pub status_message_timeout: Duration,

    /// Upper bound for outstanding credit, before clamping to half a term. This caps how
    ///  far a sender may run ahead of the subscriber.
    pub default_subscription_window: u32,

    /// per-stream overrides of the subscription window
    pub specific_subscription_windows: FxHashMap<u32, u32>,
}

impl ReceiverConfig {
    pub fn default_for_term_capacity(term_capacity: usize) -> ReceiverConfig {
        ReceiverConfig {
            term_capacity,
            initial_window_size: (term_capacity / 2) as u32,
            status_message_timeout: Duration::from_millis(200),
            default_subscription_window: (term_capacity / 2) as u32,
            specific_subscription_windows: FxHashMap::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.term_capacity.is_power_of_two() {
            bail!("term capacity must be a power of two, was {}", self.term_capacity);
        }
        if self.term_capacity < 1024 {
            bail!("term capacity of {} is too small to hold meaningful frames", self.term_capacity);
        }
        if self.initial_window_size == 0 {
            bail!("initial window size must be positive");
        }
        if self.default_subscription_window == 0 {
            bail!("subscription window must be positive");
        }
        if self.status_message_timeout.is_zero() {
            bail!("status message timeout must be positive");
        }

        Ok(())
    }

    /// Resolve the quantities a single connection runs with. The term window is capped
    ///  at half a term so that the sender can never wrap into bytes the subscriber has
    ///  not drained.
    pub fn effective_connection_config(&self, stream_id: u32) -> EffectiveConnectionConfig {
        let subscription_window = self.specific_subscription_windows
            .get(&stream_id)
            .copied()
            .unwrap_or(self.default_subscription_window);

        EffectiveConnectionConfig {
            term_capacity: self.term_capacity,
            term_window_size: u32::min((self.term_capacity / 2) as u32, subscription_window),
            initial_window_size: self.initial_window_size,
            status_message_timeout_ns: self.status_message_timeout.as_nanos() as u64,
        }
    }
}

pub struct EffectiveConnectionConfig {
    pub term_capacity: usize,
    pub term_window_size: u32,
    pub initial_window_size: u32,
    pub status_message_timeout_ns: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ReceiverConfig::default_for_term_capacity(65536).validate().is_ok());
    }

    #[rstest]
    #[case::not_a_power_of_two(65537)]
    #[case::too_small(512)]
    fn test_validate_rejects_bad_term_capacity(#[case] term_capacity: usize) {
        let config = ReceiverConfig::default_for_term_capacity(65536);
        let config = ReceiverConfig { term_capacity, ..config };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_windows_and_timeout() {
        let base = || ReceiverConfig::default_for_term_capacity(65536);

        assert!(ReceiverConfig { initial_window_size: 0, ..base() }.validate().is_err());
        assert!(ReceiverConfig { default_subscription_window: 0, ..base() }.validate().is_err());
        assert!(ReceiverConfig { status_message_timeout: Duration::ZERO, ..base() }.validate().is_err());
    }

    #[rstest]
    #[case::window_caps_at_half_term(65536, 65536, 32768)]
    #[case::window_below_half_term(65536, 8192, 8192)]
    fn test_term_window_clamping(#[case] term_capacity: usize, #[case] subscription_window: u32, #[case] expected: u32) {
        let config = ReceiverConfig {
            default_subscription_window: subscription_window,
            ..ReceiverConfig::default_for_term_capacity(term_capacity)
        };

        assert_eq!(config.effective_connection_config(1).term_window_size, expected);
    }

    #[test]
    fn test_specific_stream_override_wins() {
        let mut config = ReceiverConfig::default_for_term_capacity(65536);
        config.specific_subscription_windows.insert(9, 4096);

        assert_eq!(config.effective_connection_config(9).term_window_size, 4096);
        assert_eq!(config.effective_connection_config(1).term_window_size, 32768);
    }
}
