//! Configuration for the sync manager.

use entanglement_protocol::MAX_FRAME_LEN;
use std::time::Duration;

/// Configuration for a [`SyncManager`](crate::SyncManager).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Delay before a batch of coalesced YouHave messages is sent.
    pub you_have_timeout: Duration,
    /// Reconnection backoff.
    pub backoff: BackoffConfig,
    /// Default bandwidth budget for each connection.
    pub bandwidth: BandwidthConfig,
    /// How long the side with the greater hash waits when both sides dial.
    pub collision_delay: Duration,
    /// Largest frame payload. Informational; the codec enforces its own cap.
    pub max_frame_len: usize,
}

impl ManagerConfig {
    /// Creates a configuration with the default timings.
    pub fn new() -> Self {
        Self {
            you_have_timeout: Duration::from_millis(500),
            backoff: BackoffConfig::default(),
            bandwidth: BandwidthConfig::default(),
            collision_delay: Duration::from_millis(100),
            max_frame_len: MAX_FRAME_LEN,
        }
    }

    /// Sets the YouHave coalescing delay.
    pub fn with_you_have_timeout(mut self, timeout: Duration) -> Self {
        self.you_have_timeout = timeout;
        self
    }

    /// Sets the reconnection backoff.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the default bandwidth budget.
    pub fn with_bandwidth(mut self, bandwidth: BandwidthConfig) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    /// Sets the dial collision delay.
    pub fn with_collision_delay(mut self, delay: Duration) -> Self {
        self.collision_delay = delay;
        self
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential backoff between connection attempts.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Growth factor per failure.
    pub multiplier: f64,
}

impl BackoffConfig {
    /// Creates a backoff with the given bounds and a multiplier of 2.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
        }
    }

    /// Sets the growth factor.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Calculates the delay after `attempt` consecutive failures (1-indexed).
    ///
    /// Attempt zero means no failure yet and yields no delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(600))
    }
}

/// Token bucket parameters for outgoing bytes.
#[derive(Debug, Clone)]
pub struct BandwidthConfig {
    /// Sustained rate in bytes per second.
    pub chars_per_sec: u64,
    /// Accounting period.
    pub quantum: Duration,
}

impl BandwidthConfig {
    /// Creates a budget.
    pub fn new(chars_per_sec: u64, quantum: Duration) -> Self {
        Self {
            chars_per_sec,
            quantum,
        }
    }

    /// Bytes allowed per quantum.
    pub fn per_quantum(&self) -> u64 {
        ((self.chars_per_sec as f64) * self.quantum.as_secs_f64()) as u64
    }
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self::new(10_000_000, Duration::from_millis(100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_config_builder() {
        let config = ManagerConfig::new()
            .with_you_have_timeout(Duration::ZERO)
            .with_collision_delay(Duration::from_millis(5))
            .with_bandwidth(BandwidthConfig::new(1000, Duration::from_millis(10)));

        assert_eq!(config.you_have_timeout, Duration::ZERO);
        assert_eq!(config.collision_delay, Duration::from_millis(5));
        assert_eq!(config.bandwidth.per_quantum(), 10);
        assert_eq!(config.max_frame_len, 65536);
    }

    #[test]
    fn default_timings() {
        let config = ManagerConfig::default();
        assert_eq!(config.you_have_timeout, Duration::from_millis(500));
        assert_eq!(config.backoff.max_delay, Duration::from_secs(600));
        assert_eq!(config.bandwidth.per_quantum(), 1_000_000);
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let backoff = BackoffConfig::default();

        assert_eq!(backoff.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(backoff.delay_for_attempt(20), Duration::from_secs(600));
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_secs(600));
    }
}
